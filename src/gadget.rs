//! The device-side bus seam: everything the proxy needs from a USB device
//! controller, one method per raw-gadget command.

use num_enum::FromPrimitive;

use crate::endpoint::EndpointInfo;
use crate::Result;

/// Bus speed requested from the controller at init time.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UsbSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
}

/// Event codes delivered by the gadget interface.
///
/// Codes outside the known range decode to `Invalid`, which the event loop
/// ignores.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromPrimitive)]
pub enum EventKind {
    #[num_enum(default)]
    Invalid = 0,
    Connect = 1,
    Control = 2,
    Suspend = 3,
    Resume = 4,
    Reset = 5,
    Disconnect = 6,
}

/// One event fetched from the gadget. For `Control` events the payload is the
/// 8-byte setup packet.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(kind: EventKind) -> Event {
        Event {
            kind,
            data: Vec::new(),
        }
    }
}

/// Device-controller capability set.
///
/// [`crate::raw_gadget::RawGadget`] implements this against `/dev/raw-gadget`;
/// tests substitute scripted fakes. Implementations must be callable from the
/// event-loop thread and the endpoint workers concurrently (the kernel
/// interface is thread-safe for distinct endpoints).
pub trait GadgetBus: Send + Sync {
    /// Binds the gadget to a UDC and selects the bus speed.
    fn init(&self, driver: &str, device: &str, speed: UsbSpeed) -> Result<()>;

    /// Starts event delivery. Must follow `init`.
    fn run(&self) -> Result<()>;

    /// Blocks until the controller delivers the next event.
    fn fetch_event(&self) -> Result<Event>;

    /// Reads up to `length` bytes from EP0. A zero-length read is the ACK for
    /// an OUT setup without a data stage.
    fn ep0_read(&self, length: usize) -> Result<Vec<u8>>;

    /// Writes the data stage of an IN setup. A zero-length write is the ACK
    /// for an IN setup the host requested with zero length.
    fn ep0_write(&self, data: &[u8]) -> Result<usize>;

    /// Signals "request not supported / failed" to the downstream host.
    fn ep0_stall(&self) -> Result<()>;

    /// Enables an endpoint and returns the handle used for subsequent I/O.
    fn ep_enable(&self, endpoint: &EndpointInfo) -> Result<u16>;

    /// Disables a previously enabled endpoint.
    fn ep_disable(&self, handle: u16) -> Result<()>;

    /// Reads from an OUT endpoint. May legitimately return an empty buffer on
    /// transient conditions; callers retry.
    fn ep_read(&self, handle: u16, max_len: usize) -> Result<Vec<u8>>;

    /// Writes to an IN endpoint.
    fn ep_write(&self, handle: u16, data: &[u8]) -> Result<usize>;

    /// Commits the configuration after all endpoints are enabled.
    fn configure(&self) -> Result<()>;
}
