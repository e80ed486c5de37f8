//! User-space USB man-in-the-middle proxy.
//!
//! The proxy opens a real USB peripheral through the host-side stack
//! ([`upstream`]), then impersonates it towards a downstream host through the
//! Linux raw-gadget interface ([`raw_gadget`]). Control transfers are spliced
//! by the [`ep0`] engine; bulk and interrupt traffic is bridged per endpoint
//! by the [`forwarder`]. The [`proxy`] module wires the pieces together.

use std::fmt;

pub mod control;
pub mod descriptors;
pub mod endpoint;
pub mod ep0;
pub mod forwarder;
pub mod gadget;
pub mod proxy;
pub mod raw_gadget;
pub mod upstream;

#[derive(Debug)]
pub enum Error {
    /// The upstream device is missing, unresponsive, or failed to reset.
    UpstreamUnavailable(rusb::Error),
    /// A raw-gadget command failed.
    GadgetIo(nix::Error),
    /// An upstream control transfer failed or was rejected.
    ControlTransfer(rusb::Error),
    /// An upstream bulk or interrupt transfer failed other than by timeout.
    BulkTransfer(rusb::Error),
    /// Malformed data on the wire or in a descriptor.
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UpstreamUnavailable(err) => write!(f, "upstream device unavailable: {}", err),
            Error::GadgetIo(err) => write!(f, "raw gadget operation failed: {}", err),
            Error::ControlTransfer(err) => write!(f, "upstream control transfer failed: {}", err),
            Error::BulkTransfer(err) => write!(f, "upstream data transfer failed: {}", err),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::UpstreamUnavailable(err)
            | Error::ControlTransfer(err)
            | Error::BulkTransfer(err) => Some(err),
            Error::GadgetIo(err) => Some(err),
            Error::Protocol(_) => None,
        }
    }
}
