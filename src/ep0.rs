//! The EP0 engine: event loop and control-transfer splicer.
//!
//! One setup packet is in flight at a time; the engine is the only user of
//! EP0 and of the upstream control channel, so no locking is needed along
//! the control path.
//!
//! ACK/STALL ordering is part of the downstream contract:
//! - an OUT setup with data is ACKed by reading the data stage, so the
//!   upstream transfer happens *after* the downstream ACK;
//! - an OUT setup without data is forwarded first and ACKed only on success;
//! - SET_CONFIGURATION is ACKed only after the upstream is configured, the
//!   gadget committed, and every endpoint is bound;
//! - every downstream-visible failure is a STALL, never a silent drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::control::{standard_request, descriptor_type, Direction, Request};
use crate::descriptors::{clamp_max_packet_size0, DescriptorCache};
use crate::forwarder::{EndpointBinding, Forwarder};
use crate::gadget::{Event, EventKind, GadgetBus};
use crate::upstream::UpstreamBus;
use crate::Result;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Ep0Engine<G: GadgetBus + 'static, U: UpstreamBus + 'static> {
    gadget: Arc<G>,
    upstream: Arc<U>,
    cache: DescriptorCache,
    forwarder: Forwarder<G, U>,
    running: Arc<AtomicBool>,
    host_connected: bool,
    configured: bool,
}

impl<G: GadgetBus + 'static, U: UpstreamBus + 'static> Ep0Engine<G, U> {
    pub fn new(
        gadget: Arc<G>,
        upstream: Arc<U>,
        cache: DescriptorCache,
        running: Arc<AtomicBool>,
    ) -> Ep0Engine<G, U> {
        let forwarder = Forwarder::new(gadget.clone(), upstream.clone());
        Ep0Engine {
            gadget,
            upstream,
            cache,
            forwarder,
            running,
            host_connected: false,
            configured: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_host_connected(&self) -> bool {
        self.host_connected
    }

    pub fn workers_running(&self) -> bool {
        self.forwarder.is_running()
    }

    pub fn bindings(&self) -> &[EndpointBinding] {
        self.forwarder.bindings()
    }

    /// Runs the event loop until the shared running flag clears. `pending`
    /// carries an event the supervisor already fetched while establishing a
    /// clean connection.
    pub fn run(&mut self, pending: Option<Event>) {
        if let Some(event) = pending {
            self.handle_event(event);
        }

        let mut last_liveness = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            if last_liveness.elapsed() >= LIVENESS_INTERVAL {
                if self.configured {
                    info!("proxy active, forwarding traffic");
                } else {
                    info!("waiting for control requests from the downstream host");
                }
                last_liveness = Instant::now();
            }

            let event = match self.gadget.fetch_event() {
                Ok(event) => event,
                Err(err) => {
                    if !self.running.load(Ordering::SeqCst) {
                        // interrupted by shutdown signal
                        break;
                    }
                    error!("event fetch failed: {}", err);
                    self.teardown_session();
                    continue;
                }
            };

            self.handle_event(event);
        }

        // orderly shutdown: workers first, handles are closed by the owners
        self.forwarder.teardown();
    }

    /// Dispatches one gadget event. Recoverable failures are resolved here
    /// (logged, stalled, or torn down); nothing propagates.
    pub fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Invalid => {}
            EventKind::Connect => {
                debug!("downstream host connected");
                self.host_connected = true;
                if self.configured {
                    // a configured session can only be stale after reconnect
                    info!("host reconnected, discarding previous session");
                    self.teardown_session();
                }
            }
            EventKind::Suspend => info!("downstream host suspended the bus"),
            EventKind::Resume => info!("downstream host resumed the bus"),
            EventKind::Reset | EventKind::Disconnect => {
                // some controllers report one as the other; treat identically
                info!("downstream {:?}, tearing down session", event.kind);
                if event.kind == EventKind::Disconnect {
                    self.host_connected = false;
                }
                self.teardown_session();
            }
            EventKind::Control => self.handle_control(&event.data),
        }
    }

    /// Stops forwarding and resets the upstream so the next enumeration sees
    /// a clean device. Idempotent.
    fn teardown_session(&mut self) {
        if !self.configured && !self.forwarder.is_running() {
            return;
        }

        self.forwarder.teardown();
        if let Err(err) = self.upstream.reset() {
            error!("upstream reset failed: {}", err);
        }
        self.configured = false;
        info!("session torn down, waiting for re-enumeration");
    }

    fn handle_control(&mut self, data: &[u8]) {
        if data.len() < 8 {
            error!("control event carried {} bytes, expected 8", data.len());
            self.stall();
            return;
        }

        let req = match Request::parse(&data[..8]) {
            Ok(req) => req,
            Err(err) => {
                error!("unparseable setup packet: {}", err);
                self.stall();
                return;
            }
        };

        debug!(
            "EP0 {:?} {:?} request={:#04x} value={:#06x} index={:#06x} length={}",
            req.direction(),
            req.request_kind(),
            req.request,
            req.value,
            req.index,
            req.length
        );

        // The gadget controller assigns the bus address itself; forwarding
        // SET_ADDRESS would corrupt the upstream device's state.
        if req.is_standard() && req.request == standard_request::SET_ADDRESS {
            debug!("SET_ADDRESS {} handled by the controller", req.value);
            self.ack_out();
            return;
        }

        if req.is_standard()
            && req.request == standard_request::GET_STATUS
            && req.direction() == Direction::DeviceToHost
        {
            // bus-powered, no remote wakeup
            self.write_reply(&[0x00, 0x00][..(req.length as usize).min(2)]);
            return;
        }

        if req.is_standard()
            && req.request == standard_request::GET_CONFIGURATION
            && req.direction() == Direction::DeviceToHost
        {
            let value = if self.configured { 1 } else { 0 };
            self.write_reply(&[value][..(req.length as usize).min(1)]);
            return;
        }

        if req.is_standard()
            && req.request == standard_request::SET_CONFIGURATION
            && !self.configured
        {
            match self.configure(req.value as u8) {
                Ok(count) => {
                    self.configured = true;
                    self.ack_out();
                    info!(
                        "configuration {} active, {} endpoint(s) forwarded",
                        req.value, count
                    );
                }
                Err(err) => {
                    error!("configuration {} failed: {}", req.value, err);
                    self.forwarder.teardown();
                    self.stall();
                }
            }
            return;
        }

        if req.direction() == Direction::DeviceToHost {
            self.forward_in(&req);
        } else {
            self.forward_out(&req);
        }
    }

    /// SET_CONFIGURATION sequence. The ordering is part of the contract: the
    /// upstream must be configured and every endpoint bound before the
    /// downstream host sees the ACK and starts endpoint traffic.
    fn configure(&mut self, value: u8) -> Result<usize> {
        self.upstream.set_configuration(value)?;
        self.gadget.configure()?;
        self.forwarder.setup(value)
    }

    fn forward_in(&mut self, req: &Request) {
        if req.is_standard() && req.request == standard_request::GET_DESCRIPTOR {
            let (kind, index) = req.descriptor_type_index();
            match kind {
                descriptor_type::DEVICE => {
                    let mut data = self.cache.device().to_vec();
                    clamp_max_packet_size0(&mut data);
                    data.truncate(req.length as usize);
                    self.write_reply(&data);
                    return;
                }
                descriptor_type::CONFIGURATION => {
                    if let Some(blob) = self.cache.config(index) {
                        let end = blob.len().min(req.length as usize);
                        let data = blob[..end].to_vec();
                        self.write_reply(&data);
                        return;
                    }
                }
                descriptor_type::STRING => {
                    if let Some(blob) = self.cache.string(index) {
                        let end = blob.len().min(req.length as usize);
                        let data = blob[..end].to_vec();
                        self.write_reply(&data);
                        return;
                    }
                }
                _ => {}
            }
            // uncached type or index: ask the device like any other request
        }

        match self.upstream.control_in(
            req.request_type,
            req.request,
            req.value,
            req.index,
            req.length,
            CONTROL_TIMEOUT,
        ) {
            Ok(data) => self.write_reply(&data),
            Err(err) => {
                error!("upstream rejected IN request {:#04x}: {}", req.request, err);
                self.stall();
            }
        }
    }

    fn forward_out(&mut self, req: &Request) {
        if req.length > 0 {
            // reading the data stage ACKs the setup, so the upstream call
            // happens after the downstream host already saw success
            let data = match self.gadget.ep0_read(req.length as usize) {
                Ok(data) => data,
                Err(err) => {
                    error!("EP0 data stage read failed: {}", err);
                    self.stall();
                    return;
                }
            };

            if let Err(err) = self.upstream.control_out(
                req.request_type,
                req.request,
                req.value,
                req.index,
                &data,
                CONTROL_TIMEOUT,
            ) {
                // the alternative would leave the downstream host hung on an
                // already-ACKed transfer
                warn!(
                    "upstream rejected OUT request {:#04x} after downstream ack: {}",
                    req.request, err
                );
            }
        } else {
            match self.upstream.control_out(
                req.request_type,
                req.request,
                req.value,
                req.index,
                &[],
                CONTROL_TIMEOUT,
            ) {
                Ok(()) => self.ack_out(),
                Err(err) => {
                    error!("upstream rejected OUT request {:#04x}: {}", req.request, err);
                    self.stall();
                }
            }
        }
    }

    fn write_reply(&self, data: &[u8]) {
        if let Err(err) = self.gadget.ep0_write(data) {
            error!("EP0 write of {} bytes failed: {}", data.len(), err);
            self.stall();
        }
    }

    fn ack_out(&self) {
        if let Err(err) = self.gadget.ep0_read(0) {
            error!("EP0 ack failed: {}", err);
            self.stall();
        }
    }

    fn stall(&self) {
        if let Err(err) = self.gadget.ep0_stall() {
            error!("EP0 stall failed: {}", err);
        }
    }
}
