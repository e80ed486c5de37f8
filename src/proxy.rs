//! The supervisor: ordered startup, the clean-connection sequence, and
//! hand-off to the EP0 engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::descriptors::DescriptorCache;
use crate::ep0::Ep0Engine;
use crate::gadget::{Event, EventKind, GadgetBus, UsbSpeed};
use crate::upstream::UpstreamBus;
use crate::Result;

/// Pause after a stale session ends, so the downstream host sees a proper
/// detach before the proxy starts answering again.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// UDC selection for the gadget side.
pub struct ProxyConfig {
    pub driver: String,
    pub device: String,
}

pub struct Proxy<G: GadgetBus + 'static, U: UpstreamBus + 'static> {
    gadget: Arc<G>,
    upstream: Arc<U>,
    cache: DescriptorCache,
    config: ProxyConfig,
    running: Arc<AtomicBool>,
}

impl<G: GadgetBus + 'static, U: UpstreamBus + 'static> Proxy<G, U> {
    pub fn new(
        gadget: Arc<G>,
        upstream: Arc<U>,
        cache: DescriptorCache,
        config: ProxyConfig,
        running: Arc<AtomicBool>,
    ) -> Proxy<G, U> {
        Proxy {
            gadget,
            upstream,
            cache,
            config,
            running,
        }
    }

    /// Brings the gadget up and runs the event loop until shutdown.
    pub fn run(self) -> Result<()> {
        self.gadget
            .init(&self.config.driver, &self.config.device, UsbSpeed::High)?;
        self.gadget.run()?;
        info!(
            "gadget bound to {}/{}, waiting for the downstream host",
            self.config.driver, self.config.device
        );

        let pending = match self.ensure_clean_connection() {
            Ok(pending) => pending,
            Err(err) => {
                if !self.running.load(Ordering::SeqCst) {
                    // shutdown signal interrupted the wait
                    return Ok(());
                }
                return Err(err);
            }
        };

        let mut engine = Ep0Engine::new(
            self.gadget.clone(),
            self.upstream.clone(),
            self.cache,
            self.running.clone(),
        );
        engine.run(pending);

        info!("event loop finished, shutting down");
        Ok(())
    }

    /// Makes sure the main loop starts against a fresh connection.
    ///
    /// The kernel gadget may still be attached from a previous run of the
    /// proxy; answering setup packets for that session against freshly
    /// cached descriptors would confuse the downstream host. If the very
    /// first event shows an active session (CONNECT or CONTROL), drain until
    /// it ends, settle, and wait for a new one.
    ///
    /// Returns the entry event the engine should process first: the fresh
    /// CONNECT, or a CONTROL observed while waiting (some controllers never
    /// deliver the CONNECT).
    fn ensure_clean_connection(&self) -> Result<Option<Event>> {
        let first = self.gadget.fetch_event()?;
        match first.kind {
            EventKind::Connect | EventKind::Control => {
                warn!(
                    "gadget already attached from a previous session ({:?}), waiting for it to end",
                    first.kind
                );
                self.drain_stale_session()?;
            }
            EventKind::Disconnect | EventKind::Reset => {
                info!("gadget detached, ready for a fresh connection");
            }
            EventKind::Invalid => {}
            EventKind::Suspend | EventKind::Resume => {
                debug!("ignoring {:?} before the first connection", first.kind);
            }
        }

        info!("waiting for the downstream host to connect");
        while self.running.load(Ordering::SeqCst) {
            let event = self.gadget.fetch_event()?;
            match event.kind {
                EventKind::Connect => {
                    info!("downstream host connected");
                    return Ok(Some(event));
                }
                EventKind::Control => {
                    info!("control traffic without a connect event, entering main loop");
                    return Ok(Some(event));
                }
                EventKind::Disconnect | EventKind::Reset | EventKind::Invalid => continue,
                EventKind::Suspend | EventKind::Resume => {
                    debug!("ignoring {:?} while waiting for a connection", event.kind);
                }
            }
        }

        Ok(None)
    }

    fn drain_stale_session(&self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            let event = self.gadget.fetch_event()?;
            match event.kind {
                EventKind::Disconnect | EventKind::Reset => {
                    info!("stale session ended ({:?})", event.kind);
                    thread::sleep(SETTLE_DELAY);
                    return Ok(());
                }
                EventKind::Invalid => continue,
                other => debug!("ignoring {:?} while draining the stale session", other),
            }
        }
        Ok(())
    }
}
