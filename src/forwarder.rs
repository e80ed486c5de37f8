//! Per-endpoint bulk/interrupt forwarding.
//!
//! Every bound endpoint gets a FIFO queue and a reader/writer thread pair.
//! The reader fills the queue from one side of the splice, the writer drains
//! it into the other; direction decides which side is which. Workers poll a
//! shared stop flag between short blocking calls, so teardown converges
//! without cancelling I/O mid-transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::endpoint::{EndpointInfo, EndpointType};
use crate::gadget::GadgetBus;
use crate::upstream::UpstreamBus;
use crate::{Error, Result};

const BULK_CHUNK: usize = 4096;
const INTERRUPT_CHUNK: usize = 64;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
const QUEUE_WAIT: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_millis(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

fn chunk_size(kind: EndpointType) -> usize {
    match kind {
        EndpointType::Interrupt => INTERRUPT_CHUNK,
        _ => BULK_CHUNK,
    }
}

/// A non-control endpoint bound into the active configuration: the upstream
/// address plus the handle the gadget assigned on enable.
#[derive(Clone, Debug)]
pub struct EndpointBinding {
    pub info: EndpointInfo,
    pub handle: u16,
}

pub struct Forwarder<G: GadgetBus + 'static, U: UpstreamBus + 'static> {
    gadget: Arc<G>,
    upstream: Arc<U>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    bindings: Vec<EndpointBinding>,
}

impl<G: GadgetBus + 'static, U: UpstreamBus + 'static> Forwarder<G, U> {
    pub fn new(gadget: Arc<G>, upstream: Arc<U>) -> Forwarder<G, U> {
        Forwarder {
            gadget,
            upstream,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Enables every bulk/interrupt endpoint of the given configuration and
    /// starts its worker pair. Returns the number of bound endpoints.
    ///
    /// On error the partially built state is left for [`teardown`] to clean
    /// up, which the caller must do before stalling the host.
    ///
    /// [`teardown`]: Forwarder::teardown
    pub fn setup(&mut self, config_value: u8) -> Result<usize> {
        let endpoints = self.upstream.endpoints(config_value)?;

        // fresh flag per generation: late workers of a torn-down generation
        // must never observe the new one as running
        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();

        for info in endpoints {
            match info.kind {
                EndpointType::Control => continue,
                EndpointType::Isochronous => {
                    warn!(
                        "endpoint {:#04x} is isochronous, not forwarded",
                        info.address
                    );
                    continue;
                }
                EndpointType::Bulk | EndpointType::Interrupt => {}
            }

            let handle = self.gadget.ep_enable(&info)?;
            info!(
                "endpoint {:#04x} ({:?}, {} bytes) enabled as gadget ep {}",
                info.address, info.kind, info.max_packet_size, handle
            );

            let (sender, receiver) = mpsc::channel();
            if info.is_in() {
                self.workers.push(spawn_upstream_reader(
                    self.upstream.clone(),
                    info.clone(),
                    running.clone(),
                    sender,
                ));
                self.workers.push(spawn_gadget_writer(
                    self.gadget.clone(),
                    handle,
                    running.clone(),
                    receiver,
                ));
            } else {
                self.workers.push(spawn_gadget_reader(
                    self.gadget.clone(),
                    handle,
                    info.kind,
                    running.clone(),
                    sender,
                ));
                self.workers.push(spawn_upstream_writer(
                    self.upstream.clone(),
                    info.clone(),
                    running.clone(),
                    receiver,
                ));
            }

            self.bindings.push(EndpointBinding { info, handle });
        }

        Ok(self.bindings.len())
    }

    /// Stops all workers and clears the bindings. Safe to call repeatedly and
    /// with nothing set up.
    pub fn teardown(&mut self) {
        if self.workers.is_empty() && self.bindings.is_empty() {
            return;
        }

        info!("stopping {} endpoint worker(s)", self.workers.len());
        self.running.store(false, Ordering::SeqCst);

        for worker in self.workers.drain(..) {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("endpoint worker did not stop within {:?}", JOIN_TIMEOUT);
            }
        }

        for binding in self.bindings.drain(..) {
            // after a bus reset the handle is gone anyway
            if let Err(err) = self.gadget.ep_disable(binding.handle) {
                debug!("disable of gadget ep {} failed: {}", binding.handle, err);
            }
        }
    }

    /// Whether any worker threads are live.
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn bindings(&self) -> &[EndpointBinding] {
        &self.bindings
    }
}

impl<G: GadgetBus + 'static, U: UpstreamBus + 'static> Drop for Forwarder<G, U> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// IN direction, producer side: real device -> queue.
fn spawn_upstream_reader<U: UpstreamBus + 'static>(
    upstream: Arc<U>,
    info: EndpointInfo,
    running: Arc<AtomicBool>,
    queue: Sender<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("reader started for upstream ep {:#04x}", info.address);
        let chunk = chunk_size(info.kind);

        while running.load(Ordering::SeqCst) {
            match upstream.read_endpoint(&info, chunk, READ_TIMEOUT) {
                Ok(data) => {
                    if data.is_empty() {
                        // idle timeout
                        continue;
                    }
                    trace!("ep {:#04x} -> host: {} bytes", info.address, data.len());
                    if queue.send(data).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if running.load(Ordering::SeqCst) {
                        error!("read from upstream ep {:#04x} failed: {}", info.address, err);
                    }
                    break;
                }
            }
        }
        debug!("reader finished for upstream ep {:#04x}", info.address);
    })
}

/// IN direction, consumer side: queue -> gadget endpoint.
fn spawn_gadget_writer<G: GadgetBus + 'static>(
    gadget: Arc<G>,
    handle: u16,
    running: Arc<AtomicBool>,
    queue: Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("writer started for gadget ep {}", handle);

        while running.load(Ordering::SeqCst) {
            match queue.recv_timeout(QUEUE_WAIT) {
                Ok(data) => {
                    if let Err(err) = gadget.ep_write(handle, &data) {
                        if running.load(Ordering::SeqCst) {
                            warn!("write to gadget ep {} failed: {}", handle, err);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("writer finished for gadget ep {}", handle);
    })
}

/// OUT direction, producer side: gadget endpoint -> queue.
fn spawn_gadget_reader<G: GadgetBus + 'static>(
    gadget: Arc<G>,
    handle: u16,
    kind: EndpointType,
    running: Arc<AtomicBool>,
    queue: Sender<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("reader started for gadget ep {}", handle);
        let chunk = chunk_size(kind);

        while running.load(Ordering::SeqCst) {
            match gadget.ep_read(handle, chunk) {
                Ok(data) => {
                    if data.is_empty() {
                        // transient empty read, retry
                        continue;
                    }
                    trace!("host -> ep {}: {} bytes", handle, data.len());
                    if queue.send(data).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("read from gadget ep {} failed: {}", handle, err);
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
        debug!("reader finished for gadget ep {}", handle);
    })
}

/// OUT direction, consumer side: queue -> real device.
fn spawn_upstream_writer<U: UpstreamBus + 'static>(
    upstream: Arc<U>,
    info: EndpointInfo,
    running: Arc<AtomicBool>,
    queue: Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("writer started for upstream ep {:#04x}", info.address);

        while running.load(Ordering::SeqCst) {
            match queue.recv_timeout(QUEUE_WAIT) {
                Ok(data) => match upstream.write_endpoint(&info, &data, WRITE_TIMEOUT) {
                    Ok(()) => {
                        trace!("host -> ep {:#04x}: {} bytes", info.address, data.len())
                    }
                    Err(Error::BulkTransfer(rusb::Error::Timeout)) => {
                        warn!(
                            "write to upstream ep {:#04x} timed out, dropping {} bytes",
                            info.address,
                            data.len()
                        );
                    }
                    Err(err) => {
                        if running.load(Ordering::SeqCst) {
                            error!("write to upstream ep {:#04x} failed: {}", info.address, err);
                        }
                        break;
                    }
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("writer finished for upstream ep {:#04x}", info.address);
    })
}
