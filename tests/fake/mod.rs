//! Scripted in-memory implementations of the two bus seams.
//!
//! `FakeGadget` plays the downstream side (events, EP0, endpoint I/O) and
//! `FakeUpstream` the real device. Both record every call into a shared
//! journal so tests can assert cross-component ordering, not just per-bus
//! traffic.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use usb_proxy::control::{descriptor_type, standard_request};
use usb_proxy::endpoint::{EndpointInfo, EndpointType};
use usb_proxy::gadget::{Event, GadgetBus, UsbSpeed};
use usb_proxy::upstream::UpstreamBus;
use usb_proxy::{Error, Result};

/// Simulated blocking delay for idle polls against the fakes.
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Init {
        driver: String,
        device: String,
        speed: u8,
    },
    Run,
    Configure,
    Ep0Stall,
    Ep0Read {
        length: usize,
    },
    Ep0Write {
        data: Vec<u8>,
    },
    EpEnable {
        address: u8,
    },
    EpDisable {
        handle: u16,
    },
    ControlIn {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    },
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    SetConfiguration {
        value: u8,
    },
    Reset,
}

pub type Journal = Arc<Mutex<Vec<Call>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn drain(journal: &Journal) -> Vec<Call> {
    journal.lock().unwrap().drain(..).collect()
}

/// Index of the first matching call, for ordering assertions.
pub fn position(calls: &[Call], wanted: &Call) -> usize {
    calls
        .iter()
        .position(|call| call == wanted)
        .unwrap_or_else(|| panic!("{:?} not found in {:#?}", wanted, calls))
}

// ---------------------------------------------------------------------------
// fixtures

/// Device descriptor of a full-speed vendor device with an 8-byte EP0.
pub fn sample_device_descriptor() -> Vec<u8> {
    vec![
        0x12, 0x01, 0x00, 0x02, 0xff, 0x00, 0x00, 0x08, // ... bMaxPacketSize0 = 8
        0x83, 0x04, 0x50, 0x57, 0x00, 0x01, 0x01, 0x02, 0x03, 0x01,
    ]
}

pub fn bulk_in_endpoint() -> EndpointInfo {
    EndpointInfo {
        address: 0x81,
        kind: EndpointType::Bulk,
        max_packet_size: 512,
        interval: 0,
    }
}

pub fn bulk_out_endpoint() -> EndpointInfo {
    EndpointInfo {
        address: 0x02,
        kind: EndpointType::Bulk,
        max_packet_size: 512,
        interval: 0,
    }
}

pub fn interrupt_in_endpoint() -> EndpointInfo {
    EndpointInfo {
        address: 0x83,
        kind: EndpointType::Interrupt,
        max_packet_size: 8,
        interval: 10,
    }
}

/// A full configuration descriptor hierarchy: one interface carrying the
/// given endpoints, with `wTotalLength` filled in.
pub fn config_blob(value: u8, endpoints: &[EndpointInfo]) -> Vec<u8> {
    let total = (9 + 9 + 7 * endpoints.len()) as u16;
    let total_bytes = total.to_le_bytes();

    let mut blob = vec![
        9,
        descriptor_type::CONFIGURATION,
        total_bytes[0],
        total_bytes[1],
        1,
        value,
        0,
        0x80,
        50,
    ];
    blob.extend_from_slice(&[
        9,
        descriptor_type::INTERFACE,
        0,
        0,
        endpoints.len() as u8,
        0xff,
        0,
        0,
        0,
    ]);
    for endpoint in endpoints {
        blob.extend_from_slice(&endpoint.descriptor()[..7]);
    }
    blob
}

pub fn string_blob(text: &str) -> Vec<u8> {
    let mut blob = vec![0, descriptor_type::STRING];
    for unit in text.encode_utf16() {
        blob.extend_from_slice(&unit.to_le_bytes());
    }
    blob[0] = blob.len() as u8;
    blob
}

// ---------------------------------------------------------------------------
// gadget side

pub struct FakeGadget {
    journal: Journal,
    events: Mutex<VecDeque<Event>>,
    stop_when_drained: Mutex<Option<Arc<AtomicBool>>>,
    ep0_out: Mutex<VecDeque<Vec<u8>>>,
    enabled: Mutex<Vec<(u8, u16)>>,
    next_handle: Mutex<u16>,
    host_chunks: Mutex<HashMap<u16, VecDeque<Vec<u8>>>>,
    written: Mutex<HashMap<u16, Vec<Vec<u8>>>>,
    fail_configure: AtomicBool,
}

impl FakeGadget {
    pub fn new(journal: Journal) -> FakeGadget {
        FakeGadget {
            journal,
            events: Mutex::new(VecDeque::new()),
            stop_when_drained: Mutex::new(None),
            ep0_out: Mutex::new(VecDeque::new()),
            enabled: Mutex::new(Vec::new()),
            next_handle: Mutex::new(1),
            host_chunks: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            fail_configure: AtomicBool::new(false),
        }
    }

    fn record(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }

    /// Queues an event for `fetch_event`.
    pub fn push_event(&self, event: Event) {
        self.events.lock().unwrap().push_back(event);
    }

    /// Clears the given flag once the scripted events run out, so loops
    /// driven by `fetch_event` terminate.
    pub fn stop_when_drained(&self, flag: Arc<AtomicBool>) {
        *self.stop_when_drained.lock().unwrap() = Some(flag);
    }

    /// Scripts the data stage of the next OUT control transfer.
    pub fn push_ep0_data(&self, data: Vec<u8>) {
        self.ep0_out.lock().unwrap().push_back(data);
    }

    /// Scripts a chunk the downstream host sends on an OUT endpoint.
    pub fn push_host_chunk(&self, address: u8, data: Vec<u8>) {
        let handle = self.handle_for(address);
        self.host_chunks
            .lock()
            .unwrap()
            .entry(handle)
            .or_insert_with(VecDeque::new)
            .push_back(data);
    }

    /// Chunks the proxy delivered to the downstream host on an IN endpoint.
    pub fn sent_to_host(&self, address: u8) -> Vec<Vec<u8>> {
        let handle = self.handle_for(address);
        self.written
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handle_for(&self, address: u8) -> u16 {
        self.enabled
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, handle)| *handle)
            .unwrap_or_else(|| panic!("endpoint {:#04x} was never enabled", address))
    }

    pub fn fail_configure(&self) {
        self.fail_configure.store(true, Ordering::SeqCst);
    }
}

impl GadgetBus for FakeGadget {
    fn init(&self, driver: &str, device: &str, speed: UsbSpeed) -> Result<()> {
        self.record(Call::Init {
            driver: driver.to_string(),
            device: device.to_string(),
            speed: speed as u8,
        });
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.record(Call::Run);
        Ok(())
    }

    fn fetch_event(&self) -> Result<Event> {
        if let Some(event) = self.events.lock().unwrap().pop_front() {
            return Ok(event);
        }

        if let Some(flag) = self.stop_when_drained.lock().unwrap().as_ref() {
            flag.store(false, Ordering::SeqCst);
        }
        Err(Error::GadgetIo(nix::Error::Sys(nix::errno::Errno::ENODEV)))
    }

    fn ep0_read(&self, length: usize) -> Result<Vec<u8>> {
        self.record(Call::Ep0Read { length });
        let mut data = self
            .ep0_out
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        data.truncate(length);
        Ok(data)
    }

    fn ep0_write(&self, data: &[u8]) -> Result<usize> {
        self.record(Call::Ep0Write {
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn ep0_stall(&self) -> Result<()> {
        self.record(Call::Ep0Stall);
        Ok(())
    }

    fn ep_enable(&self, endpoint: &EndpointInfo) -> Result<u16> {
        self.record(Call::EpEnable {
            address: endpoint.address,
        });

        let mut next = self.next_handle.lock().unwrap();
        let handle = *next;
        *next += 1;

        self.enabled.lock().unwrap().push((endpoint.address, handle));
        Ok(handle)
    }

    fn ep_disable(&self, handle: u16) -> Result<()> {
        self.record(Call::EpDisable { handle });
        Ok(())
    }

    fn ep_read(&self, handle: u16, max_len: usize) -> Result<Vec<u8>> {
        let chunk = self
            .host_chunks
            .lock()
            .unwrap()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front);

        match chunk {
            Some(mut data) => {
                data.truncate(max_len);
                Ok(data)
            }
            None => {
                thread::sleep(IDLE_POLL);
                Ok(Vec::new())
            }
        }
    }

    fn ep_write(&self, handle: u16, data: &[u8]) -> Result<usize> {
        self.written
            .lock()
            .unwrap()
            .entry(handle)
            .or_insert_with(Vec::new)
            .push(data.to_vec());
        Ok(data.len())
    }

    fn configure(&self) -> Result<()> {
        self.record(Call::Configure);
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(Error::GadgetIo(nix::Error::Sys(nix::errno::Errno::EINVAL)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// upstream side

pub struct FakeUpstream {
    journal: Journal,
    device_descriptor: Vec<u8>,
    config_blobs: Vec<Vec<u8>>,
    strings: HashMap<u8, Vec<u8>>,
    endpoints_by_value: Mutex<HashMap<u8, Vec<EndpointInfo>>>,
    canned_in: Mutex<HashMap<(u8, u8, u16, u16), Vec<u8>>>,
    device_chunks: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    written: Mutex<HashMap<u8, Vec<Vec<u8>>>>,
    fail_control_out: AtomicBool,
    fail_set_configuration: AtomicBool,
}

impl FakeUpstream {
    /// One configuration (value 1) with bulk IN/OUT plus an interrupt IN
    /// endpoint, and the three standard strings.
    pub fn with_defaults(journal: Journal) -> FakeUpstream {
        let endpoints = vec![
            bulk_in_endpoint(),
            bulk_out_endpoint(),
            interrupt_in_endpoint(),
        ];

        let mut strings = HashMap::new();
        strings.insert(1, string_blob("Fixture Labs"));
        strings.insert(2, string_blob("Receipt Printer"));
        strings.insert(3, string_blob("0000117"));

        let mut endpoints_by_value = HashMap::new();
        endpoints_by_value.insert(1, endpoints.clone());

        FakeUpstream {
            journal,
            device_descriptor: sample_device_descriptor(),
            config_blobs: vec![config_blob(1, &endpoints)],
            strings,
            endpoints_by_value: Mutex::new(endpoints_by_value),
            canned_in: Mutex::new(HashMap::new()),
            device_chunks: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            fail_control_out: AtomicBool::new(false),
            fail_set_configuration: AtomicBool::new(false),
        }
    }

    fn record(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }

    /// Cans the reply for a forwarded IN request.
    pub fn can_control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    ) {
        self.canned_in
            .lock()
            .unwrap()
            .insert((request_type, request, value, index), data);
    }

    /// Replaces the endpoint list of a configuration value.
    pub fn set_endpoints(&self, value: u8, endpoints: Vec<EndpointInfo>) {
        self.endpoints_by_value
            .lock()
            .unwrap()
            .insert(value, endpoints);
    }

    /// Scripts a chunk the device produces on an IN endpoint.
    pub fn push_device_chunk(&self, address: u8, data: Vec<u8>) {
        self.device_chunks
            .lock()
            .unwrap()
            .entry(address)
            .or_insert_with(VecDeque::new)
            .push_back(data);
    }

    /// Chunks the proxy delivered to the device on an OUT endpoint.
    pub fn written_to_device(&self, address: u8) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_control_out(&self) {
        self.fail_control_out.store(true, Ordering::SeqCst);
    }

    pub fn fail_set_configuration(&self) {
        self.fail_set_configuration.store(true, Ordering::SeqCst);
    }

    pub fn reset_count(&self) -> usize {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == Call::Reset)
            .count()
    }

    fn descriptor_reply(&self, value: u16, length: u16) -> Result<Vec<u8>> {
        let kind = (value >> 8) as u8;
        let index = (value & 0xff) as u8;

        let blob = match kind {
            descriptor_type::DEVICE => Some(self.device_descriptor.clone()),
            descriptor_type::CONFIGURATION => self.config_blobs.get(index as usize).cloned(),
            descriptor_type::STRING => self.strings.get(&index).cloned(),
            _ => None,
        };

        match blob {
            Some(mut data) => {
                data.truncate(length as usize);
                Ok(data)
            }
            None => Err(Error::ControlTransfer(rusb::Error::Pipe)),
        }
    }
}

impl UpstreamBus for FakeUpstream {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.record(Call::ControlIn {
            request_type,
            request,
            value,
            index,
            length,
        });

        if let Some(data) = self
            .canned_in
            .lock()
            .unwrap()
            .get(&(request_type, request, value, index))
        {
            let mut data = data.clone();
            data.truncate(length as usize);
            return Ok(data);
        }

        if request_type == 0x80 && request == standard_request::GET_DESCRIPTOR {
            return self.descriptor_reply(value, length);
        }

        Err(Error::ControlTransfer(rusb::Error::Pipe))
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        self.record(Call::ControlOut {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });

        if self.fail_control_out.load(Ordering::SeqCst) {
            return Err(Error::ControlTransfer(rusb::Error::Pipe));
        }
        Ok(())
    }

    fn read_endpoint(
        &self,
        endpoint: &EndpointInfo,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        let chunk = self
            .device_chunks
            .lock()
            .unwrap()
            .get_mut(&endpoint.address)
            .and_then(VecDeque::pop_front);

        match chunk {
            Some(mut data) => {
                data.truncate(max_len);
                Ok(data)
            }
            None => {
                thread::sleep(IDLE_POLL);
                Ok(Vec::new())
            }
        }
    }

    fn write_endpoint(
        &self,
        endpoint: &EndpointInfo,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        self.written
            .lock()
            .unwrap()
            .entry(endpoint.address)
            .or_insert_with(Vec::new)
            .push(data.to_vec());
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.record(Call::Reset);
        Ok(())
    }

    fn set_configuration(&self, value: u8) -> Result<()> {
        self.record(Call::SetConfiguration { value });
        if self.fail_set_configuration.load(Ordering::SeqCst) {
            return Err(Error::ControlTransfer(rusb::Error::Pipe));
        }
        Ok(())
    }

    fn endpoints(&self, config_value: u8) -> Result<Vec<EndpointInfo>> {
        self.endpoints_by_value
            .lock()
            .unwrap()
            .get(&config_value)
            .cloned()
            .ok_or(Error::Protocol("configuration value not offered by device"))
    }
}
