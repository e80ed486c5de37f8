//! The host-side bus seam: the upstream (real) device behind libusb.

use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};

use crate::control::{self, descriptor_type, standard_request, Direction, Recipient, RequestType};
use crate::endpoint::{EndpointInfo, EndpointType};
use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);
const LANG_ID_ENGLISH_US: u16 = 0x0409;

/// Upstream-device capability set.
///
/// The EP0 engine is the only caller of the control methods; endpoint workers
/// only touch `read_endpoint`/`write_endpoint`. Implementations must support
/// that split concurrently.
pub trait UpstreamBus: Send + Sync {
    /// IN control transfer; returns up to `length` bytes.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// OUT control transfer carrying `data` (possibly empty).
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Bulk or interrupt read, by endpoint kind. A timeout is the normal idle
    /// signal and yields an empty buffer, not an error.
    fn read_endpoint(
        &self,
        endpoint: &EndpointInfo,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// Bulk or interrupt write, by endpoint kind.
    fn write_endpoint(&self, endpoint: &EndpointInfo, data: &[u8], timeout: Duration)
        -> Result<()>;

    /// Issues a bus reset. Used when the downstream host resets or detaches.
    fn reset(&self) -> Result<()>;

    /// Selects the configuration with the given `bConfigurationValue`.
    fn set_configuration(&self, value: u8) -> Result<()>;

    /// Endpoints of the configuration with the given `bConfigurationValue`,
    /// default alternate setting of each interface.
    fn endpoints(&self, config_value: u8) -> Result<Vec<EndpointInfo>>;
}

/// A real device opened through libusb.
pub struct UsbHostDevice {
    device: Device<Context>,
    handle: RwLock<DeviceHandle<Context>>,
    claimed: Mutex<Vec<u8>>,
}

impl UsbHostDevice {
    /// Locates the device by VID/PID, detaches any bound kernel driver,
    /// resets it, and probes it for responsiveness.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<UsbHostDevice> {
        let context = Context::new().map_err(Error::UpstreamUnavailable)?;
        let devices = context.devices().map_err(Error::UpstreamUnavailable)?;

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }

            let mut handle = device.open().map_err(Error::UpstreamUnavailable)?;

            if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
                debug!("kernel driver auto-detach not available: {}", err);
            }
            if let Err(err) = handle.reset() {
                warn!("initial bus reset failed: {} (continuing)", err);
            }

            // Language-table probe: an unresponsive device fails here instead
            // of wedging the downstream host mid-enumeration later.
            let mut langs = [0u8; 4];
            handle
                .read_control(
                    control::request_type(
                        Direction::DeviceToHost,
                        RequestType::Standard,
                        Recipient::Device,
                    ),
                    standard_request::GET_DESCRIPTOR,
                    (descriptor_type::STRING as u16) << 8,
                    LANG_ID_ENGLISH_US,
                    &mut langs,
                    PROBE_TIMEOUT,
                )
                .map_err(Error::UpstreamUnavailable)?;

            info!(
                "opened upstream device {:04x}:{:04x} ({} configurations)",
                vendor_id,
                product_id,
                descriptor.num_configurations()
            );

            return Ok(UsbHostDevice {
                device,
                handle: RwLock::new(handle),
                claimed: Mutex::new(Vec::new()),
            });
        }

        Err(Error::UpstreamUnavailable(rusb::Error::NoDevice))
    }

    fn read_handle(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_handle(&self) -> RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(|err| err.into_inner())
    }

    fn find_config(&self, value: u8) -> Result<rusb::ConfigDescriptor> {
        let descriptor = self
            .device
            .device_descriptor()
            .map_err(Error::ControlTransfer)?;

        for index in 0..descriptor.num_configurations() {
            let config = self
                .device
                .config_descriptor(index)
                .map_err(Error::ControlTransfer)?;
            if config.number() == value {
                return Ok(config);
            }
        }

        Err(Error::Protocol("configuration value not offered by device"))
    }
}

impl UpstreamBus for UsbHostDevice {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let handle = self.read_handle();
        let mut buf = vec![0u8; length as usize];
        let count = handle
            .read_control(request_type, request, value, index, &mut buf, timeout)
            .map_err(Error::ControlTransfer)?;
        buf.truncate(count);
        Ok(buf)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.read_handle();
        handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(Error::ControlTransfer)?;
        Ok(())
    }

    fn read_endpoint(
        &self,
        endpoint: &EndpointInfo,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let handle = self.read_handle();
        let mut buf = vec![0u8; max_len];
        let result = match endpoint.kind {
            EndpointType::Interrupt => handle.read_interrupt(endpoint.address, &mut buf, timeout),
            _ => handle.read_bulk(endpoint.address, &mut buf, timeout),
        };

        match result {
            Ok(count) => {
                buf.truncate(count);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(err) => Err(Error::BulkTransfer(err)),
        }
    }

    fn write_endpoint(
        &self,
        endpoint: &EndpointInfo,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.read_handle();
        let mut written = 0;

        // libusb may report a short transfer; push the remainder until the
        // whole chunk is on the wire so per-endpoint ordering holds.
        while written < data.len() {
            let count = match endpoint.kind {
                EndpointType::Interrupt => {
                    handle.write_interrupt(endpoint.address, &data[written..], timeout)
                }
                _ => handle.write_bulk(endpoint.address, &data[written..], timeout),
            }
            .map_err(Error::BulkTransfer)?;

            if count == 0 {
                return Err(Error::BulkTransfer(rusb::Error::Io));
            }
            written += count;
        }

        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut handle = self.write_handle();

        let mut claimed = self.claimed.lock().unwrap_or_else(|err| err.into_inner());
        for interface in claimed.drain(..) {
            if let Err(err) = handle.release_interface(interface) {
                debug!("release of interface {} failed: {}", interface, err);
            }
        }

        handle.reset().map_err(Error::UpstreamUnavailable)
    }

    fn set_configuration(&self, value: u8) -> Result<()> {
        let config = self.find_config(value)?;
        let mut handle = self.write_handle();

        handle
            .set_active_configuration(value)
            .map_err(Error::ControlTransfer)?;

        // libusb requires a claim before endpoint I/O is allowed.
        let mut claimed = self.claimed.lock().unwrap_or_else(|err| err.into_inner());
        for interface in config.interfaces() {
            match handle.claim_interface(interface.number()) {
                Ok(()) => claimed.push(interface.number()),
                Err(err) => warn!("could not claim interface {}: {}", interface.number(), err),
            }
        }

        Ok(())
    }

    fn endpoints(&self, config_value: u8) -> Result<Vec<EndpointInfo>> {
        let config = self.find_config(config_value)?;
        let mut endpoints = Vec::new();

        for interface in config.interfaces() {
            let setting = match interface.descriptors().next() {
                Some(setting) => setting,
                None => continue,
            };

            for descriptor in setting.endpoint_descriptors() {
                endpoints.push(EndpointInfo {
                    address: descriptor.address(),
                    kind: transfer_kind(descriptor.transfer_type()),
                    max_packet_size: descriptor.max_packet_size(),
                    interval: descriptor.interval(),
                });
            }
        }

        Ok(endpoints)
    }
}

fn transfer_kind(transfer: TransferType) -> EndpointType {
    match transfer {
        TransferType::Control => EndpointType::Control,
        TransferType::Isochronous => EndpointType::Isochronous,
        TransferType::Bulk => EndpointType::Bulk,
        TransferType::Interrupt => EndpointType::Interrupt,
    }
}
