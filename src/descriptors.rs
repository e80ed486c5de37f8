//! One-shot descriptor cache.
//!
//! All descriptors the downstream host may ask for are fetched from the
//! upstream device before the gadget ever runs, and served from memory
//! afterwards. Stale answers are impossible because the cache is read-only
//! for the rest of the run.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};

use crate::control::{self, descriptor_type, standard_request, Direction, Recipient, RequestType};
use crate::upstream::UpstreamBus;
use crate::{Error, Result};

const FETCH_TIMEOUT: Duration = Duration::from_millis(1000);
const LANG_ID_ENGLISH_US: u16 = 0x0409;
const DEVICE_DESCRIPTOR_LENGTH: usize = 18;
const CONFIG_HEADER_LENGTH: u16 = 9;
const STRING_DESCRIPTOR_MAX: u16 = 255;

/// Smallest EP0 packet size some device controllers will accept; the device
/// descriptor is rewritten to at least this on its way downstream.
pub const MIN_EP0_PACKET_SIZE: u8 = 64;

/// Raises `bMaxPacketSize0` (byte 7 of a device descriptor) to the controller
/// minimum. Applied when serving, never to the cached copy, so the cache
/// stays faithful to the upstream device.
pub fn clamp_max_packet_size0(descriptor: &mut [u8]) {
    if descriptor.len() > 7 && descriptor[7] < MIN_EP0_PACKET_SIZE {
        descriptor[7] = MIN_EP0_PACKET_SIZE;
    }
}

pub struct DescriptorCache {
    device: Vec<u8>,
    configs: HashMap<u8, Vec<u8>>,
    strings: HashMap<u8, Vec<u8>>,
}

impl DescriptorCache {
    /// Fetches the device descriptor, every configuration descriptor in full,
    /// and the manufacturer/product/serial strings. String failures are
    /// tolerated; anything else aborts startup.
    pub fn populate<U: UpstreamBus>(upstream: &U) -> Result<DescriptorCache> {
        let standard_in = control::request_type(
            Direction::DeviceToHost,
            RequestType::Standard,
            Recipient::Device,
        );

        let device = upstream.control_in(
            standard_in,
            standard_request::GET_DESCRIPTOR,
            (descriptor_type::DEVICE as u16) << 8,
            0,
            DEVICE_DESCRIPTOR_LENGTH as u16,
            FETCH_TIMEOUT,
        )?;
        if device.len() != DEVICE_DESCRIPTOR_LENGTH {
            return Err(Error::Protocol("short device descriptor"));
        }

        let num_configurations = device[17];
        let mut configs = HashMap::new();
        for index in 0..num_configurations {
            let value = ((descriptor_type::CONFIGURATION as u16) << 8) | index as u16;

            let header = upstream.control_in(
                standard_in,
                standard_request::GET_DESCRIPTOR,
                value,
                0,
                CONFIG_HEADER_LENGTH,
                FETCH_TIMEOUT,
            )?;
            if header.len() < CONFIG_HEADER_LENGTH as usize {
                return Err(Error::Protocol("short configuration descriptor header"));
            }

            let total_length = u16::from_le_bytes([header[2], header[3]]);
            if total_length < CONFIG_HEADER_LENGTH {
                return Err(Error::Protocol("impossible configuration total length"));
            }

            let blob = upstream.control_in(
                standard_in,
                standard_request::GET_DESCRIPTOR,
                value,
                0,
                total_length,
                FETCH_TIMEOUT,
            )?;
            info!(
                "cached configuration descriptor {} ({} bytes)",
                index,
                blob.len()
            );
            configs.insert(index, blob);
        }

        // iManufacturer, iProduct, iSerialNumber
        let mut strings = HashMap::new();
        for &index in &[device[14], device[15], device[16]] {
            if index == 0 || strings.contains_key(&index) {
                continue;
            }

            match upstream.control_in(
                standard_in,
                standard_request::GET_DESCRIPTOR,
                ((descriptor_type::STRING as u16) << 8) | index as u16,
                LANG_ID_ENGLISH_US,
                STRING_DESCRIPTOR_MAX,
                FETCH_TIMEOUT,
            ) {
                Ok(blob) => {
                    strings.insert(index, blob);
                }
                Err(err) => warn!("string descriptor {} unavailable: {}", index, err),
            }
        }

        info!(
            "descriptor cache ready: device + {} configuration(s) + {} string(s)",
            configs.len(),
            strings.len()
        );

        Ok(DescriptorCache {
            device,
            configs,
            strings,
        })
    }

    /// The 18 device-descriptor bytes, verbatim from the upstream.
    pub fn device(&self) -> &[u8] {
        &self.device
    }

    /// Full configuration descriptor hierarchy for a configuration *index*.
    pub fn config(&self, index: u8) -> Option<&[u8]> {
        self.configs.get(&index).map(Vec::as_slice)
    }

    /// String descriptor for a string index, if it was cached.
    pub fn string(&self, index: u8) -> Option<&[u8]> {
        self.strings.get(&index).map(Vec::as_slice)
    }
}
