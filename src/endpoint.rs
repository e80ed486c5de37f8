//! Endpoint metadata shared between the upstream enumeration and the gadget.

use crate::control::descriptor_type;

/// Transfer type, bits 0..=1 of `bmAttributes`.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EndpointType {
    Control = 0b00,
    Isochronous = 0b01,
    Bulk = 0b10,
    Interrupt = 0b11,
}

impl EndpointType {
    pub fn from_attributes(attributes: u8) -> EndpointType {
        match attributes & 0b11 {
            0b00 => EndpointType::Control,
            0b01 => EndpointType::Isochronous,
            0b10 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// One endpoint of the upstream device's active configuration.
///
/// `address` carries the direction bit (0x80 = IN, towards the downstream
/// host), exactly as reported by the upstream descriptors.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    /// Serialises the endpoint descriptor the kernel expects on EP_ENABLE.
    ///
    /// The kernel reads a full `usb_endpoint_descriptor`, which trails two
    /// audio-only bytes behind the 7 wire bytes; they stay zero here.
    pub fn descriptor(&self) -> [u8; 9] {
        let packet_size = self.max_packet_size.to_le_bytes();
        [
            7,
            descriptor_type::ENDPOINT,
            self.address,
            self.kind as u8,
            packet_size[0],
            packet_size[1],
            self.interval,
            0,
            0,
        ]
    }
}
