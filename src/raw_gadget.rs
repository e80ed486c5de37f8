//! `GadgetBus` implementation backed by the Linux raw-gadget character
//! device.
//!
//! Every command is a single ioctl against `/dev/raw-gadget`. The request
//! codes use magic `'U'`; the encoded size covers only the fixed header of
//! variable-length payloads, matching the kernel definitions.

use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use libc::{c_int, c_ulong, c_void};
use log::{debug, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::{request_code_none, request_code_read, request_code_readwrite, request_code_write};

use crate::endpoint::EndpointInfo;
use crate::gadget::{Event, EventKind, GadgetBus, UsbSpeed};
use crate::{Error, Result};

const UDC_NAME_LENGTH_MAX: usize = 128;

/// Upper bound on a single event payload; larger lengths reported by the
/// kernel are treated as corrupt and clipped to an empty payload.
pub const EVENT_DATA_MAX: usize = 4096;

/// Largest buffer movable through one endpoint I/O ioctl.
pub const EP_IO_DATA_MAX: usize = 4096;

const EP_IO_HEADER_SIZE: usize = 8;
const EVENT_HEADER_SIZE: usize = 8;

#[repr(C)]
struct UsbRawInit {
    driver_name: [u8; UDC_NAME_LENGTH_MAX],
    device_name: [u8; UDC_NAME_LENGTH_MAX],
    speed: u8,
}

#[repr(C)]
struct UsbRawEvent {
    kind: u32,
    length: u32,
    data: [u8; EVENT_DATA_MAX],
}

#[repr(C)]
struct UsbRawEpIo {
    ep: u16,
    flags: u16,
    length: u32,
    data: [u8; EP_IO_DATA_MAX],
}

const USB_RAW_IOCTL_INIT: c_ulong =
    request_code_write!(b'U', 0, mem::size_of::<UsbRawInit>()) as c_ulong;
const USB_RAW_IOCTL_RUN: c_ulong = request_code_none!(b'U', 1) as c_ulong;
const USB_RAW_IOCTL_EVENT_FETCH: c_ulong =
    request_code_read!(b'U', 2, EVENT_HEADER_SIZE) as c_ulong;
const USB_RAW_IOCTL_EP0_WRITE: c_ulong =
    request_code_write!(b'U', 3, EP_IO_HEADER_SIZE) as c_ulong;
const USB_RAW_IOCTL_EP0_READ: c_ulong =
    request_code_readwrite!(b'U', 4, EP_IO_HEADER_SIZE) as c_ulong;
const USB_RAW_IOCTL_EP_ENABLE: c_ulong = request_code_write!(b'U', 5, 9) as c_ulong;
const USB_RAW_IOCTL_EP_DISABLE: c_ulong =
    request_code_write!(b'U', 6, mem::size_of::<u32>()) as c_ulong;
const USB_RAW_IOCTL_EP_WRITE: c_ulong =
    request_code_write!(b'U', 7, EP_IO_HEADER_SIZE) as c_ulong;
const USB_RAW_IOCTL_EP_READ: c_ulong =
    request_code_readwrite!(b'U', 8, EP_IO_HEADER_SIZE) as c_ulong;
const USB_RAW_IOCTL_CONFIGURE: c_ulong = request_code_none!(b'U', 9) as c_ulong;
const USB_RAW_IOCTL_EP0_STALL: c_ulong = request_code_none!(b'U', 12) as c_ulong;

/// Clips a kernel-reported event payload length into `[0, EVENT_DATA_MAX]`.
fn clip_event_length(length: u32) -> usize {
    if length as usize > EVENT_DATA_MAX {
        warn!("event payload length {} out of range, dropping payload", length);
        0
    } else {
        length as usize
    }
}

fn copy_name(target: &mut [u8; UDC_NAME_LENGTH_MAX], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(UDC_NAME_LENGTH_MAX - 1);
    target[..len].copy_from_slice(&bytes[..len]);
}

fn last_errno() -> nix::Error {
    nix::Error::Sys(nix::errno::Errno::last())
}

/// Handle to an open raw-gadget character device.
pub struct RawGadget {
    fd: RawFd,
}

impl RawGadget {
    /// Opens the raw-gadget device node, conventionally `/dev/raw-gadget`.
    pub fn open_path(path: &Path) -> Result<RawGadget> {
        let fd = open(path, OFlag::O_RDWR, Mode::empty()).map_err(Error::GadgetIo)?;
        debug!("opened {} (fd {})", path.display(), fd);
        Ok(RawGadget { fd })
    }

    fn ioctl(&self, code: c_ulong, arg: *mut c_void) -> Result<c_int> {
        let rv = unsafe { libc::ioctl(self.fd, code, arg) };
        if rv < 0 {
            Err(Error::GadgetIo(last_errno()))
        } else {
            Ok(rv)
        }
    }

    fn ep_io_read(&self, code: c_ulong, ep: u16, max_len: usize) -> Result<Vec<u8>> {
        let length = max_len.min(EP_IO_DATA_MAX);
        let mut io = UsbRawEpIo {
            ep,
            flags: 0,
            length: length as u32,
            data: [0; EP_IO_DATA_MAX],
        };

        let transferred = self.ioctl(code, &mut io as *mut _ as *mut c_void)? as usize;
        Ok(io.data[..transferred.min(length)].to_vec())
    }

    fn ep_io_write(&self, code: c_ulong, ep: u16, data: &[u8]) -> Result<usize> {
        let length = data.len().min(EP_IO_DATA_MAX);
        let mut io = UsbRawEpIo {
            ep,
            flags: 0,
            length: length as u32,
            data: [0; EP_IO_DATA_MAX],
        };
        io.data[..length].copy_from_slice(&data[..length]);

        let transferred = self.ioctl(code, &mut io as *mut _ as *mut c_void)?;
        Ok(transferred as usize)
    }
}

impl GadgetBus for RawGadget {
    fn init(&self, driver: &str, device: &str, speed: UsbSpeed) -> Result<()> {
        let mut arg = UsbRawInit {
            driver_name: [0; UDC_NAME_LENGTH_MAX],
            device_name: [0; UDC_NAME_LENGTH_MAX],
            speed: speed as u8,
        };
        copy_name(&mut arg.driver_name, driver);
        copy_name(&mut arg.device_name, device);

        self.ioctl(USB_RAW_IOCTL_INIT, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    fn run(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_RUN, ptr::null_mut())?;
        Ok(())
    }

    fn fetch_event(&self) -> Result<Event> {
        let mut raw = UsbRawEvent {
            kind: 0,
            length: 0,
            data: [0; EVENT_DATA_MAX],
        };

        self.ioctl(USB_RAW_IOCTL_EVENT_FETCH, &mut raw as *mut _ as *mut c_void)?;

        let length = clip_event_length(raw.length);
        Ok(Event {
            kind: EventKind::from(raw.kind),
            data: raw.data[..length].to_vec(),
        })
    }

    fn ep0_read(&self, length: usize) -> Result<Vec<u8>> {
        self.ep_io_read(USB_RAW_IOCTL_EP0_READ, 0, length)
    }

    fn ep0_write(&self, data: &[u8]) -> Result<usize> {
        self.ep_io_write(USB_RAW_IOCTL_EP0_WRITE, 0, data)
    }

    fn ep0_stall(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_EP0_STALL, ptr::null_mut())?;
        Ok(())
    }

    fn ep_enable(&self, endpoint: &EndpointInfo) -> Result<u16> {
        let mut descriptor = endpoint.descriptor();
        let handle = self.ioctl(
            USB_RAW_IOCTL_EP_ENABLE,
            descriptor.as_mut_ptr() as *mut c_void,
        )?;
        Ok(handle as u16)
    }

    fn ep_disable(&self, handle: u16) -> Result<()> {
        let mut arg = handle as u32;
        self.ioctl(USB_RAW_IOCTL_EP_DISABLE, &mut arg as *mut _ as *mut c_void)?;
        Ok(())
    }

    fn ep_read(&self, handle: u16, max_len: usize) -> Result<Vec<u8>> {
        self.ep_io_read(USB_RAW_IOCTL_EP_READ, handle, max_len)
    }

    fn ep_write(&self, handle: u16, data: &[u8]) -> Result<usize> {
        self.ep_io_write(USB_RAW_IOCTL_EP_WRITE, handle, data)
    }

    fn configure(&self) -> Result<()> {
        self.ioctl(USB_RAW_IOCTL_CONFIGURE, ptr::null_mut())?;
        Ok(())
    }
}

impl Drop for RawGadget {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}
