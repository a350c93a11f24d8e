//! USB link to the analyzer.
//!
//! Interface 0 carries two bulk pipes: endpoint 1 is the register bridge
//! (same wire format as the UART bridge) and endpoint 2 IN is the HSPI sample
//! stream. `rusb` only offers blocking bulk reads, so the stream side runs
//! submitted transfers on a worker thread and hands completions back over a
//! channel.
//!
//! The worker issues one bulk read at a time. Of the transfers the pool keeps
//! outstanding, only one is on the wire; the rest wait in the request queue
//! with their buffers, so host-side buffering still covers scheduling latency
//! but the endpoint itself is never double-buffered. Reads stay serial so
//! completions come back in the order the data left the device.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rusb::{DeviceHandle, GlobalContext};

use crate::csr::RegisterMap;
use crate::device::{DeviceError, Sucrela};
use crate::register_bus::{AddressWidth, ByteTransport};
use crate::transfer_pool::{Completion, SlotId, StreamTransport, TransferError, TransferStatus};

pub const VENDOR_ID: u16 = 0x16c0;
pub const PRODUCT_ID: u16 = 0x05dc;
pub const MANUFACTURER: &str = "HydraBus";

const INTERFACE: u8 = 0;
const REGISTER_EP_OUT: u8 = 0x01;
const REGISTER_EP_IN: u8 = 0x81;
const STREAM_EP_IN: u8 = 0x82;

const REGISTER_TIMEOUT: Duration = Duration::from_millis(100);
const STREAM_TIMEOUT: Duration = Duration::from_millis(100);

/// Claimed interface; released when the last user goes away.
struct ClaimedInterface {
    handle: DeviceHandle<GlobalContext>,
}

impl Drop for ClaimedInterface {
    fn drop(&mut self) {
        // the device may already be gone
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            log::debug!("Releasing USB interface failed: {}", e);
        }
    }
}

/// Open the first analyzer on the bus and claim its interface.
fn open_interface() -> Result<Arc<ClaimedInterface>, DeviceError> {
    for device in rusb::devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if (desc.vendor_id(), desc.product_id()) != (VENDOR_ID, PRODUCT_ID) {
            continue;
        }
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Cannot open USB device {:04x}:{:04x}: {}", VENDOR_ID, PRODUCT_ID, e);
                continue;
            }
        };
        match handle.read_manufacturer_string_ascii(&desc) {
            Ok(manufacturer) if manufacturer == MANUFACTURER => {}
            Ok(other) => {
                log::debug!("Skipping device from {}", other);
                continue;
            }
            Err(e) => {
                log::debug!("Cannot read manufacturer string: {}", e);
                continue;
            }
        }

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(INTERFACE).unwrap_or(false) {
                handle.detach_kernel_driver(INTERFACE)?;
            }
        }
        handle.claim_interface(INTERFACE)?;
        if let Err(e) = handle.clear_halt(STREAM_EP_IN) {
            tracing::trace!("Clearing halt on the stream endpoint failed: {}", e);
        }

        log::debug!("Claimed analyzer on bus {} address {}", device.bus_number(), device.address());
        return Ok(Arc::new(ClaimedInterface { handle }));
    }
    Err(DeviceError::NotFound)
}

fn io_error(e: rusb::Error) -> io::Error {
    let kind = match e {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        rusb::Error::Busy => io::ErrorKind::WouldBlock,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

/// Register bridge on bulk endpoint 1.
pub struct UsbRegisterTransport {
    usb: Arc<ClaimedInterface>,
}

impl std::fmt::Debug for UsbRegisterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbRegisterTransport").finish_non_exhaustive()
    }
}

impl ByteTransport for UsbRegisterTransport {
    fn transport_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let written = self
            .usb
            .handle
            .write_bulk(REGISTER_EP_OUT, bytes, REGISTER_TIMEOUT)
            .map_err(io_error)?;
        if written != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short register write: {} of {} bytes", written, bytes.len()),
            ));
        }
        Ok(())
    }

    fn transport_read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .usb
                .handle
                .read_bulk(REGISTER_EP_IN, &mut buf[filled..], REGISTER_TIMEOUT)
                .map_err(io_error)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty register reply"));
            }
            filled += n;
        }
        Ok(())
    }
}

fn transfer_status(e: rusb::Error) -> TransferStatus {
    match e {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Sample stream on bulk endpoint 2 IN.
pub struct UsbStream {
    requests: Sender<(SlotId, Vec<u8>)>,
    completions: Receiver<Completion>,
    cancelled: Arc<Mutex<HashSet<SlotId>>>,
    gone: Arc<AtomicBool>,
}

impl std::fmt::Debug for UsbStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbStream")
            .field("queued", &self.requests.len())
            .field("gone", &self.gone.load(Ordering::Relaxed))
            .finish()
    }
}

impl UsbStream {
    fn spawn(usb: Arc<ClaimedInterface>) -> Result<Self, DeviceError> {
        let (requests, request_rx) = crossbeam_channel::unbounded::<(SlotId, Vec<u8>)>();
        let (completion_tx, completions) = crossbeam_channel::unbounded();
        let cancelled = Arc::new(Mutex::new(HashSet::new()));
        let gone = Arc::new(AtomicBool::new(false));

        let worker_cancelled = Arc::clone(&cancelled);
        let worker_gone = Arc::clone(&gone);
        thread::Builder::new()
            .name("sucrela-usb-stream".to_string())
            .spawn(move || {
                for (slot, mut buffer) in request_rx.iter() {
                    let completion =
                        read_transfer(&usb, slot, &mut buffer, &worker_cancelled, &worker_gone);
                    let completion = Completion { buffer, ..completion };
                    if completion_tx.send(completion).is_err() {
                        break;
                    }
                }
                log::debug!("USB stream worker stopped");
            })?;

        Ok(Self {
            requests,
            completions,
            cancelled,
            gone,
        })
    }
}

/// Run one bulk read. The returned completion carries an empty buffer; the
/// caller puts the real one back.
fn read_transfer(
    usb: &ClaimedInterface,
    slot: SlotId,
    buffer: &mut [u8],
    cancelled: &Mutex<HashSet<SlotId>>,
    gone: &AtomicBool,
) -> Completion {
    let completion = |status, actual_length| Completion {
        slot,
        status,
        buffer: Vec::new(),
        actual_length,
    };

    if cancelled.lock().remove(&slot) {
        return completion(TransferStatus::Cancelled, 0);
    }
    if gone.load(Ordering::Acquire) {
        return completion(TransferStatus::NoDevice, 0);
    }

    let (status, length) = match usb.handle.read_bulk(STREAM_EP_IN, buffer, STREAM_TIMEOUT) {
        Ok(n) => (TransferStatus::Completed, n),
        Err(e) => {
            let status = transfer_status(e);
            if status == TransferStatus::NoDevice {
                gone.store(true, Ordering::Release);
            }
            (status, 0)
        }
    };

    // a cancellation that raced the read wins; the data is dropped
    if cancelled.lock().remove(&slot) {
        return completion(TransferStatus::Cancelled, 0);
    }
    completion(status, length)
}

impl StreamTransport for UsbStream {
    fn submit(&self, slot: SlotId, buffer: Vec<u8>) -> Result<(), (Vec<u8>, TransferError)> {
        if self.gone.load(Ordering::Acquire) {
            return Err((buffer, TransferError::NoDevice));
        }
        self.cancelled.lock().remove(&slot);
        self.requests.send((slot, buffer)).map_err(|e| {
            let (_, buffer) = e.into_inner();
            (buffer, TransferError::Backend("stream worker stopped".to_string()))
        })
    }

    fn cancel(&self, slot: SlotId) {
        self.cancelled.lock().insert(slot);
    }

    fn handle_events(&self, timeout: Duration) -> Vec<Completion> {
        let mut completions = Vec::new();
        if let Ok(first) = self.completions.recv_timeout(timeout) {
            completions.push(first);
            completions.extend(self.completions.try_iter());
        }
        completions
    }
}

impl Sucrela<UsbRegisterTransport> {
    /// Find the analyzer on USB, open its register bridge and sample stream.
    pub fn connect_usb(map: RegisterMap) -> Result<(Self, Arc<UsbStream>), DeviceError> {
        let usb = open_interface()?;
        let stream = Arc::new(UsbStream::spawn(Arc::clone(&usb))?);
        let device = Self::open(UsbRegisterTransport { usb }, map, AddressWidth::default())?;
        Ok((device, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_errors_map_to_transfer_status() {
        assert_eq!(transfer_status(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(transfer_status(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(transfer_status(rusb::Error::Overflow), TransferStatus::Overflow);
        assert_eq!(transfer_status(rusb::Error::Io), TransferStatus::Error);
    }

    #[test]
    fn test_register_errors_map_to_io_kinds() {
        assert_eq!(io_error(rusb::Error::Timeout).kind(), io::ErrorKind::TimedOut);
        assert_eq!(io_error(rusb::Error::NoDevice).kind(), io::ErrorKind::NotConnected);
    }
}
