//! libusb-backed transport.

use std::sync::Arc;
use std::time::Duration;

use rusb::UsbContext;
use tracing::{debug, info, warn};

use super::stream::{ReadStream, WriteStream};
use super::traits::{ContextReader, ContextWriter, TransportError, UsbBackend, UsbLink};
use crate::cancel::CancelToken;
use crate::config::DeviceProfile;
use crate::manifest::DeviceId;

/// Slice used for bulk transfers so cancellation is observed promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Production backend holding the libusb context for the run.
pub struct RusbBackend {
    context: rusb::Context,
}

impl RusbBackend {
    pub fn new(libusb_debug_level: u8) -> Result<Self, TransportError> {
        let mut context = rusb::Context::new().map_err(map_open_error)?;
        context.set_log_level(match libusb_debug_level {
            0 => rusb::LogLevel::None,
            1 => rusb::LogLevel::Error,
            2 => rusb::LogLevel::Warning,
            _ => rusb::LogLevel::Info,
        });
        Ok(Self { context })
    }
}

impl UsbBackend for RusbBackend {
    fn open(&mut self, profile: &DeviceProfile, id: DeviceId) -> Result<UsbLink, TransportError> {
        let devices = self.context.devices().map_err(map_open_error)?;
        let mut handle = None;
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() == id.vendor_id && descriptor.product_id() == id.product_id {
                handle = Some(device.open().map_err(map_open_error)?);
                break;
            }
        }
        let handle = handle.ok_or(TransportError::NotFound)?;

        debug!(device = %id, "enabling kernel driver auto-detach");
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            if !matches!(e, rusb::Error::NotSupported) {
                return Err(map_open_error(e));
            }
        }

        debug!(config = profile.usb_config, "selecting configuration");
        match handle.active_configuration() {
            Ok(current) if current == profile.usb_config => {}
            _ => handle
                .set_active_configuration(profile.usb_config)
                .map_err(map_open_error)?,
        }

        debug!(
            interface = profile.usb_interface,
            alternate = profile.usb_alternate,
            "claiming interface"
        );
        handle
            .claim_interface(profile.usb_interface)
            .map_err(map_open_error)?;
        if profile.usb_alternate != 0 {
            if let Err(e) =
                handle.set_alternate_setting(profile.usb_interface, profile.usb_alternate)
            {
                let _ = handle.release_interface(profile.usb_interface);
                return Err(map_open_error(e));
            }
        }

        let handle = Arc::new(handle);
        let in_address = profile.usb_input_endpoint | rusb::constants::LIBUSB_ENDPOINT_IN;
        let out_address = profile.usb_output_endpoint & !rusb::constants::LIBUSB_ENDPOINT_IN;
        debug!(
            in_endpoint = in_address,
            out_endpoint = out_address,
            "using bulk endpoints"
        );

        let mut reader: Box<dyn ContextReader> = Box::new(BulkIn {
            handle: handle.clone(),
            address: in_address,
        });
        if profile.usb_read_buffer_size > 1 {
            debug!(
                chunk = profile.usb_read_size,
                depth = profile.usb_read_buffer_size,
                "enabling buffered input stream"
            );
            reader = Box::new(ReadStream::spawn(
                reader,
                profile.usb_read_size,
                profile.usb_read_buffer_size,
            ));
        }

        let mut writer: Box<dyn ContextWriter> = Box::new(BulkOut {
            handle: handle.clone(),
            address: out_address,
        });
        if profile.usb_write_buffer_size > 1 {
            debug!(
                chunk = profile.usb_write_size,
                depth = profile.usb_write_buffer_size,
                "enabling buffered output stream"
            );
            writer = Box::new(WriteStream::spawn(
                writer,
                profile.usb_write_size,
                profile.usb_write_buffer_size,
            ));
        }

        info!(device = %id, "usb interface ready");
        Ok(UsbLink {
            reader,
            writer,
            guard: Box::new(ClaimGuard {
                handle,
                interface: profile.usb_interface,
            }),
        })
    }
}

struct BulkIn {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    address: u8,
}

impl ContextReader for BulkIn {
    fn read_context(&self, ctx: &CancelToken, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let state = ctx.state();
            if state != crate::cancel::CancelState::Active {
                return Err(TransportError::from_cancel(state));
            }
            match self.handle.read_bulk(self.address, buf, POLL_TIMEOUT) {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(map_transfer_error(e)),
            }
        }
    }
}

struct BulkOut {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    address: u8,
}

impl ContextWriter for BulkOut {
    fn write_context(&self, ctx: &CancelToken, buf: &[u8]) -> Result<usize, TransportError> {
        let mut written = 0;
        while written < buf.len() {
            let state = ctx.state();
            if state != crate::cancel::CancelState::Active {
                return Err(TransportError::from_cancel(state));
            }
            match self.handle.write_bulk(self.address, &buf[written..], POLL_TIMEOUT) {
                Ok(n) => written += n,
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(map_transfer_error(e)),
            }
        }
        Ok(written)
    }
}

/// Releases the interface claim when the link is torn down. Held behind the
/// endpoint halves so the claim outlives any in-flight transfer.
struct ClaimGuard {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    interface: u8,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!(interface = self.interface, error = %e, "failed to release interface");
        }
    }
}

fn map_open_error(e: rusb::Error) -> TransportError {
    match e {
        rusb::Error::Access => TransportError::AccessDenied,
        rusb::Error::Busy => TransportError::DeviceBusy,
        rusb::Error::NoDevice => TransportError::DeviceGone,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::NotSupported => TransportError::NotSupported,
        rusb::Error::Timeout => TransportError::Timeout,
        other => TransportError::TransferError(other.to_string()),
    }
}

fn map_transfer_error(e: rusb::Error) -> TransportError {
    match e {
        rusb::Error::Pipe => TransportError::TransferStall,
        rusb::Error::NoDevice => TransportError::TransferNoDevice,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Access => TransportError::AccessDenied,
        other => TransportError::TransferError(other.to_string()),
    }
}
