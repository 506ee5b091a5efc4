//! Transport abstractions.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::{CancelState, CancelToken};
use crate::config::DeviceProfile;
use crate::manifest::DeviceId;

/// Poll slice for blocking loops that must observe cancellation.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("access denied, missing permissions to open the device")]
    AccessDenied,

    #[error("device busy")]
    DeviceBusy,

    #[error("device gone")]
    DeviceGone,

    #[error("device not found")]
    NotFound,

    #[error("operation not supported")]
    NotSupported,

    #[error("operation timed out")]
    Timeout,

    #[error("transfer stalled")]
    TransferStall,

    #[error("transfer error: {0}")]
    TransferError(String),

    #[error("device lost during transfer")]
    TransferNoDevice,

    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Error matching a token that stopped being live.
    pub(crate) fn from_cancel(state: CancelState) -> Self {
        match state {
            CancelState::TimedOut => TransportError::Timeout,
            _ => TransportError::Cancelled,
        }
    }
}

/// Cancellable read half of an endpoint. `Ok(0)` signals end of stream.
pub trait ContextReader: Send {
    fn read_context(&self, ctx: &CancelToken, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Cancellable write half of an endpoint. Writes the whole buffer or fails.
pub trait ContextWriter: Send {
    fn write_context(&self, ctx: &CancelToken, buf: &[u8]) -> Result<usize, TransportError>;
}

/// A fully opened USB interface: the endpoint pair plus whatever guard
/// keeps the interface claim and device handle alive. The guard must be
/// dropped only after both endpoint halves are gone.
pub struct UsbLink {
    pub reader: Box<dyn ContextReader>,
    pub writer: Box<dyn ContextWriter>,
    pub guard: Box<dyn Any + Send>,
}

/// Opens links to devices. Implemented by the rusb backend and the mock.
pub trait UsbBackend {
    /// Opens the first device matching `id`, configured per `profile`.
    /// A device that is simply absent reports [`TransportError::NotFound`].
    fn open(&mut self, profile: &DeviceProfile, id: DeviceId) -> Result<UsbLink, TransportError>;
}
