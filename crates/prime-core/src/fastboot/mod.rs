//! Fastboot protocol client.
//!
//! Android-origin bootloader protocol: ASCII commands of at most 64 bytes
//! over bulk OUT, responses as a 4-byte tag plus up to 256 payload bytes
//! over bulk IN. Only the standard `OKAY`/`FAIL`/`DATA`/`INFO`/`TEXT`
//! semantics are relied upon; everything vendor-specific stays in the
//! orchestrator.

pub mod channel;
pub mod frame;

pub use self::channel::FastbootChannel;
pub use self::frame::{Frame, MAX_COMMAND_LEN};

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FastbootError {
    /// `FAIL` reported by the device; the payload is user-presentable.
    #[error("fastboot request failed: {message}")]
    Device { message: String },

    #[error("unexpected response")]
    UnexpectedResponse,

    #[error("too short payload: expected {purpose} length of {expected} but got {actual} instead")]
    TooShortPayload {
        purpose: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error(
        "unexpected data size: expected {purpose} size of {expected} but got {actual} instead"
    )]
    UnexpectedDataSize {
        purpose: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("max length exceeded")]
    MaxLengthExceeded,

    #[error("fastboot channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

impl FastbootError {
    /// True when the underlying cause is context cancellation rather than
    /// anything the device did.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FastbootError::Transport(TransportError::Cancelled))
    }
}
