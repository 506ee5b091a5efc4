//! Fastboot wire framing.
//!
//! Every response is one bulk IN transaction: a 4-byte ASCII tag followed
//! by up to 256 payload bytes. The tag set is closed, so responses are
//! modeled as a tagged enum rather than raw buffers.

use super::FastbootError;

/// Commands are plain ASCII and never longer than this.
pub const MAX_COMMAND_LEN: usize = 64;

/// Response payloads top out at 256 bytes; the read buffer leaves headroom.
pub const MAX_FRAME_LEN: usize = 512;

const TAG_LEN: usize = 4;
const DATA_SIZE_DIGITS: usize = 8;

/// One decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Command succeeded, optional free-text payload.
    Okay(Vec<u8>),
    /// Command failed, human-readable reason.
    Fail(String),
    /// Device is ready to receive the given number of payload bytes.
    Data(u32),
    /// Informational message; the pending command stays pending.
    Info(String),
    /// Arbitrary NUL-terminated data, possibly split across frames.
    Text(Vec<u8>),
}

impl Frame {
    /// Decodes a single response transaction.
    pub fn parse(raw: &[u8]) -> Result<Self, FastbootError> {
        if raw.len() < TAG_LEN {
            return Err(FastbootError::TooShortPayload {
                purpose: "message type",
                expected: TAG_LEN as u64,
                actual: raw.len() as u64,
            });
        }
        let (tag, payload) = raw.split_at(TAG_LEN);
        match tag {
            b"OKAY" => Ok(Frame::Okay(payload.to_vec())),
            b"FAIL" => Ok(Frame::Fail(String::from_utf8_lossy(payload).into_owned())),
            b"DATA" => {
                if payload.len() < DATA_SIZE_DIGITS {
                    return Err(FastbootError::TooShortPayload {
                        purpose: "allocated data length",
                        expected: DATA_SIZE_DIGITS as u64,
                        actual: payload.len() as u64,
                    });
                }
                let digits = &payload[..DATA_SIZE_DIGITS];
                if !digits.iter().all(u8::is_ascii_hexdigit) {
                    return Err(FastbootError::UnexpectedResponse);
                }
                // digits are validated ASCII hex
                let text = std::str::from_utf8(digits).expect("ascii hex digits");
                let size = u32::from_str_radix(text, 16).expect("8 hex digits fit in u32");
                Ok(Frame::Data(size))
            }
            b"INFO" => Ok(Frame::Info(String::from_utf8_lossy(payload).into_owned())),
            b"TEXT" => Ok(Frame::Text(payload.to_vec())),
            _ => Err(FastbootError::UnexpectedResponse),
        }
    }
}
