//! XZ stream size inspection.
//!
//! Computes the total uncompressed size of a complete XZ stream by reading
//! only the 12-byte stream footer and the index, never the compressed
//! blocks. The orchestrator uses this to size `download` transfers and to
//! totalise progress before any decompression starts.
//!
//! Layout reference: <https://tukaani.org/xz/xz-file-format.txt>, sections
//! 2.1.2 (stream footer) and 4 (index).

use std::io::{Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Stream footer length in bytes.
const FOOTER_LEN: usize = 12;

/// A uvarint never spans more than 10 bytes for a 64-bit value.
const MAX_UVARINT_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum XzError {
    #[error("footer magic mismatch")]
    FooterMagicMismatch,

    #[error("footer checksum mismatch: stored {stored:08x}, calculated {calculated:08x}")]
    ChecksumMismatch { stored: u32, calculated: u32 },

    #[error("invalid index marker: {0:#04x}")]
    InvalidIndexMarker(u8),

    #[error("uvarint overflows 64-bit unsigned integer")]
    Uvarint64Overflow,

    #[error("invalid length")]
    InvalidLength,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Total uncompressed size of the XZ stream in `r`.
///
/// Seeks to the footer, validates its `YZ` magic and CRC-32, locates the
/// index via the backward size and sums the uncompressed size of every
/// index record.
pub fn uncompressed_size<R: Read + Seek + ?Sized>(r: &mut R) -> Result<i64, XzError> {
    r.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN];
    r.read_exact(&mut footer)?;

    if &footer[10..12] != b"YZ" {
        return Err(XzError::FooterMagicMismatch);
    }
    let stored = LittleEndian::read_u32(&footer[0..4]);
    let calculated = crc32fast::hash(&footer[4..10]);
    if stored != calculated {
        return Err(XzError::ChecksumMismatch { stored, calculated });
    }

    // footer[8..10] are the stream flags, not needed here
    let backward_size = (u64::from(LittleEndian::read_u32(&footer[4..8])) + 1) * 4;
    let end = r.seek(SeekFrom::End(0))?;
    let index_offset = backward_size
        .checked_add(FOOTER_LEN as u64)
        .filter(|offset| *offset <= end)
        .ok_or(XzError::InvalidLength)?;
    r.seek(SeekFrom::Start(end - index_offset))?;

    let marker = read_byte(r)?;
    if marker != 0 {
        return Err(XzError::InvalidIndexMarker(marker));
    }

    let record_count = read_uvarint(r)?;
    let mut total: i64 = 0;
    for _ in 0..record_count {
        // unpadded size, not interesting
        read_uvarint(r)?;

        let record_size = read_uvarint(r)?;
        let record_size = i64::try_from(record_size).map_err(|_| XzError::InvalidLength)?;
        total = total
            .checked_add(record_size)
            .ok_or(XzError::InvalidLength)?;
    }
    Ok(total)
}

/// Reads an XZ-style uvarint: little-endian 7-bit groups, MSB set on
/// continuation bytes, at most 10 bytes. On the 10th byte only the values
/// 0 and 1 are representable.
pub(crate) fn read_uvarint<R: Read + ?Sized>(r: &mut R) -> Result<u64, XzError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for i in 0..MAX_UVARINT_LEN {
        let byte = read_byte(r)?;
        if byte < 0x80 {
            if i == MAX_UVARINT_LEN - 1 && byte > 1 {
                return Err(XzError::Uvarint64Overflow);
            }
            return Ok(value | (u64::from(byte) << shift));
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    Err(XzError::Uvarint64Overflow)
}

fn read_byte<R: Read + ?Sized>(r: &mut R) -> Result<u8, XzError> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)?;
    Ok(byte[0])
}
