//! Decoding of raw ring buffer samples into [`RequestRecord`] values.

use thiserror::Error;

use super::event::{RequestId, RequestRecord, RECORD_WIRE_SIZE};

/// Errors that can occur while decoding a sample.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("record too short: {size} bytes (want {})", RECORD_WIRE_SIZE)]
    Truncated { size: usize },
}

/// Decode one ring buffer sample. Trailing bytes are ignored so the kernel
/// side may grow the struct without breaking older readers.
pub fn parse_record(data: &[u8]) -> Result<RequestRecord, ParseError> {
    if data.len() < RECORD_WIRE_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    Ok(RequestRecord {
        start_ns: read_u64_le(data, 0),
        end_ns: read_u64_le(data, 8),
        payload_bytes: read_u64_le(data, 16),
        id: RequestId(read_u64_le(data, 24)),
    })
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    if let Some(src) = data.get(offset..offset + 8) {
        buf.copy_from_slice(src);
    }
    u64::from_le_bytes(buf)
}
