//! Shared blob framing: magic + version + length + crc32c over the body.

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

pub(crate) const FRAME_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("blob truncated")]
    Truncated,
    #[error("magic mismatch {got:#010x}")]
    MagicMismatch { got: u32 },
    #[error("unsupported version {got} (supported {supported})")]
    UnsupportedVersion { got: u16, supported: u16 },
    #[error("crc mismatch (expected {expected:#010x}, got {got:#010x})")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("body invalid: {reason}")]
    BodyInvalid { reason: String },
}

pub(crate) fn seal_frame(magic: u32, version: u16, body: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(body).to_le_bytes());
    buf.extend_from_slice(body);
    Bytes::from(buf)
}

pub(crate) fn open_frame<'a>(
    magic: u32,
    version: u16,
    blob: &'a [u8],
) -> Result<&'a [u8], FrameError> {
    if blob.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let got_magic = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if got_magic != magic {
        return Err(FrameError::MagicMismatch { got: got_magic });
    }
    let got_version = u16::from_le_bytes([blob[4], blob[5]]);
    if got_version != version {
        return Err(FrameError::UnsupportedVersion {
            got: got_version,
            supported: version,
        });
    }
    let body_len = u32::from_le_bytes([blob[6], blob[7], blob[8], blob[9]]) as usize;
    let expected_crc = u32::from_le_bytes([blob[10], blob[11], blob[12], blob[13]]);

    let body = &blob[FRAME_HEADER_LEN..];
    if body.len() != body_len {
        return Err(FrameError::Truncated);
    }
    let actual_crc = crc32c(body);
    if actual_crc != expected_crc {
        return Err(FrameError::CrcMismatch {
            expected: expected_crc,
            got: actual_crc,
        });
    }
    Ok(body)
}

pub(crate) fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn write_slice(buf: &mut Vec<u8>, value: &[u8]) {
    write_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

pub(crate) fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64, FrameError> {
    let slice = take(bytes, offset, 8)?;
    Ok(u64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

pub(crate) fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, FrameError> {
    let slice = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, FrameError> {
    Ok(take(bytes, offset, 1)?[0])
}

pub(crate) fn read_slice<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], FrameError> {
    let len = read_u32(bytes, offset)? as usize;
    take(bytes, offset, len)
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], FrameError> {
    let end = offset.checked_add(len).ok_or(FrameError::Truncated)?;
    if end > bytes.len() {
        return Err(FrameError::Truncated);
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}
