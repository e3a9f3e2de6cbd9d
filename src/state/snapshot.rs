//! Store snapshot encoding and the durable layout of state segments.
//!
//! Layout: `{module}/{fingerprint}/{kind}-{start}-{end}` with
//! `kind ∈ {full, partial}`. The blob body is the applied state, ordered by
//! key, so identical state always yields identical bytes.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::manifest::Fingerprint;
use crate::stream::BlockRange;

use super::codec::{open_frame, read_slice, read_u64, seal_frame, write_slice, FrameError};

const SNAPSHOT_MAGIC: u32 = 0x4246_5353; // "BFSS"
const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentKind {
    Full,
    Partial,
}

impl SegmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Full => "full",
            SegmentKind::Partial => "partial",
        }
    }
}

/// A durable state segment reference parsed back from storage.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SegmentRef {
    pub kind: SegmentKind,
    pub range: BlockRange,
}

pub fn segment_key(
    module: &str,
    fingerprint: &Fingerprint,
    kind: SegmentKind,
    range: BlockRange,
) -> String {
    format!(
        "{module}/{fingerprint}/{}-{}-{}",
        kind.as_str(),
        range.start,
        range.end
    )
}

pub fn segment_prefix(module: &str, fingerprint: &Fingerprint) -> String {
    format!("{module}/{fingerprint}/")
}

/// Parse the trailing `{kind}-{start}-{end}` component of a storage key.
/// Keys that are not state segments (e.g. output caches) return `None`.
pub fn parse_segment_key(key: &str) -> Option<SegmentRef> {
    let name = key.rsplit('/').next()?;
    let (kind, rest) = if let Some(rest) = name.strip_prefix("full-") {
        (SegmentKind::Full, rest)
    } else if let Some(rest) = name.strip_prefix("partial-") {
        (SegmentKind::Partial, rest)
    } else {
        return None;
    };
    let (start, end) = rest.split_once('-')?;
    let start = start.parse().ok()?;
    let end = end.parse().ok()?;
    if start > end {
        return None;
    }
    Some(SegmentRef {
        kind,
        range: BlockRange::new(start, end),
    })
}

pub fn encode_state(state: &BTreeMap<String, Bytes>) -> Bytes {
    let mut body = Vec::new();
    super::codec::write_u64(&mut body, state.len() as u64);
    for (key, value) in state {
        write_slice(&mut body, key.as_bytes());
        write_slice(&mut body, value);
    }
    seal_frame(SNAPSHOT_MAGIC, SNAPSHOT_VERSION, &body)
}

pub fn decode_state(blob: &[u8]) -> Result<BTreeMap<String, Bytes>, FrameError> {
    let body = open_frame(SNAPSHOT_MAGIC, SNAPSHOT_VERSION, blob)?;
    let mut offset = 0usize;
    let count = read_u64(body, &mut offset)?;
    let mut out = BTreeMap::new();
    for _ in 0..count {
        let key = std::str::from_utf8(read_slice(body, &mut offset)?)
            .map_err(|_| FrameError::BodyInvalid {
                reason: "state key is not utf-8".to_string(),
            })?
            .to_string();
        let value = Bytes::copy_from_slice(read_slice(body, &mut offset)?);
        out.insert(key, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_idempotent() {
        let mut state = BTreeMap::new();
        state.insert("b".to_string(), Bytes::from_static(b"2"));
        state.insert("a".to_string(), Bytes::from_static(b"1"));
        assert_eq!(encode_state(&state), encode_state(&state));
        assert_eq!(decode_state(&encode_state(&state)).unwrap(), state);
    }

    #[test]
    fn segment_keys_parse_back() {
        let parsed = parse_segment_key("totals/00ff/partial-100-200").unwrap();
        assert_eq!(parsed.kind, SegmentKind::Partial);
        assert_eq!(parsed.range, BlockRange::new(100, 200));

        let parsed = parse_segment_key("totals/00ff/full-0-100").unwrap();
        assert_eq!(parsed.kind, SegmentKind::Full);

        assert!(parse_segment_key("totals/00ff/outputs-100").is_none());
        assert!(parse_segment_key("totals/00ff/full-9-3").is_none());
    }
}
