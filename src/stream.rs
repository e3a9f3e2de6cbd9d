//! Block stream primitives: clocks, cursors, steps, and ranges.
//!
//! The block-streaming source is an external collaborator; this module pins
//! down the handler contract it drives and the cursor grammar it must
//! round-trip.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scratch-map key under which the serialized clock is exposed to modules.
pub const CLOCK_INPUT_KEY: &str = "blockflow.v1.Clock";

const CURSOR_PREFIX: &str = "c1";

/// Progression step attached to each streamed block.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    New,
    Undo,
    Irreversible,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::New => "new",
            Step::Undo => "undo",
            Step::Irreversible => "irreversible",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Step::New),
            "undo" => Some(Step::Undo),
            "irreversible" => Some(Step::Irreversible),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a block: number plus chain-level id.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub num: u64,
    pub id: String,
}

impl BlockRef {
    pub fn new(num: u64, id: impl Into<String>) -> Self {
        Self { num, id: id.into() }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// Per-block clock. Immutable for the duration of a block's processing.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    pub number: u64,
    pub id: String,
    pub timestamp_ms: u64,
}

impl Clock {
    /// Canonical byte encoding exposed to modules under [`CLOCK_INPUT_KEY`].
    pub fn encode(&self) -> Bytes {
        let buf = serde_json::to_vec(self).expect("clock serialization is infallible");
        Bytes::from(buf)
    }
}

/// A streamed block. The payload bytes are opaque to the engine; the block
/// type string travels separately as configuration.
#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub id: String,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl Block {
    pub fn clock(&self) -> Clock {
        Clock {
            number: self.number,
            id: self.id.clone(),
            timestamp_ms: self.timestamp_ms,
        }
    }

    pub fn as_ref(&self) -> BlockRef {
        BlockRef::new(self.number, self.id.clone())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is empty")]
    Empty,
    #[error("malformed cursor: {reason}")]
    Malformed { reason: String },
}

/// Opaque resumption token with `(block, step)` semantics.
///
/// `Cursor::from_opaque(c.to_opaque()) == c` holds for every cursor.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cursor {
    pub block: BlockRef,
    pub step: Step,
}

impl Cursor {
    pub fn new(block: BlockRef, step: Step) -> Self {
        Self { block, step }
    }

    pub fn to_opaque(&self) -> String {
        let plain = format!(
            "{CURSOR_PREFIX}:{}:{}:{}",
            self.step.as_str(),
            self.block.num,
            self.block.id
        );
        URL_SAFE_NO_PAD.encode(plain.as_bytes())
    }

    pub fn from_opaque(opaque: &str) -> Result<Self, CursorError> {
        if opaque.is_empty() {
            return Err(CursorError::Empty);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(opaque.as_bytes())
            .map_err(|e| CursorError::Malformed {
                reason: e.to_string(),
            })?;
        let text = String::from_utf8(raw).map_err(|_| CursorError::Malformed {
            reason: "cursor is not utf-8".to_string(),
        })?;

        let mut parts = text.splitn(4, ':');
        let prefix = parts.next().unwrap_or_default();
        if prefix != CURSOR_PREFIX {
            return Err(CursorError::Malformed {
                reason: format!("unknown cursor version {prefix:?}"),
            });
        }
        let step = parts
            .next()
            .and_then(Step::parse)
            .ok_or_else(|| CursorError::Malformed {
                reason: "unknown cursor step".to_string(),
            })?;
        let num = parts
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| CursorError::Malformed {
                reason: "bad block number".to_string(),
            })?;
        let id = parts.next().ok_or_else(|| CursorError::Malformed {
            reason: "missing block id".to_string(),
        })?;

        Ok(Cursor {
            block: BlockRef::new(num, id),
            step,
        })
    }
}

/// Half-open block range `[start, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}..{end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, num: u64) -> bool {
        num >= self.start && num < self.end
    }

    /// Split into consecutive chunks of at most `chunk` blocks.
    pub fn split(&self, chunk: u64) -> Vec<BlockRange> {
        assert!(chunk > 0, "chunk size must be positive");
        let mut out = Vec::new();
        let mut at = self.start;
        while at < self.end {
            let end = (at + chunk).min(self.end);
            out.push(BlockRange::new(at, end));
            at = end;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// What the handler wants the source to do after a block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandlerFlow {
    Continue,
    EndOfStream,
}

/// Push-based per-block handler contract: `(block, cursor, step) → result`.
pub trait BlockHandler {
    fn handle_block(
        &mut self,
        block: &Block,
        cursor: &Cursor,
        step: Step,
    ) -> crate::Result<HandlerFlow>;
}

/// The block-streaming source. Drives a handler over a contiguous range,
/// stopping early when the handler signals end-of-stream.
pub trait BlockSource: Send + Sync {
    fn stream_range(&self, range: BlockRange, handler: &mut dyn BlockHandler)
        -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor::new(BlockRef::new(49, "0xabc"), Step::Irreversible);
        let opaque = cursor.to_opaque();
        assert_eq!(Cursor::from_opaque(&opaque).unwrap(), cursor);
    }

    #[test]
    fn cursor_preserves_colons_in_id() {
        let cursor = Cursor::new(BlockRef::new(7, "a:b:c"), Step::New);
        assert_eq!(Cursor::from_opaque(&cursor.to_opaque()).unwrap(), cursor);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert_eq!(Cursor::from_opaque(""), Err(CursorError::Empty));
        assert!(matches!(
            Cursor::from_opaque("not-base64!!"),
            Err(CursorError::Malformed { .. })
        ));
        let bogus = URL_SAFE_NO_PAD.encode(b"c9:new:1:x");
        assert!(matches!(
            Cursor::from_opaque(&bogus),
            Err(CursorError::Malformed { .. })
        ));
    }

    #[test]
    fn range_split_covers_without_overlap() {
        let range = BlockRange::new(0, 2500);
        let chunks = range.split(1000);
        assert_eq!(
            chunks,
            vec![
                BlockRange::new(0, 1000),
                BlockRange::new(1000, 2000),
                BlockRange::new(2000, 2500),
            ]
        );
    }

    #[test]
    fn clock_encoding_is_deterministic() {
        let clock = Clock {
            number: 12,
            id: "b12".to_string(),
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(clock.encode(), clock.encode());
    }
}
