//! Store state: applied key/value maps, per-block deltas, durable segments.

pub(crate) mod codec;
mod delta;
mod snapshot;
mod store;

pub(crate) use delta::decode_deltas;
pub use delta::{encode_deltas, Delta, DeltaKind};
pub use snapshot::{
    decode_state, encode_state, parse_segment_key, segment_key, segment_prefix, SegmentKind,
    SegmentRef,
};
pub use store::{float64_value, int64_value, Store};

use thiserror::Error;

use crate::error::ErrorCode;
use crate::manifest::{UpdatePolicy, ValueType};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("store {store:?}: update policy {policy} cannot apply to {value_type} values")]
    PolicyValueMismatch {
        store: String,
        policy: UpdatePolicy,
        value_type: ValueType,
    },
    #[error("store {store:?}, key {key:?}: {reason}")]
    Value {
        store: String,
        key: String,
        reason: String,
    },
    #[error("store {store:?}: snapshot {key:?} corrupt: {reason}")]
    SnapshotCorrupt {
        store: String,
        key: String,
        reason: String,
    },
    #[error("store {store:?}: no full snapshot at or before block {at}")]
    SnapshotMissing { store: String, at: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::PolicyValueMismatch { .. } => ErrorCode::InvalidArgument,
            StateError::Value { .. } => ErrorCode::ModuleExecution,
            StateError::SnapshotCorrupt { .. } => ErrorCode::Storage,
            StateError::SnapshotMissing { .. } => ErrorCode::NotFound,
            StateError::Storage(e) => e.code(),
        }
    }
}
