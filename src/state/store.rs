//! Versioned, append-accumulating key/value store.
//!
//! A store is the materialized state of one store-kind module. Mutations
//! during a block are folded into applied state immediately (so the block's
//! later modules observe them) and recorded as ordered deltas; the delta
//! buffer resets at end of block. Snapshots and partial segments are
//! persisted through [`crate::storage::ObjectStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::manifest::{Fingerprint, UpdatePolicy, ValueType};
use crate::storage::ObjectStore;
use crate::stream::BlockRange;

use super::delta::{Delta, DeltaKind};
use super::snapshot::{
    decode_state, encode_state, parse_segment_key, segment_key, segment_prefix, SegmentKind,
};
use super::StateError;

#[derive(Debug, Clone)]
pub struct Store {
    name: String,
    fingerprint: Fingerprint,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    module_initial_block: u64,
    store_initial_block: u64,
    state: BTreeMap<String, Bytes>,
    deltas: Vec<Delta>,
}

impl Store {
    pub fn new(
        name: impl Into<String>,
        fingerprint: Fingerprint,
        update_policy: UpdatePolicy,
        value_type: ValueType,
        initial_block: u64,
    ) -> Result<Self, StateError> {
        let name = name.into();
        let numeric = matches!(value_type, ValueType::Int64 | ValueType::Float64);
        let concat = matches!(value_type, ValueType::String | ValueType::Bytes);
        let compatible = match update_policy {
            UpdatePolicy::Set | UpdatePolicy::SetIfNotExists => true,
            UpdatePolicy::Add | UpdatePolicy::Min | UpdatePolicy::Max => numeric,
            UpdatePolicy::Append => concat,
        };
        if !compatible {
            return Err(StateError::PolicyValueMismatch {
                store: name,
                policy: update_policy,
                value_type,
            });
        }
        Ok(Self {
            name,
            fingerprint,
            update_policy,
            value_type,
            module_initial_block: initial_block,
            store_initial_block: initial_block,
            state: BTreeMap::new(),
            deltas: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    pub fn module_initial_block(&self) -> u64 {
        self.module_initial_block
    }

    pub fn store_initial_block(&self) -> u64 {
        self.store_initial_block
    }

    /// A store is partial when its state starts above the module's initial
    /// block; the missing prefix lives in earlier segments.
    pub fn is_partial(&self) -> bool {
        self.store_initial_block != self.module_initial_block
    }

    /// Mark this store as a partial-segment producer starting at `block`.
    pub fn mark_partial(&mut self, block: u64) {
        self.store_initial_block = block;
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.state.get(key)
    }

    /// The in-flight ordered mutations of the current block.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn state(&self) -> &BTreeMap<String, Bytes> {
        &self.state
    }

    /// Apply one mutation under the declared update policy. This is the
    /// only mutator: a module bound to this store cannot issue any other
    /// operation, so wrong-policy calls are unrepresentable.
    pub fn apply(&mut self, key: &str, value: Bytes) -> Result<(), StateError> {
        let old = self.state.get(key).cloned();
        let new_value = match self.fold(key, old.as_ref(), value)? {
            Some(v) => v,
            None => return Ok(()), // set_if_not_exists on an existing key
        };

        let kind = if old.is_some() {
            DeltaKind::Update
        } else {
            DeltaKind::Create
        };
        self.deltas.push(Delta {
            kind,
            key: key.to_string(),
            old_value: old,
            new_value: new_value.clone(),
        });
        self.state.insert(key.to_string(), new_value);
        Ok(())
    }

    /// Replay deltas recorded by an earlier identical run (output-cache
    /// hit). The fold already happened when they were recorded.
    pub fn replay_deltas(&mut self, deltas: &[Delta]) {
        for delta in deltas {
            self.state
                .insert(delta.key.clone(), delta.new_value.clone());
            self.deltas.push(delta.clone());
        }
    }

    /// End-of-block: the deltas are already folded into applied state, so
    /// flushing just resets the buffer for the next block.
    pub fn flush(&mut self) {
        self.deltas.clear();
    }

    /// Merge a later segment's state into this store under the update
    /// policy. `self` must cover the range immediately preceding the
    /// segment for the result to be meaningful.
    pub fn merge_segment(&mut self, segment: &BTreeMap<String, Bytes>) -> Result<(), StateError> {
        for (key, incoming) in segment {
            let old = self.state.get(key).cloned();
            if let Some(folded) = self.fold(key, old.as_ref(), incoming.clone())? {
                self.state.insert(key.clone(), folded);
            }
        }
        Ok(())
    }

    /// Clear applied state and the delta buffer.
    pub fn truncate(&mut self) {
        self.state.clear();
        self.deltas.clear();
    }

    /// Advance the segment start; used after a partial snapshot is emitted.
    pub fn roll(&mut self, block: u64) {
        self.store_initial_block = block;
    }

    /// Persist the applied state at `block` and return the written key.
    pub fn write_state(
        &self,
        block: u64,
        store: &Arc<dyn ObjectStore>,
    ) -> Result<String, StateError> {
        let (kind, start) = if self.is_partial() {
            (SegmentKind::Partial, self.store_initial_block)
        } else {
            (SegmentKind::Full, self.module_initial_block)
        };
        let key = segment_key(
            &self.name,
            &self.fingerprint,
            kind,
            BlockRange::new(start, block),
        );
        store.put(&key, encode_state(&self.state))?;
        Ok(key)
    }

    /// Load the most recent full snapshot ending at or before `block`.
    /// Returns the end block of the loaded snapshot.
    pub fn fetch(&mut self, block: u64, store: &Arc<dyn ObjectStore>) -> Result<u64, StateError> {
        let prefix = segment_prefix(&self.name, &self.fingerprint);
        let mut best: Option<u64> = None;
        for key in store.list(&prefix)? {
            let Some(segment) = parse_segment_key(&key) else {
                continue;
            };
            if segment.kind == SegmentKind::Full && segment.range.end <= block {
                best = Some(best.map_or(segment.range.end, |b| b.max(segment.range.end)));
            }
        }
        let Some(end) = best else {
            return Err(StateError::SnapshotMissing {
                store: self.name.clone(),
                at: block,
            });
        };
        let key = segment_key(
            &self.name,
            &self.fingerprint,
            SegmentKind::Full,
            BlockRange::new(self.module_initial_block, end),
        );
        let blob = store.get(&key)?;
        self.state = decode_state(&blob).map_err(|e| StateError::SnapshotCorrupt {
            store: self.name.clone(),
            key,
            reason: e.to_string(),
        })?;
        self.deltas.clear();
        Ok(end)
    }

    fn fold(
        &self,
        key: &str,
        old: Option<&Bytes>,
        incoming: Bytes,
    ) -> Result<Option<Bytes>, StateError> {
        let value_err = |reason: String| StateError::Value {
            store: self.name.clone(),
            key: key.to_string(),
            reason,
        };

        let folded = match self.update_policy {
            UpdatePolicy::Set => Some(incoming),
            UpdatePolicy::SetIfNotExists => {
                if old.is_some() {
                    None
                } else {
                    Some(incoming)
                }
            }
            UpdatePolicy::Add => match self.value_type {
                ValueType::Int64 => {
                    let sum = decode_i64(old, &value_err)?
                        .wrapping_add(as_i64(&incoming, &value_err)?);
                    Some(Bytes::copy_from_slice(&sum.to_le_bytes()))
                }
                _ => {
                    let sum = decode_f64(old, &value_err)? + as_f64(&incoming, &value_err)?;
                    Some(Bytes::copy_from_slice(&sum.to_le_bytes()))
                }
            },
            UpdatePolicy::Min | UpdatePolicy::Max => {
                let Some(old) = old else {
                    return Ok(Some(incoming));
                };
                let keep_old = match self.value_type {
                    ValueType::Int64 => {
                        let old_v = as_i64(old, &value_err)?;
                        let new_v = as_i64(&incoming, &value_err)?;
                        if self.update_policy == UpdatePolicy::Min {
                            old_v <= new_v
                        } else {
                            old_v >= new_v
                        }
                    }
                    _ => {
                        let old_v = as_f64(old, &value_err)?;
                        let new_v = as_f64(&incoming, &value_err)?;
                        if self.update_policy == UpdatePolicy::Min {
                            old_v <= new_v
                        } else {
                            old_v >= new_v
                        }
                    }
                };
                if keep_old {
                    // Still a mutation from the module's point of view, but
                    // the applied value is unchanged; record nothing.
                    None
                } else {
                    Some(incoming)
                }
            }
            UpdatePolicy::Append => {
                let mut buf = Vec::with_capacity(
                    old.map(|o| o.len()).unwrap_or(0) + incoming.len(),
                );
                if let Some(old) = old {
                    buf.extend_from_slice(old);
                }
                buf.extend_from_slice(&incoming);
                Some(Bytes::from(buf))
            }
        };
        Ok(folded)
    }
}

fn as_i64(
    bytes: &Bytes,
    err: &impl Fn(String) -> StateError,
) -> Result<i64, StateError> {
    let arr: [u8; 8] = bytes
        .as_ref()
        .try_into()
        .map_err(|_| err(format!("expected 8-byte int64, got {} bytes", bytes.len())))?;
    Ok(i64::from_le_bytes(arr))
}

fn as_f64(
    bytes: &Bytes,
    err: &impl Fn(String) -> StateError,
) -> Result<f64, StateError> {
    let arr: [u8; 8] = bytes
        .as_ref()
        .try_into()
        .map_err(|_| err(format!("expected 8-byte float64, got {} bytes", bytes.len())))?;
    Ok(f64::from_le_bytes(arr))
}

fn decode_i64(
    old: Option<&Bytes>,
    err: &impl Fn(String) -> StateError,
) -> Result<i64, StateError> {
    old.map_or(Ok(0), |b| as_i64(b, err))
}

fn decode_f64(
    old: Option<&Bytes>,
    err: &impl Fn(String) -> StateError,
) -> Result<f64, StateError> {
    old.map_or(Ok(0.0), |b| as_f64(b, err))
}

/// Little-endian int64 store value.
pub fn int64_value(v: i64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

/// Little-endian float64 store value.
pub fn float64_value(v: f64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}
