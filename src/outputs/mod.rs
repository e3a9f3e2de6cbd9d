//! Content-addressed output cache.
//!
//! One cache per module, keyed by the module's fingerprint and partitioned
//! into fixed block intervals. A segment blob maps block numbers to the
//! module's output bytes for that interval; backfill replays cached
//! outputs instead of re-executing the module.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::manifest::Fingerprint;
use crate::state::{decode_deltas, encode_deltas, Delta};
use crate::storage::{ObjectStore, StorageError};

mod segment;

use segment::{decode_segment, encode_segment};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("output cache for {module:?}: segment {key:?} corrupt: {reason}")]
    Corrupt {
        module: String,
        key: String,
        reason: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Start of the interval containing `block`.
pub fn compute_interval_start(block: u64, save_interval: u64) -> u64 {
    if save_interval == 0 {
        return block;
    }
    block - block % save_interval
}

pub struct OutputCache {
    module: String,
    fingerprint: Fingerprint,
    save_interval: u64,
    object_store: Arc<dyn ObjectStore>,
    current_start: Option<u64>,
    outputs: BTreeMap<u64, Bytes>,
    dirty: bool,
}

impl OutputCache {
    /// Register a module's cache; the fingerprint decides the addressing
    /// path, so ancestry changes land in a fresh namespace.
    pub fn register_module(
        module: impl Into<String>,
        fingerprint: Fingerprint,
        object_store: Arc<dyn ObjectStore>,
        save_interval: u64,
    ) -> Self {
        Self {
            module: module.into(),
            fingerprint,
            save_interval,
            object_store,
            current_start: None,
            outputs: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    fn segment_key(&self, interval_start: u64) -> String {
        format!(
            "{}/{}/outputs-{interval_start}",
            self.module, self.fingerprint
        )
    }

    /// Fetch the segment containing `at_block`, replacing the open one.
    /// Returns whether a durable segment existed.
    pub fn load(&mut self, at_block: u64) -> Result<bool, CacheError> {
        let start = compute_interval_start(at_block, self.save_interval);
        let key = self.segment_key(start);
        self.current_start = Some(start);
        self.dirty = false;
        match self.object_store.get(&key) {
            Ok(blob) => {
                self.outputs = decode_segment(&blob).map_err(|e| CacheError::Corrupt {
                    module: self.module.clone(),
                    key,
                    reason: e.to_string(),
                })?;
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                self.outputs = BTreeMap::new();
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rotate the open segment when `block` crosses an interval boundary.
    pub fn update(&mut self, block: u64) -> Result<(), CacheError> {
        let start = compute_interval_start(block, self.save_interval);
        match self.current_start {
            Some(current) if current == start => Ok(()),
            _ => {
                self.save()?;
                self.load(block)?;
                Ok(())
            }
        }
    }

    /// Persist the open segment if it holds unsaved outputs.
    pub fn save(&mut self) -> Result<(), CacheError> {
        let Some(start) = self.current_start else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let key = self.segment_key(start);
        debug!(module = %self.module, %key, outputs = self.outputs.len(), "saving output segment");
        self.object_store.put(&key, encode_segment(&self.outputs))?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, block: u64) -> Option<&Bytes> {
        self.outputs.get(&block)
    }

    pub fn insert(&mut self, block: u64, output: Bytes) {
        self.outputs.insert(block, output);
        self.dirty = true;
    }

    /// Cached deltas for a store module's block, decoded.
    pub fn get_deltas(&self, block: u64) -> Result<Option<Vec<Delta>>, CacheError> {
        let Some(blob) = self.outputs.get(&block) else {
            return Ok(None);
        };
        let deltas = decode_deltas(blob).map_err(|e| CacheError::Corrupt {
            module: self.module.clone(),
            key: self.segment_key(self.current_start.unwrap_or_default()),
            reason: e.to_string(),
        })?;
        Ok(Some(deltas))
    }

    pub fn insert_deltas(&mut self, block: u64, deltas: &[Delta]) {
        self.insert(block, encode_deltas(deltas));
    }
}
