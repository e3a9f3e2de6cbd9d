//! Squasher: merges partial store segments into contiguous state.
//!
//! Completion events arrive in any order; segments queue until the one
//! starting at the current end arrives, then the queue drains as far as
//! contiguity allows. Each merge persists a fresh full snapshot so the
//! linear pipeline can fetch the store once every segment has landed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::state::{decode_state, segment_key, SegmentKind, StateError, Store};
use crate::storage::ObjectStore;
use crate::stream::BlockRange;

use super::storage_state::StorageState;
use super::strategy::expected_segments;
use super::OrchestrationError;

struct SquashingStore {
    store: Store,
    current_end: u64,
    /// Not-yet-merged segments, keyed by start block.
    queued: BTreeMap<u64, BlockRange>,
}

pub struct Squasher {
    object_store: Arc<dyn ObjectStore>,
    up_to: u64,
    save_interval: u64,
    stores: BTreeMap<String, SquashingStore>,
}

impl Squasher {
    pub fn new(
        storage_state: &StorageState,
        stores: &BTreeMap<String, Store>,
        up_to: u64,
        save_interval: u64,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self, OrchestrationError> {
        let mut squashing = BTreeMap::new();
        for store in stores.values() {
            let state = &storage_state.stores[store.name()];
            let mut prefix = store.clone();
            let current_end = match state.full_end {
                Some(full_end) => {
                    prefix.fetch(full_end, &object_store)?;
                    full_end
                }
                None => store.module_initial_block(),
            };
            squashing.insert(
                store.name().to_string(),
                SquashingStore {
                    store: prefix,
                    current_end,
                    queued: BTreeMap::new(),
                },
            );
        }
        Ok(Self {
            object_store,
            up_to,
            save_interval,
            stores: squashing,
        })
    }

    /// A completed job covered `range`; queue the segments it persisted
    /// and merge as far as contiguity allows.
    pub fn on_segment_complete(
        &mut self,
        store_name: &str,
        range: BlockRange,
    ) -> Result<(), OrchestrationError> {
        let Some(entry) = self.stores.get_mut(store_name) else {
            warn!(store = store_name, "completion for unknown store");
            return Ok(());
        };
        let segments = expected_segments(
            range,
            entry.store.module_initial_block(),
            self.save_interval,
        );
        for segment in segments {
            if segment.end <= entry.current_end {
                // Already merged; squashing a segment twice is a no-op.
                debug!(store = store_name, %segment, "segment already squashed");
                continue;
            }
            entry.queued.insert(segment.start, segment);
        }
        Self::drain(entry, &self.object_store, self.up_to)
    }

    fn drain(
        entry: &mut SquashingStore,
        object_store: &Arc<dyn ObjectStore>,
        up_to: u64,
    ) -> Result<(), OrchestrationError> {
        while let Some(range) = entry.queued.remove(&entry.current_end) {
            let kind = if range.start == entry.store.module_initial_block() {
                SegmentKind::Full
            } else {
                SegmentKind::Partial
            };
            let key = segment_key(entry.store.name(), entry.store.fingerprint(), kind, range);
            let blob = object_store.get(&key)?;
            let segment = decode_state(&blob).map_err(|e| StateError::SnapshotCorrupt {
                store: entry.store.name().to_string(),
                key: key.clone(),
                reason: e.to_string(),
            })?;

            entry.store.merge_segment(&segment)?;
            entry.current_end = range.end;
            entry.store.write_state(entry.current_end, object_store)?;
            info!(
                store = entry.store.name(),
                %range,
                current_end = entry.current_end,
                "segment squashed"
            );

            if entry.current_end >= up_to {
                break;
            }
        }
        Ok(())
    }

    /// Per-store squashed end blocks, for the strategy's release checks.
    pub fn progress(&self) -> BTreeMap<String, u64> {
        self.stores
            .iter()
            .map(|(name, entry)| (name.clone(), entry.current_end))
            .collect()
    }

    /// Fails unless every store's prefix reaches the target block.
    pub fn stores_ready(&self) -> Result<(), OrchestrationError> {
        let lagging: Vec<String> = self
            .stores
            .iter()
            .filter(|(_, entry)| entry.current_end < self.up_to)
            .map(|(name, _)| name.clone())
            .collect();
        if lagging.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::StoresNotReady { stores: lagging })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        fingerprint_modules, Binary, Fingerprint, Module, ModuleGraph, ModuleKind, UpdatePolicy,
        ValueType, SUPPORTED_VM_TYPE,
    };
    use crate::orchestrator::fetch_storage_state;
    use crate::state::{encode_state, int64_value};
    use crate::storage::MemoryStore;
    use bytes::Bytes;

    fn fixture() -> (BTreeMap<String, Store>, Arc<dyn ObjectStore>, Fingerprint) {
        let graph = ModuleGraph::new(vec![Module {
            name: "totals".to_string(),
            initial_block: 0,
            kind: ModuleKind::Store {
                update_policy: UpdatePolicy::Add,
                value_type: ValueType::Int64,
            },
            inputs: vec![],
            binary_index: 0,
            entrypoint: "totals".to_string(),
        }])
        .unwrap();
        let binaries = vec![Binary {
            vm_type: SUPPORTED_VM_TYPE.to_string(),
            content: Bytes::from_static(b"\0wasm"),
        }];
        let fp = fingerprint_modules(&graph, &binaries).unwrap()["totals"];
        let store = Store::new("totals", fp, UpdatePolicy::Add, ValueType::Int64, 0).unwrap();
        let mut stores = BTreeMap::new();
        stores.insert("totals".to_string(), store);
        (stores, Arc::new(MemoryStore::new()), fp)
    }

    fn put_segment(
        object_store: &Arc<dyn ObjectStore>,
        fp: &Fingerprint,
        kind: SegmentKind,
        range: BlockRange,
        value: i64,
    ) {
        let mut state = BTreeMap::new();
        state.insert("count".to_string(), int64_value(value));
        let key = segment_key("totals", fp, kind, range);
        object_store.put(&key, encode_state(&state)).unwrap();
    }

    #[test]
    fn out_of_order_segments_merge_on_contiguity() {
        let (stores, object_store, fp) = fixture();
        put_segment(&object_store, &fp, SegmentKind::Full, BlockRange::new(0, 100), 1);
        put_segment(&object_store, &fp, SegmentKind::Partial, BlockRange::new(100, 200), 10);
        put_segment(&object_store, &fp, SegmentKind::Partial, BlockRange::new(200, 300), 100);

        let storage_state = fetch_storage_state(&stores, &object_store).unwrap();
        // Storage already lists the segments, but the squasher only acts
        // on completion events; seed from a blank classification instead.
        let blank = StorageState {
            stores: storage_state
                .stores
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.full_end = None;
                    v.partials = Vec::new();
                    (k.clone(), v)
                })
                .collect(),
        };
        let mut squasher = Squasher::new(&blank, &stores, 300, 100, object_store.clone()).unwrap();

        // Arrivals out of order: [200,300) queues, then [100,200) queues,
        // then [0,100) drains all three.
        squasher
            .on_segment_complete("totals", BlockRange::new(200, 300))
            .unwrap();
        assert_eq!(squasher.progress()["totals"], 0);
        squasher
            .on_segment_complete("totals", BlockRange::new(100, 200))
            .unwrap();
        assert_eq!(squasher.progress()["totals"], 0);
        squasher
            .on_segment_complete("totals", BlockRange::new(0, 100))
            .unwrap();
        assert_eq!(squasher.progress()["totals"], 300);
        squasher.stores_ready().unwrap();

        // Policy-aware merge: add sums the three segments.
        let full_key = segment_key("totals", &fp, SegmentKind::Full, BlockRange::new(0, 300));
        let merged = decode_state(&object_store.get(&full_key).unwrap()).unwrap();
        assert_eq!(merged["count"], int64_value(111));
    }

    #[test]
    fn duplicate_completion_is_a_noop() {
        let (stores, object_store, fp) = fixture();
        put_segment(&object_store, &fp, SegmentKind::Full, BlockRange::new(0, 100), 1);

        let storage_state = StorageState {
            stores: fetch_storage_state(&stores, &object_store)
                .unwrap()
                .stores
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.full_end = None;
                    v.partials = Vec::new();
                    (k.clone(), v)
                })
                .collect(),
        };
        let mut squasher = Squasher::new(&storage_state, &stores, 100, 100, object_store).unwrap();
        squasher
            .on_segment_complete("totals", BlockRange::new(0, 100))
            .unwrap();
        squasher
            .on_segment_complete("totals", BlockRange::new(0, 100))
            .unwrap();
        assert_eq!(squasher.progress()["totals"], 100);
        squasher.stores_ready().unwrap();
    }

    #[test]
    fn unfinished_store_fails_readiness() {
        let (stores, object_store, _fp) = fixture();
        let storage_state = fetch_storage_state(&stores, &object_store).unwrap();
        let squasher = Squasher::new(&storage_state, &stores, 100, 100, object_store).unwrap();
        let err = squasher.stores_ready().unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::StoresNotReady { stores } if stores == vec!["totals".to_string()]
        ));
    }
}
