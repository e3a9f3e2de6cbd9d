//! Classification of a store's durable segments.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::{ModuleProgress, ModuleProgressKind, ProcessedRange};
use crate::state::{parse_segment_key, segment_prefix, SegmentKind, Store};
use crate::storage::ObjectStore;
use crate::stream::BlockRange;

use super::OrchestrationError;

/// What durable storage already holds for one store.
#[derive(Debug, Clone)]
pub struct StoreStorageState {
    pub store_name: String,
    pub module_initial_block: u64,
    /// Highest full snapshot end, if any: state covers `[initial, full_end]`.
    pub full_end: Option<u64>,
    /// Partial segments, sorted by start block.
    pub partials: Vec<BlockRange>,
}

impl StoreStorageState {
    /// First block that still needs building.
    pub fn covered_through(&self) -> u64 {
        self.full_end.unwrap_or(self.module_initial_block)
    }
}

#[derive(Debug, Clone)]
pub struct StorageState {
    pub stores: BTreeMap<String, StoreStorageState>,
}

impl StorageState {
    /// One progress message listing every store's completed ranges.
    pub fn progress_messages(&self) -> Vec<ModuleProgress> {
        let mut out = Vec::new();
        for state in self.stores.values() {
            let mut ranges = Vec::new();
            if let Some(full_end) = state.full_end {
                ranges.push(ProcessedRange {
                    start_block: state.module_initial_block,
                    end_block: full_end,
                });
            }
            for partial in &state.partials {
                ranges.push(ProcessedRange {
                    start_block: partial.start,
                    end_block: partial.end,
                });
            }
            if ranges.is_empty() {
                continue;
            }
            out.push(ModuleProgress {
                name: state.store_name.clone(),
                progress: ModuleProgressKind::ProcessedRanges { ranges },
            });
        }
        out
    }
}

/// Inspect durable storage and classify every store's existing segments.
pub fn fetch_storage_state(
    stores: &BTreeMap<String, Store>,
    object_store: &Arc<dyn ObjectStore>,
) -> Result<StorageState, OrchestrationError> {
    let mut out = BTreeMap::new();
    for store in stores.values() {
        let prefix = segment_prefix(store.name(), store.fingerprint());
        let mut full_end: Option<u64> = None;
        let mut partials = Vec::new();
        for key in object_store.list(&prefix)? {
            let Some(segment) = parse_segment_key(&key) else {
                continue;
            };
            match segment.kind {
                SegmentKind::Full => {
                    full_end = Some(full_end.map_or(segment.range.end, |e| e.max(segment.range.end)));
                }
                SegmentKind::Partial => partials.push(segment.range),
            }
        }
        partials.sort();
        out.insert(
            store.name().to_string(),
            StoreStorageState {
                store_name: store.name().to_string(),
                module_initial_block: store.module_initial_block(),
                full_end,
                partials,
            },
        );
    }
    Ok(StorageState { stores: out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        fingerprint_modules, Binary, Module, ModuleGraph, ModuleKind, UpdatePolicy, ValueType,
        SUPPORTED_VM_TYPE,
    };
    use crate::state::{encode_state, segment_key};
    use crate::storage::MemoryStore;
    use bytes::Bytes;

    fn store_fixture() -> (BTreeMap<String, Store>, Arc<dyn ObjectStore>) {
        let graph = ModuleGraph::new(vec![Module {
            name: "totals".to_string(),
            initial_block: 0,
            kind: ModuleKind::Store {
                update_policy: UpdatePolicy::Set,
                value_type: ValueType::String,
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
        let store = Store::new("totals", fp, UpdatePolicy::Set, ValueType::String, 0).unwrap();
        let mut stores = BTreeMap::new();
        stores.insert("totals".to_string(), store);
        (stores, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn classifies_fulls_and_partials() {
        let (stores, object_store) = store_fixture();
        let store = &stores["totals"];
        let empty = encode_state(&BTreeMap::new());
        for (kind, range) in [
            (SegmentKind::Full, BlockRange::new(0, 100)),
            (SegmentKind::Full, BlockRange::new(0, 200)),
            (SegmentKind::Partial, BlockRange::new(300, 400)),
            (SegmentKind::Partial, BlockRange::new(200, 300)),
        ] {
            let key = segment_key(store.name(), store.fingerprint(), kind, range);
            object_store.put(&key, empty.clone()).unwrap();
        }

        let state = fetch_storage_state(&stores, &object_store).unwrap();
        let totals = &state.stores["totals"];
        assert_eq!(totals.full_end, Some(200));
        assert_eq!(
            totals.partials,
            vec![BlockRange::new(200, 300), BlockRange::new(300, 400)]
        );
        assert_eq!(totals.covered_through(), 200);

        let progress = state.progress_messages();
        assert_eq!(progress.len(), 1);
        let ModuleProgressKind::ProcessedRanges { ranges } = &progress[0].progress else {
            panic!("expected processed ranges");
        };
        assert_eq!(ranges.len(), 3);
    }

    #[test]
    fn empty_storage_yields_no_progress() {
        let (stores, object_store) = store_fixture();
        let state = fetch_storage_state(&stores, &object_store).unwrap();
        assert!(state.progress_messages().is_empty());
        assert_eq!(state.stores["totals"].covered_through(), 0);
    }
}
