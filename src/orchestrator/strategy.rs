//! Ordered job planning.
//!
//! Jobs are planned per store over the uncovered range, chunked and
//! aligned to the save interval, and released only once every ancestor
//! store's squashed prefix reaches the job's start block.

use std::collections::BTreeMap;
use std::fmt;

use crate::manifest::ModuleGraph;
use crate::state::Store;
use crate::stream::BlockRange;

use super::storage_state::StorageState;
use super::OrchestrationError;

/// One sub-request: build `store_name` over `range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub store_name: String,
    pub range: BlockRange,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_name, self.range)
    }
}

#[derive(Debug)]
struct PlannedJob {
    job: Job,
    /// `(store, block)`: that store's squashed prefix must reach `block`.
    deps: Vec<(String, u64)>,
    released: bool,
}

pub struct OrderedStrategy {
    planned: Vec<PlannedJob>,
}

impl OrderedStrategy {
    /// Plan jobs for every store's uncovered range up to `up_to`.
    ///
    /// Returns the strategy plus the existing partial segments that line
    /// up with the planned chunking; those ranges are skipped and handed
    /// to the squasher instead of being recomputed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage_state: &StorageState,
        stores: &BTreeMap<String, Store>,
        graph: &ModuleGraph,
        up_to: u64,
        subrequest_range_size: u64,
        max_subrequest_range_size: u64,
        save_interval: u64,
    ) -> Result<(Self, Vec<(String, BlockRange)>), OrchestrationError> {
        let chunk = subrequest_range_size
            .max(1)
            .min(max_subrequest_range_size.max(1));

        let mut planned = Vec::new();
        let mut seeds = Vec::new();

        // Dependency order: ancestors plan before their dependents.
        for module in graph.modules() {
            let Some(store) = stores.get(&module.name) else {
                continue;
            };
            let state = &storage_state.stores[store.name()];
            let covered = state.covered_through();
            if covered >= up_to {
                continue;
            }

            let ancestors = graph
                .store_ancestors(store.name())
                .map_err(|_| OrchestrationError::StoresNotReady {
                    stores: vec![store.name().to_string()],
                })?;

            for range in plan_ranges(covered, up_to, chunk, save_interval) {
                // A sub-request persists one segment per save interval; a
                // job is skippable when every one of them already exists.
                let segments =
                    expected_segments(range, store.module_initial_block(), save_interval);
                if range.start > store.module_initial_block()
                    && segments.iter().all(|s| state.partials.contains(s))
                {
                    for segment in segments {
                        seeds.push((store.name().to_string(), segment));
                    }
                    continue;
                }
                let deps = ancestors
                    .iter()
                    .filter(|ancestor| {
                        stores
                            .get(*ancestor)
                            .map(|a| a.module_initial_block() < range.start)
                            .unwrap_or(false)
                    })
                    .map(|ancestor| (ancestor.clone(), range.start))
                    .collect();
                planned.push(PlannedJob {
                    job: Job {
                        store_name: store.name().to_string(),
                        range,
                    },
                    deps,
                    released: false,
                });
            }
        }

        Ok((Self { planned }, seeds))
    }

    /// Total number of jobs this strategy will release.
    pub fn request_count(&self) -> usize {
        self.planned.len()
    }

    /// Release every not-yet-released job whose prerequisites are
    /// satisfied by the given per-store squashed ends.
    pub fn release_ready(&mut self, progress: &BTreeMap<String, u64>) -> Vec<Job> {
        let mut released = Vec::new();
        for planned in &mut self.planned {
            if planned.released {
                continue;
            }
            let ready = planned.deps.iter().all(|(store, required)| {
                progress.get(store).map(|end| *end >= *required).unwrap_or(false)
            });
            if ready {
                planned.released = true;
                released.push(planned.job.clone());
            }
        }
        released
    }
}

/// The durable segments a completed job leaves behind.
///
/// A job starting at the store's module initial block writes one full
/// snapshot ending at the job's stop block; any other job rolls its
/// partial store at each save-interval boundary, leaving one partial
/// segment per interval.
pub(crate) fn expected_segments(
    range: BlockRange,
    module_initial_block: u64,
    save_interval: u64,
) -> Vec<BlockRange> {
    if range.start == module_initial_block || save_interval == 0 {
        return vec![range];
    }
    let mut out = Vec::new();
    let mut at = range.start;
    while at < range.end {
        let boundary = (at - at % save_interval).saturating_add(save_interval);
        let end = boundary.min(range.end).max(at + 1);
        out.push(BlockRange::new(at, end));
        at = end;
    }
    out
}

/// Chunk `[start, up_to)` into consecutive job ranges of at most `chunk`
/// blocks, ending on save-interval boundaries where possible.
fn plan_ranges(start: u64, up_to: u64, chunk: u64, save_interval: u64) -> Vec<BlockRange> {
    let mut out = Vec::new();
    let mut at = start;
    while at < up_to {
        let mut end = at.saturating_add(chunk).min(up_to);
        if save_interval > 0 && end < up_to {
            let aligned = end - end % save_interval;
            if aligned > at {
                end = aligned;
            }
        }
        out.push(BlockRange::new(at, end));
        at = end;
    }
    out
}
