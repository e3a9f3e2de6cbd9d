//! Scheduler: drives the backfill to completion.
//!
//! Classifies storage, plans jobs, dispatches ready jobs to the worker
//! pool, and feeds completions to the squasher until every store's prefix
//! reaches the target block. One failure cancels the shared token and the
//! scheduler drains in-flight workers before propagating.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use tracing::{debug, info};

use crate::api::Response;
use crate::cancel::CancelToken;
use crate::manifest::ModuleGraph;
use crate::pipeline::PipelineError;
use crate::state::Store;
use crate::storage::ObjectStore;

use super::pool::RequestPool;
use super::squasher::Squasher;
use super::storage_state::fetch_storage_state;
use super::strategy::OrderedStrategy;
use super::worker::{JobResult, WorkerPool};
use super::OrchestrationError;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct SynchronizeArgs<'a> {
    pub stores: &'a BTreeMap<String, Store>,
    pub graph: &'a ModuleGraph,
    pub object_store: Arc<dyn ObjectStore>,
    /// Every store must be contiguous up to this block.
    pub up_to: u64,
    pub subrequest_range_size: u64,
    pub max_subrequest_range_size: u64,
    pub save_interval: u64,
    pub workers: Option<&'a WorkerPool>,
    pub sink: &'a mut (dyn FnMut(Response) -> crate::Result<()> + Send),
    pub cancel: &'a CancelToken,
}

/// Build every store up to `up_to` by parallel backfill. Returns once all
/// stores are squashed and their full snapshots are durable.
pub fn synchronize_stores(args: SynchronizeArgs<'_>) -> crate::Result<()> {
    let storage_state = fetch_storage_state(args.stores, &args.object_store)?;
    (args.sink)(Response::modules_progress(storage_state.progress_messages()))?;

    let mut squasher = Squasher::new(
        &storage_state,
        args.stores,
        args.up_to,
        args.save_interval,
        args.object_store.clone(),
    )?;
    let (mut strategy, seeds) = OrderedStrategy::new(
        &storage_state,
        args.stores,
        args.graph,
        args.up_to,
        args.subrequest_range_size,
        args.max_subrequest_range_size,
        args.save_interval,
    )?;

    // Existing partial segments merge without re-running their jobs.
    for (store_name, range) in seeds {
        squasher.on_segment_complete(&store_name, range)?;
    }

    let request_count = strategy.request_count();
    if request_count == 0 {
        squasher.stores_ready()?;
        return Ok(());
    }
    info!(request_count, up_to = args.up_to, "store synchronization planned");

    let Some(workers) = args.workers else {
        return Err(PipelineError::MissingWorkerPool.into());
    };

    let pool = RequestPool::new();
    for job in strategy.release_ready(&squasher.progress()) {
        pool.push(job);
    }

    let mut dispatched = 0usize;
    let mut completed = 0usize;
    let mut first_error: Option<crate::Error> = None;

    while let Some(job) = pool.pop() {
        debug!(%job, "dispatching job");
        workers.dispatch(job);
        dispatched += 1;
    }

    while completed < dispatched {
        if args.cancel.is_canceled() && first_error.is_none() {
            first_error = Some(OrchestrationError::Canceled.into());
        }

        let JobResult { job, result } = match workers.results().recv_timeout(RESULT_POLL_INTERVAL)
        {
            Ok(job_result) => job_result,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        completed += 1;
        debug!(%job, completed, dispatched, request_count, "job finished");

        match result {
            Err(err) => {
                if first_error.is_none() {
                    args.cancel.cancel();
                    first_error = Some(
                        OrchestrationError::WorkerFailed {
                            store: job.store_name.clone(),
                            range: job.range,
                            source: Box::new(err),
                        }
                        .into(),
                    );
                }
            }
            Ok(()) => {
                if first_error.is_none() {
                    squasher.on_segment_complete(&job.store_name, job.range)?;
                    for released in strategy.release_ready(&squasher.progress()) {
                        pool.push(released);
                    }
                    while let Some(next) = pool.pop() {
                        debug!(job = %next, "dispatching job");
                        workers.dispatch(next);
                        dispatched += 1;
                    }
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    squasher.stores_ready()?;
    info!("store sync completed");
    Ok(())
}
