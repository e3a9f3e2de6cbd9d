//! The per-block execution driver.
//!
//! Build phase wires the module DAG, stores, and output caches; prepare
//! phase either backfills stores through the orchestrator (top-level) or
//! marks the leaf partial store (sub-request); the block handler then runs
//! executors in DAG order, emits outputs and progress, and snapshots
//! stores on interval boundaries.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::api::{
    BlockScopedData, FailedProgress, ModuleOutput, ModuleProgress, ModuleProgressKind,
    ProcessedRange, Request, Response,
};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::manifest::{
    fingerprint_modules, validate_binaries, Fingerprint, Module, ModuleGraph, ModuleKind,
};
use crate::orchestrator::{synchronize_stores, SynchronizeArgs, WorkerPool};
use crate::outputs::{compute_interval_start, OutputCache};
use crate::runtime::ModuleRuntime;
use crate::state::Store;
use crate::storage::ObjectStore;
use crate::stream::{Block, BlockHandler, Clock, Cursor, HandlerFlow, Step, CLOCK_INPUT_KEY};

use super::executor::{ExecutionFailure, ModuleExecutor};
use super::resolve::{resolve_request_details, RequestDetails};
use super::PipelineError;

pub type ResponseFn = Box<dyn FnMut(Response) -> crate::Result<()> + Send>;
pub type BlockHook = Box<dyn FnMut(&Clock) -> crate::Result<()> + Send>;
pub type PostJobHook = Box<dyn FnMut(Option<&Clock>) + Send>;

pub struct Pipeline {
    details: RequestDetails,
    engine: EngineConfig,
    graph: ModuleGraph,
    fingerprints: BTreeMap<String, Fingerprint>,
    object_store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ModuleRuntime>,
    sink: ResponseFn,
    cancel: CancelToken,

    /// Execution set in DAG order (ancestors of the output modules).
    modules: Vec<Module>,
    stores: BTreeMap<String, Store>,
    /// Store names in dependency order.
    store_order: Vec<String>,
    /// Leaf stores producing partial segments (sub-request mode).
    leaf_stores: Vec<String>,
    executors: Vec<ModuleExecutor>,
    caches: BTreeMap<String, OutputCache>,

    scratch: BTreeMap<String, Bytes>,
    module_outputs: Vec<ModuleOutput>,
    clock: Option<Clock>,

    pre_block_hooks: Vec<BlockHook>,
    post_job_hooks: Vec<PostJobHook>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Request,
        is_sub_request: bool,
        recent_final_block: impl FnOnce() -> Option<u64>,
        engine: EngineConfig,
        object_store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ModuleRuntime>,
        sink: ResponseFn,
        cancel: CancelToken,
    ) -> crate::Result<Self> {
        let details = resolve_request_details(request, is_sub_request, recent_final_block)?;
        validate_binaries(&details.request.binaries)?;
        let graph = ModuleGraph::new(details.request.modules.clone())?;
        let fingerprints = fingerprint_modules(&graph, &details.request.binaries)?;

        info!(
            start_block = details.request_start_block,
            stop_block = details.stop_block,
            is_sub_request,
            outputs = ?details.request.output_modules,
            "initializing pipeline"
        );

        Ok(Self {
            details,
            engine,
            graph,
            fingerprints,
            object_store,
            runtime,
            sink,
            cancel,
            modules: Vec::new(),
            stores: BTreeMap::new(),
            store_order: Vec::new(),
            leaf_stores: Vec::new(),
            executors: Vec::new(),
            caches: BTreeMap::new(),
            scratch: BTreeMap::new(),
            module_outputs: Vec::new(),
            clock: None,
            pre_block_hooks: Vec::new(),
            post_job_hooks: Vec::new(),
        })
    }

    pub fn with_pre_block_hook(mut self, hook: BlockHook) -> Self {
        self.pre_block_hooks.push(hook);
        self
    }

    pub fn with_post_job_hook(mut self, hook: PostJobHook) -> Self {
        self.post_job_hooks.push(hook);
        self
    }

    pub fn details(&self) -> &RequestDetails {
        &self.details
    }

    /// Build and prepare: after this, the pipeline is ready to receive
    /// blocks. Top-level requests with stores below the start block need a
    /// worker pool for backfill.
    pub fn init(&mut self, workers: Option<&WorkerPool>) -> crate::Result<()> {
        self.build()?;
        self.prepare(workers)?;
        self.instantiate_executors()?;
        self.load_caches()?;
        Ok(())
    }

    fn build(&mut self) -> crate::Result<()> {
        let outputs = self.details.request.output_modules.clone();
        self.modules = self
            .graph
            .modules_down_to(&outputs)?
            .into_iter()
            .cloned()
            .collect();

        for module in &self.modules {
            if self.details.is_output_module(&module.name)
                && module.initial_block > self.details.request_start_block
            {
                return Err(PipelineError::StartBlockBeforeModule {
                    module: module.name.clone(),
                    module_initial_block: module.initial_block,
                    start_block: self.details.request_start_block,
                }
                .into());
            }
        }

        for module in &self.modules {
            if let ModuleKind::Store {
                update_policy,
                value_type,
            } = &module.kind
            {
                let store = Store::new(
                    module.name.clone(),
                    self.fingerprints[&module.name],
                    *update_policy,
                    *value_type,
                    module.initial_block,
                )?;
                self.store_order.push(module.name.clone());
                self.stores.insert(module.name.clone(), store);
            }

            let cache = OutputCache::register_module(
                module.name.clone(),
                self.fingerprints[&module.name],
                self.object_store.clone(),
                self.engine.output_cache_save_interval,
            );
            self.caches.insert(module.name.clone(), cache);
        }

        Ok(())
    }

    fn prepare(&mut self, workers: Option<&WorkerPool>) -> crate::Result<()> {
        if self.details.is_sub_request {
            self.mark_leaf_store();
        } else if !self.stores.is_empty() {
            info!(up_to = self.details.request_start_block, "synchronizing stores");
            synchronize_stores(SynchronizeArgs {
                stores: &self.stores,
                graph: &self.graph,
                object_store: self.object_store.clone(),
                up_to: self.details.request_start_block,
                subrequest_range_size: self.engine.subrequest_range_size,
                max_subrequest_range_size: self
                    .engine
                    .max_subrequest_range_size
                    .min(self.engine.max_store_sync_range),
                save_interval: self.engine.store_snapshot_interval,
                workers,
                sink: &mut *self.sink,
                cancel: &self.cancel,
            })?;
        }

        self.load_stores()?;
        Ok(())
    }

    /// In a sub-request, the single output must be a store and the last
    /// store in dependency order; it then produces partial segments from
    /// the request's start block. Any violation downgrades the store to
    /// read-only instead of failing the request.
    fn mark_leaf_store(&mut self) {
        let outputs = &self.details.request.output_modules;
        if outputs.len() != 1 {
            info!(output_count = outputs.len(), "conditions for leaf store not met");
            return;
        }
        let name = &outputs[0];
        let is_last_store = self.store_order.last().map(|s| s == name).unwrap_or(false);
        if !self.stores.contains_key(name) || !is_last_store {
            info!(module = %name, is_last_store, "conditions for leaf store not met");
            return;
        }

        info!(module = %name, "marking leaf store for partial processing");
        let start = self.details.request_start_block;
        if let Some(store) = self.stores.get_mut(name) {
            store.mark_partial(start);
        }
        self.leaf_stores.push(name.clone());
    }

    fn load_stores(&mut self) -> crate::Result<()> {
        let start = self.details.request_start_block;
        let object_store = self.object_store.clone();
        for store in self.stores.values_mut() {
            if store.is_partial() {
                continue; // leaf partial producers start empty
            }
            if store.module_initial_block() >= start {
                continue; // nothing durable to load yet
            }
            let loaded = store.fetch(start, &object_store)?;
            debug!(store = store.name(), loaded_through = loaded, "store loaded");
        }
        Ok(())
    }

    fn instantiate_executors(&mut self) -> crate::Result<()> {
        for module in &self.modules {
            let binary = &self.details.request.binaries[module.binary_index];
            let instance =
                self.runtime
                    .instantiate(&module.name, binary, &module.entrypoint, &module.inputs)?;
            let is_output = self.details.is_output_module(&module.name);
            self.executors
                .push(ModuleExecutor::new(module.clone(), is_output, instance));
        }
        Ok(())
    }

    fn load_caches(&mut self) -> crate::Result<()> {
        let at = compute_interval_start(
            self.details.request_start_block,
            self.engine.output_cache_save_interval,
        );
        for cache in self.caches.values_mut() {
            cache.load(at)?;
        }
        Ok(())
    }

    fn process_block(
        &mut self,
        block: &Block,
        cursor: &Cursor,
        step: Step,
    ) -> crate::Result<HandlerFlow> {
        let clock = block.clock();
        self.clock = Some(clock.clone());

        for cache in self.caches.values_mut() {
            cache.update(block.number)?;
        }
        for hook in &mut self.pre_block_hooks {
            hook(&clock)?;
        }
        self.scratch.clear();
        self.module_outputs.clear();

        let num = block.number;
        let start = self.details.request_start_block;
        let stop = self.details.stop_block;
        let interval = self.engine.store_snapshot_interval;

        // Interval snapshots fire only for blocks that will execute; the
        // stop block persists through the termination branch below.
        let before_stop = stop == 0 || num < stop;
        if num > start && before_stop && interval != 0 && num % interval == 0 {
            self.save_store_snapshots(num, false)?;
        }

        if stop != 0 && num >= stop {
            if self.details.is_sub_request {
                self.save_store_snapshots(stop, true)?;
                for cache in self.caches.values_mut() {
                    cache.save()?;
                }
            }
            debug!(block = num, stop, "stop block reached");
            return Ok(HandlerFlow::EndOfStream);
        }

        debug!(block = num, "processing block");

        self.scratch
            .insert(self.engine.block_type.clone(), block.payload.clone());
        self.scratch
            .insert(CLOCK_INPUT_KEY.to_string(), clock.encode());

        if let Err(failure) = self.run_executors(&clock) {
            self.emit_failure_progress(&failure)?;
            return Err(failure.error.into());
        }

        if num >= start {
            self.emit_block_data(&clock, cursor, step)?;
        }

        for store in self.stores.values_mut() {
            store.flush();
        }

        debug!(block = num, "block processed");
        Ok(HandlerFlow::Continue)
    }

    fn run_executors(&mut self, clock: &Clock) -> Result<(), ExecutionFailure> {
        let Pipeline {
            executors,
            stores,
            caches,
            scratch,
            module_outputs,
            engine,
            ..
        } = self;

        for executor in executors.iter_mut() {
            debug!(module = %executor.module.name, "executing");
            let cache = caches
                .get_mut(&executor.module.name)
                .expect("cache registered for every module");

            let outcome = if executor.module.kind.is_store() {
                let mut own = stores
                    .remove(&executor.module.name)
                    .expect("store allocated for every store module");
                let result = executor.execute(
                    clock,
                    scratch,
                    stores,
                    Some(&mut own),
                    cache,
                    engine.max_module_log_bytes,
                );
                stores.insert(executor.module.name.clone(), own);
                result
            } else {
                executor.execute(
                    clock,
                    scratch,
                    stores,
                    None,
                    cache,
                    engine.max_module_log_bytes,
                )
            };

            module_outputs.push(outcome?);
        }
        Ok(())
    }

    fn emit_block_data(
        &mut self,
        clock: &Clock,
        cursor: &Cursor,
        step: Step,
    ) -> crate::Result<()> {
        if self.details.is_sub_request {
            // Sub-requests exist to produce store segments; their callers
            // consume progress, not block data.
            if !self.leaf_stores.is_empty() {
                let mut progress = Vec::with_capacity(self.leaf_stores.len());
                for name in &self.leaf_stores {
                    let store = &self.stores[name];
                    progress.push(ModuleProgress {
                        name: name.clone(),
                        progress: ModuleProgressKind::ProcessedRanges {
                            ranges: vec![ProcessedRange {
                                start_block: store.store_initial_block(),
                                end_block: clock.number,
                            }],
                        },
                    });
                }
                (self.sink)(Response::modules_progress(progress))?;
            }
            return Ok(());
        }

        if !self.module_outputs.is_empty() {
            debug!(outputs = self.module_outputs.len(), "emitting block data");
            let data = BlockScopedData {
                outputs: self.module_outputs.clone(),
                clock: clock.clone(),
                step,
                cursor: cursor.to_opaque(),
            };
            (self.sink)(Response::BlockScopedData(data))?;
        }
        Ok(())
    }

    fn emit_failure_progress(&mut self, failure: &ExecutionFailure) -> crate::Result<()> {
        let mut modules = Vec::with_capacity(self.module_outputs.len() + 1);
        for output in &self.module_outputs {
            modules.push(ModuleProgress {
                name: output.name.clone(),
                progress: ModuleProgressKind::Failed(FailedProgress {
                    reason: None,
                    logs: output.logs.clone(),
                    logs_truncated: output.logs_truncated,
                }),
            });
        }
        modules.push(ModuleProgress {
            name: failure.module.clone(),
            progress: ModuleProgressKind::Failed(FailedProgress {
                reason: Some(failure.error.to_string()),
                logs: failure.logs.clone(),
                logs_truncated: failure.logs_truncated,
            }),
        });
        (self.sink)(Response::modules_progress(modules))
    }

    fn save_store_snapshots(&mut self, block: u64, at_stop: bool) -> crate::Result<()> {
        let interval = self.engine.store_snapshot_interval;
        if !at_stop && interval != 0 && block % interval != 0 {
            return Err(PipelineError::MisalignedSnapshot { block, interval }.into());
        }

        let object_store = self.object_store.clone();
        for store in self.stores.values_mut() {
            let key = store.write_state(block, &object_store)?;
            if store.is_partial() {
                store.truncate();
                store.roll(block);
            }
            info!(store = store.name(), block, %key, "store state written");
        }
        Ok(())
    }
}

impl BlockHandler for Pipeline {
    fn handle_block(
        &mut self,
        block: &Block,
        cursor: &Cursor,
        step: Step,
    ) -> crate::Result<HandlerFlow> {
        if self.cancel.is_canceled() {
            return Err(PipelineError::Canceled.into());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.process_block(block, cursor, step)
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                error!(block = block.number, %message, "panic while processing block");
                error!("{}", std::backtrace::Backtrace::force_capture());
                Err(PipelineError::Panic {
                    block: block.number,
                    message,
                }
                .into())
            }
        };

        // Post-job hooks run when the job is over, successfully or not.
        let job_over = !matches!(result, Ok(HandlerFlow::Continue));
        if job_over {
            let clock = self.clock.clone();
            for hook in &mut self.post_job_hooks {
                hook(clock.as_ref());
            }
            if result.is_err() {
                warn!(block = block.number, "block processing failed");
            }
        }

        result
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
