//! Backfill worker pool.
//!
//! Each worker runs on a dedicated thread, consuming jobs from a shared
//! channel and reporting results on another. The default worker executes
//! the sub-request pipeline in-process; a remote deployment would swap in
//! a worker that dispatches the sub-request over its transport instead.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::api::Request;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::pipeline::Pipeline;
use crate::runtime::ModuleRuntime;
use crate::storage::ObjectStore;
use crate::stream::{BlockRange, BlockSource};

use super::strategy::Job;

/// Executes one backfill job to completion, leaving its partial segment
/// in durable storage.
pub trait Worker: Send {
    fn work(&mut self, job: &Job) -> crate::Result<()>;
}

pub struct JobResult {
    pub job: Job,
    pub result: crate::Result<()>,
}

pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    result_rx: Receiver<JobResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new<F>(worker_count: usize, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded::<JobResult>();
        let factory = Arc::new(factory);

        let handles = (0..worker_count.max(1))
            .map(|i| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let factory = factory.clone();
                std::thread::Builder::new()
                    .name(format!("backfill-worker-{i}"))
                    .spawn(move || {
                        let mut worker = factory();
                        for job in job_rx.iter() {
                            debug!(%job, "worker picked up job");
                            let result = worker.work(&job);
                            if result_tx.send(JobResult { job, result }).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("spawning backfill worker thread")
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
        }
    }

    pub(crate) fn dispatch(&self, job: Job) {
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(job);
        }
    }

    pub(crate) fn results(&self) -> &Receiver<JobResult> {
        &self.result_rx
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job channel lets idle workers exit; in-flight jobs
        // finish first.
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// In-process worker: runs the sub-request pipeline on this machine
/// against the shared object store.
pub struct LocalWorker {
    request_template: Request,
    engine: EngineConfig,
    object_store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ModuleRuntime>,
    source: Arc<dyn BlockSource>,
    cancel: CancelToken,
}

impl LocalWorker {
    pub fn new(
        request_template: Request,
        engine: EngineConfig,
        object_store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ModuleRuntime>,
        source: Arc<dyn BlockSource>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            request_template,
            engine,
            object_store,
            runtime,
            source,
            cancel,
        }
    }
}

impl Worker for LocalWorker {
    fn work(&mut self, job: &Job) -> crate::Result<()> {
        info!(%job, "starting sub-request");

        let request = Request {
            start_block_num: job.range.start as i64,
            stop_block_num: job.range.end,
            start_cursor: String::new(),
            production_mode: self.request_template.production_mode,
            output_modules: vec![job.store_name.clone()],
            modules: self.request_template.modules.clone(),
            binaries: self.request_template.binaries.clone(),
        };

        let end = job.range.end;
        let mut pipeline = Pipeline::new(
            request,
            true,
            || Some(end),
            self.engine.clone(),
            self.object_store.clone(),
            self.runtime.clone(),
            Box::new(|_| Ok(())),
            self.cancel.clone(),
        )?;
        pipeline.init(None)?;

        // The stop block itself must reach the handler so the partial
        // segment persists before end-of-stream.
        let drive = BlockRange::new(job.range.start, job.range.end.saturating_add(1));
        self.source.stream_range(drive, &mut pipeline)?;

        info!(%job, "sub-request complete");
        Ok(())
    }
}
