//! Parallel backfill: plans sub-requests, drives a worker pool, and
//! squashes the partial segments workers produce into contiguous store
//! state.

mod pool;
mod scheduler;
mod squasher;
mod storage_state;
mod strategy;
mod worker;

pub use pool::RequestPool;
pub use scheduler::{synchronize_stores, SynchronizeArgs};
pub use squasher::Squasher;
pub use storage_state::{fetch_storage_state, StorageState, StoreStorageState};
pub use strategy::{Job, OrderedStrategy};
pub use worker::{JobResult, LocalWorker, Worker, WorkerPool};

use thiserror::Error;

use crate::error::ErrorCode;
use crate::state::StateError;
use crate::storage::StorageError;
use crate::stream::BlockRange;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("backfill job for store {store:?} over {range} failed")]
    WorkerFailed {
        store: String,
        range: BlockRange,
        #[source]
        source: Box<crate::Error>,
    },
    #[error("stores not fully squashed: {stores:?}")]
    StoresNotReady { stores: Vec<String> },
    #[error("store synchronization canceled")]
    Canceled,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OrchestrationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestrationError::WorkerFailed { source, .. } => source.code(),
            OrchestrationError::StoresNotReady { .. } => ErrorCode::Internal,
            OrchestrationError::Canceled => ErrorCode::Canceled,
            OrchestrationError::State(e) => e.code(),
            OrchestrationError::Storage(e) => e.code(),
        }
    }
}
