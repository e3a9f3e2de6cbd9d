//! Per-block execution pipeline.

mod executor;
#[allow(clippy::module_inception)]
mod pipeline;
mod resolve;

pub use executor::{ExecutionFailure, ModuleExecutor};
pub use pipeline::{BlockHook, Pipeline, PostJobHook, ResponseFn};
pub use resolve::{resolve_request_details, RequestDetails, ResolveError};

use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error(
        "invalid request: start block {start_block} is below initial block \
         {module_initial_block} of output module {module:?}"
    )]
    StartBlockBeforeModule {
        module: String,
        module_initial_block: u64,
        start_block: u64,
    },
    #[error("store backfill required but no worker pool was provided")]
    MissingWorkerPool,
    #[error("snapshot block {block} is not aligned on save interval {interval}")]
    MisalignedSnapshot { block: u64, interval: u64 },
    #[error("panic at block {block}: {message}")]
    Panic { block: u64, message: String },
    #[error("request canceled")]
    Canceled,
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidRequest { .. }
            | PipelineError::StartBlockBeforeModule { .. } => ErrorCode::InvalidArgument,
            PipelineError::MissingWorkerPool
            | PipelineError::MisalignedSnapshot { .. }
            | PipelineError::Panic { .. } => ErrorCode::Internal,
            PipelineError::Canceled => ErrorCode::Canceled,
        }
    }
}
