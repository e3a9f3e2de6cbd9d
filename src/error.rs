use thiserror::Error;

use crate::manifest::ManifestError;
use crate::orchestrator::OrchestrationError;
use crate::outputs::CacheError;
use crate::pipeline::{PipelineError, ResolveError};
use crate::runtime::RuntimeError;
use crate::state::StateError;
use crate::storage::StorageError;
use crate::stream::CursorError;

/// Stable error code surfaced with a request's terminal error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    /// Bad cursor, negative start block, unknown module, misconfigured input.
    InvalidArgument,
    /// A required durable artifact (input store snapshot) does not exist.
    NotFound,
    /// Blob I/O failure against durable storage.
    Storage,
    /// Module runtime trap or fuel exhaustion.
    ModuleExecution,
    /// Panic caught at a block boundary.
    Internal,
    /// The governing context was canceled.
    Canceled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::NotFound => "not-found",
            ErrorCode::Storage => "storage",
            ErrorCode::ModuleExecution => "module-execution",
            ErrorCode::Internal => "internal",
            ErrorCode::Canceled => "canceled",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors; the stable code of
/// every variant comes from the wrapped error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Manifest(_) => ErrorCode::InvalidArgument,
            Error::Cursor(_) => ErrorCode::InvalidArgument,
            Error::Storage(e) => e.code(),
            Error::State(e) => e.code(),
            Error::Cache(_) => ErrorCode::Storage,
            Error::Runtime(_) => ErrorCode::ModuleExecution,
            Error::Resolve(_) => ErrorCode::InvalidArgument,
            Error::Pipeline(e) => e.code(),
            Error::Orchestration(e) => e.code(),
        }
    }
}
