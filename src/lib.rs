#![forbid(unsafe_code)]

pub mod api;
pub mod cancel;
pub mod config;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod outputs;
pub mod pipeline;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod stream;
pub mod telemetry;

pub use error::{Error, ErrorCode};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the request-facing surface at the crate root for convenience
pub use crate::api::{
    BlockScopedData, FailedProgress, ModuleOutput, ModuleProgress, ModuleProgressKind,
    ModulesProgress, ProcessedRange, Request, Response,
};
pub use crate::manifest::{
    Binary, Fingerprint, Input, Module, ModuleGraph, ModuleKind, StoreMode, UpdatePolicy,
    ValueType,
};
pub use crate::stream::{Block, BlockRange, BlockRef, Clock, Cursor, Step};
