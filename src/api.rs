//! Request and response message types.
//!
//! The RPC transport is out of scope; these are the messages the engine
//! consumes and emits, shaped for serde so any transport can carry them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::manifest::{Binary, Module};
use crate::stream::{Clock, Step};

/// A streaming computation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Negative values are invalid (reserved for future relative starts).
    pub start_block_num: i64,
    /// Zero means open-ended.
    #[serde(default)]
    pub stop_block_num: u64,
    /// Opaque resumption token; empty for a fresh start.
    #[serde(default)]
    pub start_cursor: String,
    #[serde(default)]
    pub production_mode: bool,
    pub output_modules: Vec<String>,
    pub modules: Vec<Module>,
    pub binaries: Vec<Binary>,
}

/// One module's output for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub name: String,
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub logs_truncated: bool,
}

/// Everything produced for one block, in DAG order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockScopedData {
    pub outputs: Vec<ModuleOutput>,
    pub clock: Clock,
    pub step: Step,
    pub cursor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRange {
    pub start_block: u64,
    pub end_block: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub logs_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleProgressKind {
    ProcessedRanges { ranges: Vec<ProcessedRange> },
    Failed(FailedProgress),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub name: String,
    #[serde(flatten)]
    pub progress: ModuleProgressKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesProgress {
    pub modules: Vec<ModuleProgress>,
}

/// Messages emitted back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    BlockScopedData(BlockScopedData),
    ModulesProgress(ModulesProgress),
}

impl Response {
    pub fn block_scoped_data(data: BlockScopedData) -> Self {
        Response::BlockScopedData(data)
    }

    pub fn modules_progress(modules: Vec<ModuleProgress>) -> Self {
        Response::ModulesProgress(ModulesProgress { modules })
    }
}
