//! Module manifest model: the DAG of user-authored modules a request
//! executes, plus the binaries they are compiled into.

mod fingerprint;
mod graph;

pub use fingerprint::{fingerprint_modules, Fingerprint};
pub use graph::ModuleGraph;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The single VM type this engine executes.
pub const SUPPORTED_VM_TYPE: &str = "wasm/rust-v1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("duplicate module name {name:?}")]
    DuplicateModule { name: String },
    #[error("module {module:?} references unknown module {name:?}")]
    UnknownModule { module: String, name: String },
    #[error("module {module:?}: {reason}")]
    BadInput { module: String, reason: String },
    #[error("module graph has a cycle through {name:?}")]
    Cycle { name: String },
    #[error("module {module:?} references binary index {index} out of range")]
    BinaryIndexOutOfRange { module: String, index: usize },
    #[error("unsupported binary type {got:?}, supported: {supported:?}")]
    UnsupportedBinaryType { got: String, supported: String },
    #[error("unknown output module {name:?}")]
    UnknownOutputModule { name: String },
}

/// How a store folds a new value into an existing key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    Set,
    SetIfNotExists,
    Add,
    Min,
    Max,
    Append,
}

impl UpdatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdatePolicy::Set => "set",
            UpdatePolicy::SetIfNotExists => "set_if_not_exists",
            UpdatePolicy::Add => "add",
            UpdatePolicy::Min => "min",
            UpdatePolicy::Max => "max",
            UpdatePolicy::Append => "append",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a store's values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Bytes,
    Int64,
    Float64,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Int64 => "int64",
            ValueType::Float64 => "float64",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read mode for a store input.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Get,
    Deltas,
}

/// One ordered input of a module.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Input {
    /// Raw block bytes or the serialized clock, keyed by type string.
    Source { source_type: String },
    /// Another map module's per-block output.
    Map { module: String },
    /// Another store module's state or current-block deltas.
    Store { module: String, mode: StoreMode },
}

impl Input {
    /// The module this input depends on, if any.
    pub fn module_dependency(&self) -> Option<&str> {
        match self {
            Input::Source { .. } => None,
            Input::Map { module } | Input::Store { module, .. } => Some(module),
        }
    }
}

/// Kind of a module: maps emit bytes, stores accumulate key/value state.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    Map,
    Store {
        update_policy: UpdatePolicy,
        value_type: ValueType,
    },
}

impl ModuleKind {
    pub fn is_store(&self) -> bool {
        matches!(self, ModuleKind::Store { .. })
    }
}

/// A user-authored unit in the DAG.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub initial_block: u64,
    pub kind: ModuleKind,
    pub inputs: Vec<Input>,
    pub binary_index: usize,
    pub entrypoint: String,
}

/// A compiled code unit referenced by modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    pub vm_type: String,
    pub content: Bytes,
}

/// Reject any binary whose VM type differs from the supported one.
pub fn validate_binaries(binaries: &[Binary]) -> Result<(), ManifestError> {
    for binary in binaries {
        if binary.vm_type != SUPPORTED_VM_TYPE {
            return Err(ManifestError::UnsupportedBinaryType {
                got: binary.vm_type.clone(),
                supported: SUPPORTED_VM_TYPE.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_binary_type() {
        let binaries = vec![Binary {
            vm_type: "native/x86".to_string(),
            content: Bytes::new(),
        }];
        assert!(matches!(
            validate_binaries(&binaries),
            Err(ManifestError::UnsupportedBinaryType { .. })
        ));
    }
}
