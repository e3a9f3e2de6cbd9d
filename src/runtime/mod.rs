//! Module runtime contract.
//!
//! The sandboxed execution runtime is an external collaborator: something
//! that can load a bytecode blob and invoke a named entrypoint against
//! typed inputs. This module pins down that contract and ships a builtin
//! runtime that dispatches entrypoints to native closures, which is what
//! the test suite (and embedders without a VM) run against.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::manifest::{Binary, Input};
use crate::state::{Delta, StateError, Store};
use crate::stream::Clock;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instantiating module {module:?}: {reason}")]
    Instantiate { module: String, reason: String },
    #[error("module trapped: {message}")]
    Trap {
        message: String,
        /// Logs captured before the trap, if the runtime kept them.
        logs: Vec<String>,
    },
    #[error("fuel exhausted after {consumed} units")]
    FuelExhausted { consumed: u64 },
    #[error(transparent)]
    State(StateError),
}

/// One resolved input value handed to a module for one block.
pub enum InputValue<'a> {
    /// Raw bytes: a source payload or an upstream map module's output.
    Bytes { name: &'a str, data: &'a Bytes },
    /// Read access to an upstream store's applied state.
    StoreGet { name: &'a str, store: &'a Store },
    /// The upstream store's current-block delta list.
    StoreDeltas { name: &'a str, deltas: &'a [Delta] },
}

impl InputValue<'_> {
    pub fn name(&self) -> &str {
        match self {
            InputValue::Bytes { name, .. }
            | InputValue::StoreGet { name, .. }
            | InputValue::StoreDeltas { name, .. } => name,
        }
    }
}

/// Write handle bound to a store module's own store. Only the declared
/// update policy's mutation is reachable through it.
pub struct StoreWriter<'a> {
    store: &'a mut Store,
}

impl<'a> StoreWriter<'a> {
    pub fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Fold `value` into `key` under the store's update policy.
    pub fn apply(&mut self, key: &str, value: Bytes) -> Result<(), RuntimeError> {
        self.store.apply(key, value).map_err(RuntimeError::State)
    }

    /// Same-block read-back of the store being written.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.store.get(key)
    }
}

/// Everything a module sees for one block.
pub struct Invocation<'a> {
    pub clock: &'a Clock,
    pub inputs: Vec<InputValue<'a>>,
    /// Bound for store-kind modules, absent for maps.
    pub writer: Option<StoreWriter<'a>>,
}

impl<'a> Invocation<'a> {
    pub fn input(&self, name: &str) -> Option<&InputValue<'a>> {
        self.inputs.iter().find(|i| i.name() == name)
    }

    pub fn input_bytes(&self, name: &str) -> Option<&'a Bytes> {
        self.inputs.iter().find_map(|i| match i {
            InputValue::Bytes { name: n, data } if *n == name => Some(*data),
            _ => None,
        })
    }
}

/// What came back from one invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeResult {
    /// Output bytes for map modules; `None` for store modules.
    pub output: Option<Bytes>,
    pub logs: Vec<String>,
    pub fuel_used: u64,
}

/// A loaded module bound to an entrypoint, invokable once per block.
pub trait ModuleInstance: Send {
    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<InvokeResult, RuntimeError>;
}

/// Loads binaries and produces executable instances.
///
/// `inputs` is the module's declared wiring; a VM-backed runtime uses it
/// to pre-bind host imports, while the builtin runtime resolves inputs at
/// invocation time and ignores it.
pub trait ModuleRuntime: Send + Sync {
    fn instantiate(
        &self,
        module_name: &str,
        binary: &Binary,
        entrypoint: &str,
        inputs: &[Input],
    ) -> Result<Box<dyn ModuleInstance>, RuntimeError>;
}

/// Cap a log list to `max_bytes` total; returns whether lines were dropped.
pub fn truncate_logs(logs: &mut Vec<String>, max_bytes: usize) -> bool {
    let mut total = 0usize;
    for (i, line) in logs.iter().enumerate() {
        total += line.len();
        if total > max_bytes {
            logs.truncate(i);
            return true;
        }
    }
    false
}

type InstanceFactory =
    dyn Fn() -> Box<dyn ModuleInstance> + Send + Sync;

/// Runtime whose entrypoints are native closures registered by name.
#[derive(Default, Clone)]
pub struct BuiltinRuntime {
    entrypoints: BTreeMap<String, Arc<InstanceFactory>>,
}

impl BuiltinRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, entrypoint: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ModuleInstance> + Send + Sync + 'static,
    {
        self.entrypoints.insert(entrypoint.into(), Arc::new(factory));
    }
}

impl ModuleRuntime for BuiltinRuntime {
    fn instantiate(
        &self,
        module_name: &str,
        _binary: &Binary,
        entrypoint: &str,
        _inputs: &[Input],
    ) -> Result<Box<dyn ModuleInstance>, RuntimeError> {
        let factory =
            self.entrypoints
                .get(entrypoint)
                .ok_or_else(|| RuntimeError::Instantiate {
                    module: module_name.to_string(),
                    reason: format!("no builtin entrypoint {entrypoint:?}"),
                })?;
        Ok(factory())
    }
}

/// An instance that always returns the same result; the simplest test
/// double for failure-path coverage.
pub struct FixedInstance {
    result: Result<InvokeResult, (String, Vec<String>)>,
}

impl FixedInstance {
    pub fn succeed(result: InvokeResult) -> Self {
        Self { result: Ok(result) }
    }

    pub fn trap(message: impl Into<String>) -> Self {
        Self {
            result: Err((message.into(), Vec::new())),
        }
    }

    pub fn trap_with_logs(message: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            result: Err((message.into(), logs)),
        }
    }
}

impl ModuleInstance for FixedInstance {
    fn invoke(&mut self, _invocation: Invocation<'_>) -> Result<InvokeResult, RuntimeError> {
        match &self.result {
            Ok(result) => Ok(result.clone()),
            Err((message, logs)) => Err(RuntimeError::Trap {
                message: message.clone(),
                logs: logs.clone(),
            }),
        }
    }
}

/// An instance backed by a closure.
pub struct FnInstance<F> {
    call: F,
}

impl<F> FnInstance<F>
where
    F: FnMut(Invocation<'_>) -> Result<InvokeResult, RuntimeError> + Send,
{
    pub fn new(call: F) -> Self {
        Self { call }
    }
}

impl<F> ModuleInstance for FnInstance<F>
where
    F: FnMut(Invocation<'_>) -> Result<InvokeResult, RuntimeError> + Send,
{
    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<InvokeResult, RuntimeError> {
        (self.call)(invocation)
    }
}
