//! Module executors: one per module in the execution set.
//!
//! Two variants, map and store, share input wiring, log capture, and the
//! cached-execution path. Executors run strictly in DAG order inside the
//! block handler; there is no parallelism within a block.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use crate::api::ModuleOutput;
use crate::manifest::{Input, Module, ModuleKind, StoreMode};
use crate::outputs::{CacheError, OutputCache};
use crate::runtime::{
    truncate_logs, InputValue, Invocation, ModuleInstance, RuntimeError, StoreWriter,
};
use crate::state::{encode_deltas, Store};
use crate::stream::Clock;

static EMPTY_BYTES: Bytes = Bytes::new();

/// A module execution error plus whatever logs survived it.
pub struct ExecutionFailure {
    pub module: String,
    pub error: RuntimeError,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

pub struct ModuleExecutor {
    pub module: Module,
    pub is_output: bool,
    instance: Box<dyn ModuleInstance>,
}

impl ModuleExecutor {
    pub fn new(module: Module, is_output: bool, instance: Box<dyn ModuleInstance>) -> Self {
        Self {
            module,
            is_output,
            instance,
        }
    }

    /// Execute this module for one block.
    ///
    /// `stores` must not contain this module's own store (the caller
    /// removes it and passes it as `own_store` for store-kind modules).
    pub fn execute(
        &mut self,
        clock: &Clock,
        scratch: &mut BTreeMap<String, Bytes>,
        stores: &BTreeMap<String, Store>,
        own_store: Option<&mut Store>,
        cache: &mut OutputCache,
        max_log_bytes: usize,
    ) -> Result<ModuleOutput, ExecutionFailure> {
        match (&self.module.kind, own_store) {
            (ModuleKind::Map, _) => self.execute_map(clock, scratch, stores, cache, max_log_bytes),
            (ModuleKind::Store { .. }, Some(store)) => {
                self.execute_store(clock, scratch, stores, store, cache, max_log_bytes)
            }
            (ModuleKind::Store { .. }, None) => Err(ExecutionFailure {
                module: self.module.name.clone(),
                error: RuntimeError::Trap {
                    message: "store module executed without its store".to_string(),
                    logs: Vec::new(),
                },
                logs: Vec::new(),
                logs_truncated: false,
            }),
        }
    }

    fn execute_map(
        &mut self,
        clock: &Clock,
        scratch: &mut BTreeMap<String, Bytes>,
        stores: &BTreeMap<String, Store>,
        cache: &mut OutputCache,
        max_log_bytes: usize,
    ) -> Result<ModuleOutput, ExecutionFailure> {
        if let Some(cached) = cache.get(clock.number).cloned() {
            debug!(module = %self.module.name, block = clock.number, "cached output");
            scratch.insert(self.module.name.clone(), cached.clone());
            return Ok(ModuleOutput {
                name: self.module.name.clone(),
                data: cached,
                logs: Vec::new(),
                logs_truncated: false,
            });
        }

        let invocation = Invocation {
            clock,
            inputs: resolve_inputs(&self.module, scratch, stores),
            writer: None,
        };
        let result = self
            .instance
            .invoke(invocation)
            .map_err(|error| self.failure(error, max_log_bytes))?;
        debug!(module = %self.module.name, fuel = result.fuel_used, "module executed");

        let output = result.output.unwrap_or_else(|| EMPTY_BYTES.clone());
        let mut logs = result.logs;
        let logs_truncated = truncate_logs(&mut logs, max_log_bytes);

        scratch.insert(self.module.name.clone(), output.clone());
        cache.insert(clock.number, output.clone());

        Ok(ModuleOutput {
            name: self.module.name.clone(),
            data: output,
            logs,
            logs_truncated,
        })
    }

    fn execute_store(
        &mut self,
        clock: &Clock,
        scratch: &BTreeMap<String, Bytes>,
        stores: &BTreeMap<String, Store>,
        own_store: &mut Store,
        cache: &mut OutputCache,
        max_log_bytes: usize,
    ) -> Result<ModuleOutput, ExecutionFailure> {
        let cached = cache.get_deltas(clock.number).map_err(|error| {
            self.failure(cache_as_runtime_error(error), max_log_bytes)
        })?;
        if let Some(deltas) = cached {
            debug!(module = %self.module.name, block = clock.number, "cached deltas");
            own_store.replay_deltas(&deltas);
            return Ok(ModuleOutput {
                name: self.module.name.clone(),
                data: encode_deltas(&deltas),
                logs: Vec::new(),
                logs_truncated: false,
            });
        }

        let invocation = Invocation {
            clock,
            inputs: resolve_inputs(&self.module, scratch, stores),
            writer: Some(StoreWriter::new(own_store)),
        };
        let result = self
            .instance
            .invoke(invocation)
            .map_err(|error| self.failure(error, max_log_bytes))?;
        debug!(module = %self.module.name, fuel = result.fuel_used, "module executed");

        let mut logs = result.logs;
        let logs_truncated = truncate_logs(&mut logs, max_log_bytes);

        let deltas = own_store.deltas();
        cache.insert_deltas(clock.number, deltas);

        Ok(ModuleOutput {
            name: self.module.name.clone(),
            data: encode_deltas(deltas),
            logs,
            logs_truncated,
        })
    }

    fn failure(&self, error: RuntimeError, max_log_bytes: usize) -> ExecutionFailure {
        let mut logs = match &error {
            RuntimeError::Trap { logs, .. } => logs.clone(),
            _ => Vec::new(),
        };
        let logs_truncated = truncate_logs(&mut logs, max_log_bytes);
        ExecutionFailure {
            module: self.module.name.clone(),
            error,
            logs,
            logs_truncated,
        }
    }
}

fn cache_as_runtime_error(error: CacheError) -> RuntimeError {
    RuntimeError::Trap {
        message: format!("reading cached deltas: {error}"),
        logs: Vec::new(),
    }
}

fn resolve_inputs<'a>(
    module: &'a Module,
    scratch: &'a BTreeMap<String, Bytes>,
    stores: &'a BTreeMap<String, Store>,
) -> Vec<InputValue<'a>> {
    let mut inputs = Vec::with_capacity(module.inputs.len());
    for input in &module.inputs {
        match input {
            Input::Source { source_type } => inputs.push(InputValue::Bytes {
                name: source_type,
                data: scratch.get(source_type).unwrap_or(&EMPTY_BYTES),
            }),
            Input::Map { module: dep } => inputs.push(InputValue::Bytes {
                name: dep,
                data: scratch.get(dep).unwrap_or(&EMPTY_BYTES),
            }),
            Input::Store { module: dep, mode } => match (stores.get(dep), mode) {
                (Some(store), StoreMode::Get) => inputs.push(InputValue::StoreGet {
                    name: dep,
                    store,
                }),
                (Some(store), StoreMode::Deltas) => inputs.push(InputValue::StoreDeltas {
                    name: dep,
                    deltas: store.deltas(),
                }),
                // The graph was validated; a missing store can only be the
                // module's own (acyclic, so not an input).
                (None, _) => {}
            },
        }
    }
    inputs
}
