//! End-to-end scenarios: a synthetic block source and a builtin module
//! runtime drive the full pipeline + orchestrator stack against an
//! in-memory object store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use blockflow::cancel::CancelToken;
use blockflow::config::EngineConfig;
use blockflow::orchestrator::{LocalWorker, WorkerPool};
use blockflow::pipeline::{Pipeline, ResponseFn};
use blockflow::runtime::{
    BuiltinRuntime, FnInstance, InputValue, Invocation, InvokeResult, ModuleRuntime, RuntimeError,
};
use blockflow::state::{decode_state, int64_value};
use blockflow::storage::{MemoryStore, ObjectStore};
use blockflow::stream::{
    Block, BlockHandler, BlockRange, BlockRef, BlockSource, Cursor, HandlerFlow, Step,
};
use blockflow::{
    Binary, BlockScopedData, ErrorCode, Input, Module, ModuleKind, ModuleProgressKind, Request,
    Response, StoreMode, UpdatePolicy, ValueType,
};

const BLOCK_TYPE: &str = "test.Block";

/// Deterministic block source: id `b{num}`, payload `payload-{num}`.
struct SequenceSource;

impl BlockSource for SequenceSource {
    fn stream_range(
        &self,
        range: BlockRange,
        handler: &mut dyn BlockHandler,
    ) -> blockflow::Result<()> {
        for num in range.start..range.end {
            let block = Block {
                number: num,
                id: format!("b{num}"),
                timestamp_ms: num * 1_000,
                payload: Bytes::from(format!("payload-{num}")),
            };
            let cursor = Cursor::new(block.as_ref(), Step::Irreversible);
            match handler.handle_block(&block, &cursor, Step::Irreversible)? {
                HandlerFlow::Continue => {}
                HandlerFlow::EndOfStream => return Ok(()),
            }
        }
        Ok(())
    }
}

fn engine() -> EngineConfig {
    EngineConfig {
        block_type: BLOCK_TYPE.to_string(),
        store_snapshot_interval: 10,
        output_cache_save_interval: 10,
        subrequest_range_size: 1_000,
        max_subrequest_range_size: 10_000,
        max_store_sync_range: u64::MAX,
        worker_count: 2,
        max_module_log_bytes: 4 * 1024,
    }
}

fn runtime() -> Arc<dyn ModuleRuntime> {
    let mut runtime = BuiltinRuntime::new();

    // Echo the raw block payload.
    runtime.register("extract", || {
        Box::new(FnInstance::new(|invocation: Invocation<'_>| {
            let payload = invocation.input_bytes(BLOCK_TYPE).cloned().unwrap_or_default();
            Ok(InvokeResult {
                output: Some(payload),
                logs: vec![format!("extract at {}", invocation.clock.number)],
                fuel_used: 1,
            })
        }))
    });

    // Count blocks: one `total` counter plus a `k{num % 3}` counter.
    runtime.register("count_blocks", || {
        Box::new(FnInstance::new(|mut invocation: Invocation<'_>| {
            let number = invocation.clock.number;
            let writer = invocation.writer.as_mut().expect("store writer bound");
            writer.apply("total", int64_value(1))?;
            writer.apply(&format!("k{}", number % 3), int64_value(1))?;
            Ok(InvokeResult::default())
        }))
    });

    // Report the current total from the upstream store.
    runtime.register("report", || {
        Box::new(FnInstance::new(|invocation: Invocation<'_>| {
            let total = invocation
                .inputs
                .iter()
                .find_map(|input| match input {
                    InputValue::StoreGet { name: "counts", store } => store.get("total").cloned(),
                    _ => None,
                })
                .unwrap_or_else(|| int64_value(0));
            Ok(InvokeResult {
                output: Some(total),
                ..Default::default()
            })
        }))
    });

    // Derived store: mirrors the upstream total under its own key.
    runtime.register("mirror_total", || {
        Box::new(FnInstance::new(|mut invocation: Invocation<'_>| {
            let total = invocation
                .inputs
                .iter()
                .find_map(|input| match input {
                    InputValue::StoreGet { name: "counts", store } => store.get("total").cloned(),
                    _ => None,
                })
                .unwrap_or_else(|| int64_value(0));
            let writer = invocation.writer.as_mut().expect("store writer bound");
            writer.apply("seen_total", total)?;
            Ok(InvokeResult::default())
        }))
    });

    runtime.register("fail_at_150", || {
        Box::new(FnInstance::new(|invocation: Invocation<'_>| {
            if invocation.clock.number == 150 {
                return Err(RuntimeError::Trap {
                    message: "boom at 150".to_string(),
                    logs: vec!["about to divide by zero".to_string()],
                });
            }
            Ok(InvokeResult {
                output: Some(Bytes::from_static(b"ok")),
                ..Default::default()
            })
        }))
    });

    runtime.register("panic_at_105", || {
        Box::new(FnInstance::new(|invocation: Invocation<'_>| {
            if invocation.clock.number == 105 {
                panic!("index out of bounds in module");
            }
            Ok(InvokeResult {
                output: Some(Bytes::from_static(b"ok")),
                ..Default::default()
            })
        }))
    });

    Arc::new(runtime)
}

fn binary() -> Binary {
    Binary {
        vm_type: "wasm/rust-v1".to_string(),
        content: Bytes::from_static(b"\0asm-test"),
    }
}

fn source_input() -> Input {
    Input::Source {
        source_type: BLOCK_TYPE.to_string(),
    }
}

fn map_module(name: &str, entrypoint: &str, inputs: Vec<Input>) -> Module {
    Module {
        name: name.to_string(),
        initial_block: 0,
        kind: ModuleKind::Map,
        inputs,
        binary_index: 0,
        entrypoint: entrypoint.to_string(),
    }
}

fn store_module(name: &str, entrypoint: &str, inputs: Vec<Input>) -> Module {
    Module {
        name: name.to_string(),
        initial_block: 0,
        kind: ModuleKind::Store {
            update_policy: UpdatePolicy::Add,
            value_type: ValueType::Int64,
        },
        inputs,
        binary_index: 0,
        entrypoint: entrypoint.to_string(),
    }
}

#[derive(Clone, Default)]
struct Collector {
    responses: Arc<Mutex<Vec<Response>>>,
}

impl Collector {
    fn sink(&self) -> ResponseFn {
        let responses = self.responses.clone();
        Box::new(move |response| {
            responses.lock().expect("collector lock").push(response);
            Ok(())
        })
    }

    fn block_data(&self) -> Vec<BlockScopedData> {
        self.responses
            .lock()
            .expect("collector lock")
            .iter()
            .filter_map(|r| match r {
                Response::BlockScopedData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn responses(&self) -> Vec<Response> {
        self.responses.lock().expect("collector lock").clone()
    }
}

struct Harness {
    object_store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ModuleRuntime>,
    source: Arc<dyn BlockSource>,
    cancel: CancelToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            object_store: Arc::new(MemoryStore::new()),
            runtime: runtime(),
            source: Arc::new(SequenceSource),
            cancel: CancelToken::new(),
        }
    }

    fn pipeline(&self, request: Request, collector: &Collector) -> Pipeline {
        Pipeline::new(
            request,
            false,
            || Some(1_000_000),
            engine(),
            self.object_store.clone(),
            self.runtime.clone(),
            collector.sink(),
            self.cancel.clone(),
        )
        .expect("pipeline construction")
    }

    fn worker_pool(&self, request_template: &Request) -> WorkerPool {
        let request_template = request_template.clone();
        let object_store = self.object_store.clone();
        let runtime = self.runtime.clone();
        let source = self.source.clone();
        let cancel = self.cancel.clone();
        WorkerPool::new(2, move || {
            Box::new(LocalWorker::new(
                request_template.clone(),
                engine(),
                object_store.clone(),
                runtime.clone(),
                source.clone(),
                cancel.clone(),
            ))
        })
    }

    fn state_segments(&self) -> Vec<String> {
        self.object_store
            .list("")
            .expect("listing object store")
            .into_iter()
            .filter(|k| k.contains("/full-") || k.contains("/partial-"))
            .collect()
    }

    fn drive(&self, pipeline: &mut Pipeline, from: u64, until: u64) -> blockflow::Result<()> {
        self.source
            .stream_range(BlockRange::new(from, until), pipeline)
    }
}

fn request(start: i64, stop: u64, outputs: &[&str], modules: Vec<Module>) -> Request {
    Request {
        start_block_num: start,
        stop_block_num: stop,
        start_cursor: String::new(),
        production_mode: false,
        output_modules: outputs.iter().map(|s| s.to_string()).collect(),
        modules,
        binaries: vec![binary()],
    }
}

// Scenario 1: pure map over 10 blocks, no stores, no snapshots.
#[test]
fn pure_map_emits_one_message_per_block() {
    let harness = Harness::new();
    let collector = Collector::default();
    let req = request(
        100,
        110,
        &["extract"],
        vec![map_module("extract", "extract", vec![source_input()])],
    );

    let mut pipeline = harness.pipeline(req, &collector);
    pipeline.init(None).unwrap();
    harness.drive(&mut pipeline, 100, 200).unwrap();

    let data = collector.block_data();
    assert_eq!(data.len(), 10);
    for (i, message) in data.iter().enumerate() {
        let num = 100 + i as u64;
        assert_eq!(message.clock.number, num);
        assert_eq!(message.outputs.len(), 1);
        assert_eq!(message.outputs[0].name, "extract");
        assert_eq!(
            message.outputs[0].data,
            Bytes::from(format!("payload-{num}"))
        );
        let cursor = Cursor::from_opaque(&message.cursor).unwrap();
        assert_eq!(cursor.block.num, num);
    }

    assert!(harness.state_segments().is_empty());
}

// Scenario 2: one store ancestor; the orchestrator backfills [0, 100)
// before streaming and no snapshot lands at the stop block.
#[test]
fn store_ancestor_backfills_then_streams() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![
        store_module("counts", "count_blocks", vec![source_input()]),
        map_module(
            "report",
            "report",
            vec![
                source_input(),
                Input::Store {
                    module: "counts".to_string(),
                    mode: StoreMode::Get,
                },
            ],
        ),
    ];
    let req = request(100, 110, &["report"], modules);

    let pool = harness.worker_pool(&req);
    let mut pipeline = harness.pipeline(req.clone(), &collector);
    pipeline.init(Some(&pool)).unwrap();

    let segments = harness.state_segments();
    assert!(
        segments.iter().any(|k| k.ends_with("/full-0-100")),
        "expected full-0-100 after backfill, got {segments:?}"
    );

    harness.drive(&mut pipeline, 100, 200).unwrap();

    let data = collector.block_data();
    assert_eq!(data.len(), 10);
    // Block 110 terminated the stream before any snapshot was written.
    assert!(
        !harness
            .state_segments()
            .iter()
            .any(|k| k.ends_with("-110")),
        "no snapshot may be persisted at the stop block"
    );

    // counts ran on every block 0..=99 during backfill, then linearly:
    // at block N the total is N + 1.
    let last = data.last().unwrap();
    let report = last.outputs.iter().find(|o| o.name == "report").unwrap();
    assert_eq!(report.data, int64_value(110));

    // Scenario 6: everything is already at the target block, so a second
    // request needs no workers at all.
    let collector2 = Collector::default();
    let mut second = harness.pipeline(req, &collector2);
    second.init(None).unwrap();
}

// Scenario 3: a cursor overrides the start block and resumes exactly
// after the last delivered block.
#[test]
fn cursor_resume_continues_at_next_block() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![map_module("extract", "extract", vec![source_input()])];

    let mut req = request(50, 60, &["extract"], modules.clone());
    req.start_cursor = Cursor::new(BlockRef::new(49, "b49"), Step::Irreversible).to_opaque();

    let mut pipeline = harness.pipeline(req, &collector);
    assert_eq!(pipeline.details().request_start_block, 50);
    pipeline.init(None).unwrap();
    harness.drive(&mut pipeline, 50, 100).unwrap();

    let data = collector.block_data();
    assert_eq!(data.first().unwrap().clock.number, 50);

    // Resume from the cursor of block 54: the next emitted block is 55.
    let cursor_at_54 = data.iter().find(|d| d.clock.number == 54).unwrap().cursor.clone();
    let collector2 = Collector::default();
    let mut resume_req = request(0, 60, &["extract"], modules);
    resume_req.start_cursor = cursor_at_54;
    let mut resumed = harness.pipeline(resume_req, &collector2);
    assert_eq!(resumed.details().request_start_block, 55);
    resumed.init(None).unwrap();
    harness.drive(&mut resumed, 55, 100).unwrap();
    assert_eq!(collector2.block_data().first().unwrap().clock.number, 55);
}

// Scenario 4: a sub-request building a store emits progress, no block
// data, and persists exactly one partial segment.
#[test]
fn sub_request_produces_one_partial_segment() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![store_module("counts", "count_blocks", vec![source_input()])];
    let mut engine_config = engine();
    engine_config.store_snapshot_interval = 100;

    let req = request(100, 200, &["counts"], modules);
    let mut pipeline = Pipeline::new(
        req,
        true,
        || Some(200),
        engine_config,
        harness.object_store.clone(),
        harness.runtime.clone(),
        collector.sink(),
        harness.cancel.clone(),
    )
    .unwrap();
    pipeline.init(None).unwrap();
    harness.drive(&mut pipeline, 100, 201).unwrap();

    let segments = harness.state_segments();
    assert_eq!(segments.len(), 1, "got {segments:?}");
    assert!(segments[0].ends_with("/partial-100-200"));

    assert!(collector.block_data().is_empty());

    let progress_ranges: Vec<(u64, u64)> = collector
        .responses()
        .iter()
        .filter_map(|r| match r {
            Response::ModulesProgress(progress) => Some(progress.modules.clone()),
            _ => None,
        })
        .flatten()
        .filter(|m| m.name == "counts")
        .filter_map(|m| match m.progress {
            ModuleProgressKind::ProcessedRanges { ref ranges } => {
                Some((ranges[0].start_block, ranges[0].end_block))
            }
            _ => None,
        })
        .collect();
    assert_eq!(progress_ranges.first(), Some(&(100, 100)));
    assert_eq!(progress_ranges.last(), Some(&(100, 199)));
}

// Scenario 5: a module failure emits one failure progress naming the
// culprit and marking the block's earlier modules failed too.
#[test]
fn module_failure_reports_progress_then_errors() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![
        map_module("extract", "extract", vec![source_input()]),
        map_module(
            "shaky",
            "fail_at_150",
            vec![Input::Map {
                module: "extract".to_string(),
            }],
        ),
    ];
    let req = request(140, 0, &["shaky"], modules);

    let mut pipeline = harness.pipeline(req, &collector);
    pipeline.init(None).unwrap();
    let err = harness.drive(&mut pipeline, 140, 200).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModuleExecution);

    // Ten good blocks (140..=149) made it out.
    assert_eq!(collector.block_data().len(), 10);

    let responses = collector.responses();
    let Some(Response::ModulesProgress(progress)) = responses.last() else {
        panic!("expected failure progress last, got {responses:?}");
    };
    assert_eq!(progress.modules.len(), 2);

    let extract = &progress.modules[0];
    assert_eq!(extract.name, "extract");
    let ModuleProgressKind::Failed(failed) = &extract.progress else {
        panic!("expected failed progress");
    };
    assert!(failed.reason.is_none());
    assert_eq!(failed.logs, vec!["extract at 150".to_string()]);

    let shaky = &progress.modules[1];
    assert_eq!(shaky.name, "shaky");
    let ModuleProgressKind::Failed(failed) = &shaky.progress else {
        panic!("expected failed progress");
    };
    assert!(failed.reason.as_deref().unwrap().contains("boom at 150"));
    assert_eq!(failed.logs, vec!["about to divide by zero".to_string()]);
}

// A panic inside a module converts to an internal error naming the block.
#[test]
fn module_panic_becomes_internal_error() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![map_module("edgy", "panic_at_105", vec![source_input()])];
    let req = request(100, 0, &["edgy"], modules);

    let mut pipeline = harness.pipeline(req, &collector);
    pipeline.init(None).unwrap();
    let err = harness.drive(&mut pipeline, 100, 200).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.to_string().contains("105"));
    assert_eq!(collector.block_data().len(), 5);
}

// Property: parallel backfill over many jobs produces the same state as
// linear replay, including across dependent stores.
#[test]
fn parallel_backfill_matches_linear_replay() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![
        store_module("counts", "count_blocks", vec![source_input()]),
        store_module(
            "mirror",
            "mirror_total",
            vec![Input::Store {
                module: "counts".to_string(),
                mode: StoreMode::Get,
            }],
        ),
        map_module(
            "report",
            "report",
            vec![
                source_input(),
                Input::Store {
                    module: "counts".to_string(),
                    mode: StoreMode::Get,
                },
                Input::Store {
                    module: "mirror".to_string(),
                    mode: StoreMode::Deltas,
                },
            ],
        ),
    ];
    let mut req = request(100, 103, &["report"], modules);
    req.production_mode = true;

    // Small jobs force several sub-requests per store, with mirror's jobs
    // gated on counts' squashed progress.
    let pool = harness.worker_pool(&req);
    let mut engine_config = engine();
    engine_config.subrequest_range_size = 30;
    let mut pipeline = Pipeline::new(
        req,
        false,
        || Some(1_000_000),
        engine_config,
        harness.object_store.clone(),
        harness.runtime.clone(),
        collector.sink(),
        harness.cancel.clone(),
    )
    .unwrap();
    pipeline.init(Some(&pool)).unwrap();

    // Fetch the squashed counts state and compare against the analytic
    // linear result over blocks 0..=99.
    let segments = harness.state_segments();
    let counts_key = segments
        .iter()
        .find(|k| k.starts_with("counts/") && k.ends_with("/full-0-100"))
        .expect("counts full snapshot");
    let counts = decode_state(&harness.object_store.get(counts_key).unwrap()).unwrap();

    let mut expected: BTreeMap<String, i64> = BTreeMap::new();
    for num in 0u64..100 {
        *expected.entry("total".to_string()).or_default() += 1;
        *expected.entry(format!("k{}", num % 3)).or_default() += 1;
    }
    assert_eq!(counts.len(), expected.len());
    for (key, value) in expected {
        assert_eq!(counts[&key], int64_value(value), "key {key}");
    }

    // The dependent store saw the totals in block order.
    let mirror_key = segments
        .iter()
        .find(|k| k.starts_with("mirror/") && k.ends_with("/full-0-100"))
        .expect("mirror full snapshot");
    let mirror = decode_state(&harness.object_store.get(mirror_key).unwrap()).unwrap();
    // add-policy mirror of totals 1 + 2 + ... + 100.
    assert_eq!(mirror["seen_total"], int64_value((1..=100).sum::<i64>()));
}

// Cancellation surfaces as `canceled` without a failure progress.
#[test]
fn canceled_request_stops_without_failure_progress() {
    let harness = Harness::new();
    let collector = Collector::default();
    let modules = vec![map_module("extract", "extract", vec![source_input()])];
    let req = request(100, 0, &["extract"], modules);

    let mut pipeline = harness.pipeline(req, &collector);
    pipeline.init(None).unwrap();
    harness.cancel.cancel();

    let err = harness.drive(&mut pipeline, 100, 200).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Canceled);
    assert!(collector.responses().is_empty());
}
