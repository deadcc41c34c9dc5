use span_capture::{
    AgentConfig, CapturePolicy, Clock, ConfigRegistry, ErrorDetail, ExpirableStore, HexDisplayRule,
    InstanceId, ManualClock, ParameterValue, Reaper, RecordingSink, RetentionScheduler,
    RetentionSettings, ShadowStore, SpanOutcome, SpanRecorder, SpanSink, StorageCategory,
    StorageError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;

struct Agent {
    registry: Arc<ConfigRegistry>,
    recorder: SpanRecorder,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

fn agent(config: AgentConfig) -> Agent {
    let registry = Arc::new(ConfigRegistry::new(config));
    let policy = CapturePolicy::install(&registry);
    let sink = Arc::new(RecordingSink::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let recorder = SpanRecorder::new(
        policy,
        Arc::new(ShadowStore::new()),
        Arc::clone(&sink) as Arc<dyn SpanSink>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Agent {
        registry,
        recorder,
        sink,
        clock,
    }
}

#[test]
fn full_capture_path_from_prepare_to_sink() {
    let agent = agent(AgentConfig::default());
    let id = InstanceId(1);

    // prepare
    let state = agent
        .recorder
        .store()
        .attach(id, "select name from widgets where group = ?");
    // bind
    state.set_parameter(1, ParameterValue::Scalar("'w-9'".into()));
    // execute
    let span = agent.recorder.start(id);
    // result iteration
    state.record_rows(3);
    agent.clock.advance(12);
    agent.recorder.close_success(span);
    // release
    agent.recorder.store().release(id);

    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].message_text(),
        "select name from widgets where group = ? ['w-9'] => 3 rows"
    );
    assert_eq!(spans[0].start_millis, 1_000_000);
    assert_eq!(spans[0].end_millis, 1_000_012);
    assert!(matches!(
        spans[0].outcome,
        SpanOutcome::Completed { stack_capture: false }
    ));
    assert!(agent.recorder.store().is_empty());
}

#[test]
fn failed_operation_is_recorded_and_capture_continues() {
    let agent = agent(AgentConfig::default());
    let id = InstanceId(2);
    agent.recorder.store().attach(id, "delete from widgets");

    let span = agent.recorder.start(id);
    agent
        .recorder
        .close_error(span, ErrorDetail::new("LockTimeout", "lock wait timeout"));

    let span = agent.recorder.start(id);
    agent.recorder.close_success(span);

    let spans = agent.sink.spans();
    assert_eq!(spans.len(), 2);
    assert!(matches!(spans[0].outcome, SpanOutcome::Error(_)));
    assert!(matches!(spans[1].outcome, SpanOutcome::Completed { .. }));
}

#[test]
fn reconfigure_mid_flight_affects_only_later_operations() {
    let agent = agent(AgentConfig::default());
    let id = InstanceId(3);
    let state = agent.recorder.store().attach(id, "select ?");
    state.set_parameter(1, ParameterValue::Scalar("1".into()));

    let in_flight = agent.recorder.start(id);

    let mut disabled = AgentConfig::default();
    disabled.capture.enabled = false;
    agent.registry.update(disabled);

    // The in-flight span closes under the snapshot it started with
    agent.recorder.close_success(in_flight);
    // New operations see the disabled policy
    assert!(agent.recorder.start(id).is_none());

    agent.registry.update(AgentConfig::default());
    let span = agent.recorder.start(id);
    assert!(span.is_some());
    agent.recorder.close_success(span);

    assert_eq!(agent.sink.len(), 2);
}

#[test]
fn hex_display_rules_flow_from_config_to_policy() {
    let mut config = AgentConfig::default();
    config.capture.hex_display_rules = vec![HexDisplayRule {
        descriptor: "insert into blobs values (?)".into(),
        index: 1,
    }];
    let agent = agent(config);

    let policy = CapturePolicy::install(&agent.registry);
    let snapshot = policy.snapshot();
    assert!(snapshot.display_as_hex("insert into blobs values (?)", 1));
    assert!(!snapshot.display_as_hex("insert into blobs values (?)", 2));
    assert!(!snapshot.display_as_hex("insert into other values (?)", 1));

    // The rule reaches the span message through bind-time tagging
    let id = InstanceId(4);
    let state = agent
        .recorder
        .store()
        .attach(id, "insert into blobs values (?)");
    state.set_bytes_parameter(&snapshot, 1, vec![0x0a, 0x0b, 0xff]);
    let span = agent.recorder.start(id);
    agent.recorder.close_success(span);

    assert_eq!(
        agent.sink.spans()[0].message_text(),
        "insert into blobs values (?) [0x0a0bff]"
    );
}

struct CountingStore {
    cutoffs: Mutex<Vec<u64>>,
}

impl CountingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cutoffs: Mutex::new(Vec::new()),
        })
    }

    fn cutoffs(&self) -> Vec<u64> {
        self.cutoffs.lock().unwrap().clone()
    }
}

impl ExpirableStore for CountingStore {
    fn delete_before(&self, cutoff_millis: u64) -> Result<(), StorageError> {
        self.cutoffs.lock().unwrap().push(cutoff_millis);
        Ok(())
    }
}

struct BrokenStore;

impl ExpirableStore for BrokenStore {
    fn delete_before(&self, _cutoff_millis: u64) -> Result<(), StorageError> {
        Err(StorageError::Backend("connection refused".into()))
    }
}

#[tokio::test]
async fn retention_runs_over_all_categories_and_survives_failures() {
    let config = AgentConfig {
        retention: RetentionSettings {
            aggregate_expiration_hours: 44,
            trace_expiration_hours: 55,
            gauge_expiration_hours: 66,
        },
        ..AgentConfig::default()
    };
    let registry = Arc::new(ConfigRegistry::new(config));
    let now = 1_000 * MILLIS_PER_HOUR;
    let clock = Arc::new(ManualClock::new(now));

    let aggregate = CountingStore::new();
    let gauges = CountingStore::new();
    let reaper = Reaper::new(registry, clock)
        .with_store(StorageCategory::AggregateMetrics, aggregate.clone())
        .with_store(StorageCategory::DetailedTraces, Arc::new(BrokenStore))
        .with_store(StorageCategory::GaugeSamples, gauges.clone());

    let scheduler = RetentionScheduler::spawn(reaper, Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(45)).await;
    let metrics = Arc::clone(scheduler.metrics());
    scheduler.shutdown().await;

    // The broken middle category never blocked the other two
    assert!(metrics.cycles_completed() >= 2);
    assert_eq!(metrics.deletion_failures(), metrics.cycles_completed());
    assert_eq!(aggregate.cutoffs()[0], now - 44 * MILLIS_PER_HOUR);
    assert_eq!(gauges.cutoffs()[0], now - 66 * MILLIS_PER_HOUR);
    assert_eq!(aggregate.cutoffs().len() as u64, metrics.cycles_completed());
}
