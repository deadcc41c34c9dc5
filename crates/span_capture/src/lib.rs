//! Capture-and-retain core of an application monitoring agent.
//!
//! Two tightly coupled halves: a shadow-state layer that attaches mutable
//! tracking state to monitored resource instances and times each operation
//! into a span, and a background retention engine that deletes expired
//! records from durable storage on a fixed cadence.
//!
//! Capture behavior is driven by immutable policy snapshots published from a
//! hot-reloadable config registry: each operation reads exactly one snapshot
//! at start, so reconfiguration is race-free without locking the hot path.

pub mod clock;
pub mod config;
pub mod policy;
pub mod recorder;
pub mod retention;
pub mod shadow;
pub mod sink;
pub mod span;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgentConfig, CaptureSettings, ConfigError, ConfigRegistry, ConfigSource, HexDisplayRule,
    RetentionSettings,
};
pub use policy::{CapturePolicy, PolicySnapshot};
pub use recorder::SpanRecorder;
pub use retention::{
    ExpirableStore, Reaper, RetentionMetrics, RetentionScheduler, StorageCategory, StorageError,
    DEFAULT_PERIOD,
};
pub use shadow::{InstanceId, ParameterValue, ShadowState, ShadowStore, PLACEHOLDER_DESCRIPTOR};
pub use sink::{JsonLinesSink, NullSink, RecordingSink, SpanSink};
pub use span::{ErrorDetail, OpenSpan, Span, SpanCell, SpanMessage, SpanOutcome};
