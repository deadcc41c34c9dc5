//! Span types: the timed record of one monitored operation.
//!
//! A span is created by the recorder when an operation starts, carries a
//! message snapshot taken from the shadow state at that moment, and is
//! closed exactly once with either a success or an error outcome. While the
//! span is open, row counts may be merged in through the shared [`SpanCell`]
//! that the shadow state also holds.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PolicySnapshot;

/// Descriptive metadata snapshot attached to a span at start.
///
/// The variant is chosen once at start and never changes afterwards: either
/// the bare operation descriptor, the descriptor with the rendered parameter
/// bindings, or (for batch operations) the descriptor with every queued
/// parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpanMessage {
    /// Descriptor only (parameter capture disabled or nothing bound).
    Descriptor { descriptor: String },
    /// Descriptor plus the rendered current parameter bindings.
    WithParameters {
        descriptor: String,
        parameters: Vec<String>,
    },
    /// Descriptor plus all queued parameter sets of a batch.
    WithBatchedParameters {
        descriptor: String,
        batches: Vec<Vec<String>>,
    },
}

impl SpanMessage {
    /// The operation descriptor this message describes.
    pub fn descriptor(&self) -> &str {
        match self {
            Self::Descriptor { descriptor }
            | Self::WithParameters { descriptor, .. }
            | Self::WithBatchedParameters { descriptor, .. } => descriptor,
        }
    }

    /// Renders the message as display text, appending the row count when one
    /// was merged into the span.
    pub fn render(&self, rows: Option<u64>) -> String {
        let mut text = match self {
            Self::Descriptor { descriptor } => descriptor.clone(),
            Self::WithParameters {
                descriptor,
                parameters,
            } => {
                let mut text = descriptor.clone();
                write_parameter_set(&mut text, parameters);
                text
            }
            Self::WithBatchedParameters {
                descriptor,
                batches,
            } => {
                let mut text = descriptor.clone();
                for set in batches {
                    write_parameter_set(&mut text, set);
                }
                text
            }
        };
        match rows {
            Some(1) => text.push_str(" => 1 row"),
            Some(n) => {
                let _ = write!(text, " => {n} rows");
            }
            None => {}
        }
        text
    }
}

fn write_parameter_set(text: &mut String, parameters: &[String]) {
    text.push_str(" [");
    for (i, parameter) in parameters.iter().enumerate() {
        if i > 0 {
            text.push_str(", ");
        }
        text.push_str(parameter);
    }
    text.push(']');
}

/// Classification and message of a failed monitored operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error classification, e.g. the error type's name.
    pub kind: String,
    /// Human-readable failure message.
    pub message: String,
}

impl ErrorDetail {
    /// Creates an error detail from a classification and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcome of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpanOutcome {
    /// The operation completed normally.
    Completed {
        /// Set when the duration exceeded the stack-trace threshold.
        stack_capture: bool,
    },
    /// The operation failed.
    Error(ErrorDetail),
}

/// A completed, immutable span record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Message snapshot taken at operation start.
    pub message: SpanMessage,
    /// Wall-clock start, epoch milliseconds.
    pub start_millis: u64,
    /// Wall-clock end, epoch milliseconds.
    pub end_millis: u64,
    /// Monotonic duration of the operation.
    pub duration: Duration,
    /// Terminal outcome.
    pub outcome: SpanOutcome,
    /// Rows processed, when merged in while the span was open.
    pub rows: Option<u64>,
}

impl Span {
    /// Display text: rendered message including the row count suffix.
    pub fn message_text(&self) -> String {
        self.message.render(self.rows)
    }
}

/// Shared mutable slot for update-while-open counters.
///
/// The shadow state holds the cell of the most recent open span so that
/// result iteration can merge row counts without a reference to the span
/// itself. A count of zero is distinct from "never recorded".
#[derive(Debug, Default)]
pub struct SpanCell {
    rows: AtomicU64,
    rows_recorded: AtomicBool,
}

impl SpanCell {
    /// Adds to the row count of the owning open span.
    pub fn add_rows(&self, n: u64) {
        self.rows.fetch_add(n, Ordering::Relaxed);
        self.rows_recorded.store(true, Ordering::Release);
    }

    /// Returns the merged row count, or `None` if none was ever recorded.
    pub fn rows(&self) -> Option<u64> {
        if self.rows_recorded.load(Ordering::Acquire) {
            Some(self.rows.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

/// An open span: started, not yet closed.
///
/// Closing consumes the span, so a second close is unrepresentable. The
/// policy snapshot captured at start travels with the span; a reconfigure
/// mid-operation does not change this span's threshold.
///
/// Duration comes from the same injected clock that stamps `start_millis`
/// and `end_millis`, so the emitted span is internally consistent and
/// timing decisions are deterministic under a manual clock.
pub struct OpenSpan {
    message: SpanMessage,
    policy: Arc<PolicySnapshot>,
    cell: Arc<SpanCell>,
    start_millis: u64,
}

impl OpenSpan {
    pub(crate) fn new(
        message: SpanMessage,
        policy: Arc<PolicySnapshot>,
        cell: Arc<SpanCell>,
        start_millis: u64,
    ) -> Self {
        Self {
            message,
            policy,
            cell,
            start_millis,
        }
    }

    /// The message snapshot taken at start.
    pub fn message(&self) -> &SpanMessage {
        &self.message
    }

    fn duration_to(&self, end_millis: u64) -> Duration {
        Duration::from_millis(end_millis.saturating_sub(self.start_millis))
    }

    pub(crate) fn complete(self, end_millis: u64) -> Span {
        let duration = self.duration_to(end_millis);
        let stack_capture = should_request_stack(duration, self.policy.stack_trace_threshold);
        self.into_span(end_millis, duration, SpanOutcome::Completed { stack_capture })
    }

    pub(crate) fn fail(self, end_millis: u64, error: ErrorDetail) -> Span {
        let duration = self.duration_to(end_millis);
        self.into_span(end_millis, duration, SpanOutcome::Error(error))
    }

    pub(crate) fn into_span(self, end_millis: u64, duration: Duration, outcome: SpanOutcome) -> Span {
        Span {
            message: self.message,
            start_millis: self.start_millis,
            end_millis,
            duration,
            outcome,
            rows: self.cell.rows(),
        }
    }
}

/// Whether a span of `duration` should be tagged to request a stack capture.
///
/// Strictly greater: a duration exactly at the threshold is not tagged.
pub(crate) fn should_request_stack(duration: Duration, threshold: Duration) -> bool {
    duration > threshold
}
