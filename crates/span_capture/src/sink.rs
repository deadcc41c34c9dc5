//! Destinations for completed spans.
//!
//! The recorder hands each closed span to a [`SpanSink`] synchronously.
//! Sinks are expected to be cheap; anything slow belongs behind its own
//! buffering.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use crate::span::Span;

/// Receives completed spans.
pub trait SpanSink: Send + Sync {
    /// Accepts one completed span. Must not panic; delivery problems are the
    /// sink's to report and swallow.
    fn record(&self, span: Span);

    /// Sink name for diagnostics.
    fn name(&self) -> &str;
}

/// Discards every span.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SpanSink for NullSink {
    fn record(&self, _span: Span) {}

    fn name(&self) -> &str {
        "null"
    }
}

/// Appends spans to a file as JSON lines, one object per span.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, span: &Span) -> std::io::Result<()> {
        let line = serde_json::to_string(span)?;
        let mut writer = self.writer.lock().expect("sink writer lock poisoned");
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

impl SpanSink for JsonLinesSink {
    fn record(&self, span: Span) {
        if let Err(err) = self.write_line(&span) {
            warn!(error = %err, "failed to write span to json-lines sink");
        }
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}

/// Collects spans in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    spans: Mutex<Vec<Span>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All spans recorded so far, in arrival order.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().expect("recording sink lock poisoned").clone()
    }

    /// Number of spans recorded so far.
    pub fn len(&self) -> usize {
        self.spans.lock().expect("recording sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpanSink for RecordingSink {
    fn record(&self, span: Span) {
        self.spans
            .lock()
            .expect("recording sink lock poisoned")
            .push(span);
    }

    fn name(&self) -> &str {
        "recording"
    }
}
