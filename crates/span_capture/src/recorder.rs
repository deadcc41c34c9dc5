//! Span recorder: times monitored operations against the current policy.
//!
//! Each operation start takes exactly one policy snapshot; every decision
//! for that span (capture at all, parameter capture, stack-trace threshold)
//! is made against that snapshot, so a reconfigure mid-operation never
//! produces a half-old, half-new span.

use std::sync::Arc;

use crate::clock::Clock;
use crate::policy::CapturePolicy;
use crate::shadow::{InstanceId, ShadowStore};
use crate::sink::SpanSink;
use crate::span::{ErrorDetail, OpenSpan, SpanCell, SpanMessage};

/// Records spans for monitored operations.
///
/// `start`/`start_batch` return `None` when capture is disabled; the close
/// methods tolerate `None` so wrappers can pass whatever `start` gave them
/// without branching. Capture-path failures never reach the monitored
/// caller.
pub struct SpanRecorder {
    policy: Arc<CapturePolicy>,
    store: Arc<ShadowStore>,
    sink: Arc<dyn SpanSink>,
    clock: Arc<dyn Clock>,
}

impl SpanRecorder {
    pub fn new(
        policy: Arc<CapturePolicy>,
        store: Arc<ShadowStore>,
        sink: Arc<dyn SpanSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            store,
            sink,
            clock,
        }
    }

    /// The shadow store the recorder reads message state from.
    pub fn store(&self) -> &Arc<ShadowStore> {
        &self.store
    }

    /// Starts a span for a single execution of the instance's operation.
    ///
    /// Returns `None` when capture is disabled. The disabled path also
    /// clears the shadow's last-span cell so row counts from result
    /// iteration cannot merge into a span that predates the disable.
    pub fn start(&self, id: InstanceId) -> Option<OpenSpan> {
        self.start_with(id, false)
    }

    /// Starts a span for a batch execution, aggregating every queued
    /// parameter set into the message. An empty batch yields a batched
    /// message with no sets, rendering as the bare descriptor.
    pub fn start_batch(&self, id: InstanceId) -> Option<OpenSpan> {
        self.start_with(id, true)
    }

    fn start_with(&self, id: InstanceId, batch: bool) -> Option<OpenSpan> {
        let snapshot = self.policy.snapshot();
        if !snapshot.capture_enabled {
            if let Some(state) = self.store.get(id) {
                state.set_last_span(None);
            }
            return None;
        }

        let state = self.store.get_or_create(id);
        let descriptor = state.descriptor().to_string();
        let message = if snapshot.capture_bind_parameters {
            if batch {
                SpanMessage::WithBatchedParameters {
                    descriptor,
                    batches: state.rendered_batches(),
                }
            } else {
                let parameters = state.rendered_parameters();
                if parameters.is_empty() {
                    SpanMessage::Descriptor { descriptor }
                } else {
                    SpanMessage::WithParameters {
                        descriptor,
                        parameters,
                    }
                }
            }
        } else {
            SpanMessage::Descriptor { descriptor }
        };

        let cell = Arc::new(SpanCell::default());
        state.set_last_span(Some(Arc::clone(&cell)));
        Some(OpenSpan::new(
            message,
            snapshot,
            cell,
            self.clock.now_millis(),
        ))
    }

    /// Closes a span successfully and delivers it to the sink.
    ///
    /// `None` (capture was disabled at start) is a no-op.
    pub fn close_success(&self, span: Option<OpenSpan>) {
        if let Some(span) = span {
            self.sink.record(span.complete(self.clock.now_millis()));
        }
    }

    /// Closes a span with an error outcome and delivers it to the sink.
    ///
    /// Always succeeds; the wrapper returns the original error to its own
    /// caller regardless.
    pub fn close_error(&self, span: Option<OpenSpan>, error: ErrorDetail) {
        if let Some(span) = span {
            self.sink.record(span.fail(self.clock.now_millis(), error));
        }
    }
}
