//! Capture policy snapshots.
//!
//! The hot capture path must never read live configuration: a reconfigure
//! racing an in-flight operation would otherwise produce torn reads (e.g.
//! parameters captured under one setting, threshold applied under another).
//! Instead the policy keeps one immutable [`PolicySnapshot`] published behind
//! a lock and recomputes it from a registry change listener. Readers take a
//! single `Arc` clone per operation and use that snapshot for the whole
//! operation.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use crate::config::{AgentConfig, ConfigRegistry, HexDisplayRule};

/// Immutable view of the capture settings, taken once per operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    /// Whether operations are captured at all.
    pub capture_enabled: bool,
    /// Whether bound parameters are rendered into span messages.
    pub capture_bind_parameters: bool,
    /// Spans strictly longer than this request a stack capture on close.
    pub stack_trace_threshold: Duration,
    hex_display_rules: Vec<HexDisplayRule>,
}

impl PolicySnapshot {
    fn from_config(config: &AgentConfig) -> Self {
        Self {
            capture_enabled: config.capture.enabled,
            capture_bind_parameters: config.capture.capture_bind_parameters,
            stack_trace_threshold: config.capture.stack_trace_threshold(),
            hex_display_rules: config.capture.hex_display_rules.clone(),
        }
    }

    /// Returns `true` if a byte-array parameter at `index` of the operation
    /// identified by `descriptor` should be rendered as hex.
    pub fn display_as_hex(&self, descriptor: &str, index: u32) -> bool {
        self.hex_display_rules
            .iter()
            .any(|rule| rule.index == index && rule.descriptor == descriptor)
    }
}

/// Process-wide capture policy, hot-reloadable via the config registry.
pub struct CapturePolicy {
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl CapturePolicy {
    /// Builds the policy from the registry's current configuration and
    /// subscribes to future updates.
    ///
    /// The initial snapshot is established here, before any operation can be
    /// captured; there is no observable unconfigured state. The listener
    /// holds a `Weak` so a dropped policy does not keep republishing.
    pub fn install(registry: &ConfigRegistry) -> Arc<Self> {
        let policy = Arc::new(Self {
            snapshot: RwLock::new(Arc::new(PolicySnapshot::from_config(&registry.current()))),
        });

        let weak: Weak<Self> = Arc::downgrade(&policy);
        registry.on_change(move |config| {
            if let Some(policy) = weak.upgrade() {
                policy.republish(config);
            }
        });

        policy
    }

    /// Returns the latest published snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.snapshot.read().expect("policy lock poisoned"))
    }

    fn republish(&self, config: &AgentConfig) {
        let next = Arc::new(PolicySnapshot::from_config(config));
        *self.snapshot.write().expect("policy lock poisoned") = next;
    }
}
