//! Agent configuration: capture settings and retention windows.
//!
//! The registry is the single shared read source for both the capture path
//! and the retention engine. Writers publish a whole new [`AgentConfig`];
//! registered listeners are invoked synchronously so that derived snapshots
//! (see [`crate::policy`]) are recomputed before `update` returns. Readers
//! never observe a half-written config.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retention::StorageCategory;

/// Errors raised while loading or parsing configuration.
///
/// Configuration must be available at startup; an `Err` from
/// [`ConfigRegistry::from_source`] is fatal for the agent since no operation
/// may be captured with an undefined policy.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The backing configuration source could not be read.
    #[error("configuration unavailable: {0}")]
    Unavailable(String),

    /// The configuration document could not be parsed.
    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A rule forcing a byte-array parameter to render as hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexDisplayRule {
    /// Operation descriptor the rule applies to (exact match).
    pub descriptor: String,
    /// Parameter index the rule applies to.
    pub index: u32,
}

/// Settings controlling how much detail the capture path records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Master toggle. When off, operations run untraced.
    pub enabled: bool,
    /// Whether bound parameter values are captured into span messages.
    pub capture_bind_parameters: bool,
    /// Spans longer than this are tagged to request a stack capture.
    pub stack_trace_threshold_millis: u64,
    /// Byte-array parameters matching a rule render as hex.
    #[serde(default)]
    pub hex_display_rules: Vec<HexDisplayRule>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_bind_parameters: true,
            stack_trace_threshold_millis: 1_000,
            hex_display_rules: Vec::new(),
        }
    }
}

impl CaptureSettings {
    /// Stack-trace threshold as a `Duration`.
    pub fn stack_trace_threshold(&self) -> Duration {
        Duration::from_millis(self.stack_trace_threshold_millis)
    }
}

/// Per-category expiration windows, in hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Window for aggregated metric rollups.
    pub aggregate_expiration_hours: u64,
    /// Window for detailed trace records.
    pub trace_expiration_hours: u64,
    /// Window for gauge samples.
    pub gauge_expiration_hours: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            aggregate_expiration_hours: 720,
            trace_expiration_hours: 168,
            gauge_expiration_hours: 336,
        }
    }
}

impl RetentionSettings {
    /// Returns the expiration window for a storage category, in hours.
    pub fn window_hours(&self, category: StorageCategory) -> u64 {
        match category {
            StorageCategory::AggregateMetrics => self.aggregate_expiration_hours,
            StorageCategory::DetailedTraces => self.trace_expiration_hours,
            StorageCategory::GaugeSamples => self.gauge_expiration_hours,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Capture-path settings.
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Retention windows.
    #[serde(default)]
    pub retention: RetentionSettings,
}

impl AgentConfig {
    /// Parses a configuration document from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Read source for configuration, e.g. a file or an embedded document.
pub trait ConfigSource: Send + Sync {
    /// Loads the full configuration, or fails if it is unavailable.
    fn load(&self) -> Result<AgentConfig, ConfigError>;
}

type ChangeListener = Box<dyn Fn(&AgentConfig) + Send + Sync>;

/// Process-wide configuration registry with push-style change notification.
///
/// Listeners run synchronously inside [`ConfigRegistry::update`], on the
/// updating thread, after the new config is stored. Listeners must not call
/// back into the registry's write path.
pub struct ConfigRegistry {
    current: RwLock<AgentConfig>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ConfigRegistry {
    /// Creates a registry seeded with an in-memory configuration.
    pub fn new(initial: AgentConfig) -> Self {
        Self {
            current: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Creates a registry from a configuration source.
    ///
    /// Fails fatally when the source cannot produce a configuration: the
    /// agent must not start capturing with an undefined policy.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        Ok(Self::new(source.load()?))
    }

    /// Returns a copy of the current configuration.
    pub fn current(&self) -> AgentConfig {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Returns the current expiration window for a category, in hours.
    ///
    /// Read fresh by the retention engine on every cycle; never cached.
    pub fn retention_window_hours(&self, category: StorageCategory) -> u64 {
        self.current
            .read()
            .expect("config lock poisoned")
            .retention
            .window_hours(category)
    }

    /// Registers a listener invoked synchronously on every update.
    pub fn on_change(&self, listener: impl Fn(&AgentConfig) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Publishes a new configuration and notifies all listeners.
    pub fn update(&self, config: AgentConfig) {
        {
            let mut current = self.current.write().expect("config lock poisoned");
            *current = config.clone();
        }
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(&config);
        }
    }
}
