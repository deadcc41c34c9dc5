//! Shadow state: per-instance tracking state kept in a side table.
//!
//! Monitored instances are owned by the monitored process; the core never
//! embeds state in objects it does not control. Instead a concurrent side
//! table maps a stable [`InstanceId`] (assigned by the interception layer at
//! first sight) to the instance's [`ShadowState`], created lazily on first
//! access and dropped on an explicit release notification.
//!
//! Shadow state must be tracked for the instance's entire life, not just
//! while capture is enabled: an instance prepared while capture was off can
//! still be executed after a reconfigure turns it on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::policy::PolicySnapshot;
use crate::span::SpanCell;

/// Descriptor synthesized for instances first seen outside the normal
/// prepare path, where no operation text is obtainable.
pub const PLACEHOLDER_DESCRIPTOR: &str = "<descriptor unavailable>";

/// Stable identifier of one monitored resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// One bound-parameter value.
///
/// A `Null` binding is a distinct value, not absence; setting any variant at
/// an index overwrites whatever was there before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterValue {
    /// A scalar rendered to display text at bind time.
    Scalar(String),
    /// An explicit null binding.
    Null,
    /// A streaming source (reader/stream); contents are never captured.
    Streaming,
    /// A byte array, optionally rendered as hex.
    Bytes {
        bytes: Vec<u8>,
        display_as_hex: bool,
    },
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(text) => f.write_str(text),
            Self::Null => f.write_str("NULL"),
            Self::Streaming => f.write_str("<streaming parameter>"),
            Self::Bytes {
                bytes,
                display_as_hex,
            } => {
                if *display_as_hex {
                    f.write_str("0x")?;
                    for byte in bytes {
                        write!(f, "{byte:02x}")?;
                    }
                    Ok(())
                } else {
                    write!(f, "{{{} bytes}}", bytes.len())
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ShadowInner {
    parameters: BTreeMap<u32, ParameterValue>,
    batches: Vec<BTreeMap<u32, ParameterValue>>,
    last_span: Option<Arc<SpanCell>>,
}

/// Mutable tracking state owned by exactly one monitored instance.
///
/// Mutations are expected from the instance's owning thread; the internal
/// lock makes them safe against a concurrent `get_or_create` from another
/// thread. Last write per index wins.
pub struct ShadowState {
    descriptor: String,
    inner: Mutex<ShadowInner>,
}

impl ShadowState {
    fn new(descriptor: String) -> Self {
        Self {
            descriptor,
            inner: Mutex::new(ShadowInner::default()),
        }
    }

    /// The operation descriptor captured at prepare time, or the placeholder.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Binds a parameter value at `index`, overwriting any prior value.
    pub fn set_parameter(&self, index: u32, value: ParameterValue) {
        self.lock().parameters.insert(index, value);
    }

    /// Binds a byte-array parameter, consulting the policy's hex-display
    /// rules for this instance's descriptor.
    pub fn set_bytes_parameter(&self, policy: &PolicySnapshot, index: u32, bytes: Vec<u8>) {
        let display_as_hex = policy.display_as_hex(self.descriptor(), index);
        self.set_parameter(
            index,
            ParameterValue::Bytes {
                bytes,
                display_as_hex,
            },
        );
    }

    /// Returns the current value bound at `index`.
    pub fn parameter(&self, index: u32) -> Option<ParameterValue> {
        self.lock().parameters.get(&index).cloned()
    }

    /// Queues a copy of the current parameter bindings as one batch entry.
    pub fn add_batch_entry(&self) {
        let mut inner = self.lock();
        let snapshot = inner.parameters.clone();
        inner.batches.push(snapshot);
    }

    /// Number of queued batch entries.
    pub fn batch_len(&self) -> usize {
        self.lock().batches.len()
    }

    /// Drops the queued batch entries.
    ///
    /// The current parameter bindings persist: clearing the batch re-initiates
    /// an instance cached from a previous use, it does not unbind parameters.
    pub fn clear_batch(&self) {
        self.lock().batches.clear();
    }

    /// Renders the current parameter bindings in index order.
    pub fn rendered_parameters(&self) -> Vec<String> {
        self.lock()
            .parameters
            .values()
            .map(ToString::to_string)
            .collect()
    }

    /// Renders every queued batch entry in index order.
    pub fn rendered_batches(&self) -> Vec<Vec<String>> {
        self.lock()
            .batches
            .iter()
            .map(|set| set.values().map(ToString::to_string).collect())
            .collect()
    }

    /// Merges processed rows into the most recent open span.
    ///
    /// Silently dropped when there is no open span (capture was disabled at
    /// start, or the span already closed and was cleared).
    pub fn record_rows(&self, n: u64) {
        if let Some(cell) = self.lock().last_span.as_ref() {
            cell.add_rows(n);
        }
    }

    /// Returns `true` while a span cell is installed.
    pub fn has_open_span(&self) -> bool {
        self.lock().last_span.is_some()
    }

    pub(crate) fn set_last_span(&self, cell: Option<Arc<SpanCell>>) {
        self.lock().last_span = cell;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShadowInner> {
        self.inner.lock().expect("shadow lock poisoned")
    }
}

impl fmt::Debug for ShadowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowState")
            .field("descriptor", &self.descriptor)
            .field("batch_len", &self.batch_len())
            .finish_non_exhaustive()
    }
}

/// Concurrent side table of shadow state, keyed by instance id.
pub struct ShadowStore {
    table: DashMap<InstanceId, Arc<ShadowState>>,
    missing_descriptor_warned: AtomicBool,
}

impl Default for ShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            missing_descriptor_warned: AtomicBool::new(false),
        }
    }

    /// Attaches shadow state with a known descriptor (the normal prepare
    /// path). If state already exists for `id` it is kept unchanged, so
    /// racing attaches converge the same way `get_or_create` races do.
    pub fn attach(&self, id: InstanceId, descriptor: impl Into<String>) -> Arc<ShadowState> {
        let descriptor = descriptor.into();
        Arc::clone(
            &self
                .table
                .entry(id)
                .or_insert_with(|| Arc::new(ShadowState::new(descriptor))),
        )
    }

    /// Returns the shadow state for `id`, creating it if absent.
    ///
    /// Concurrent first access converges to a single state. When no
    /// descriptor was ever attached, the created state carries
    /// [`PLACEHOLDER_DESCRIPTOR`] and a warning is logged once per process
    /// lifetime, not once per instance.
    pub fn get_or_create(&self, id: InstanceId) -> Arc<ShadowState> {
        if let Some(existing) = self.table.get(&id) {
            return Arc::clone(&existing);
        }

        let mut created = false;
        let state = Arc::clone(&self.table.entry(id).or_insert_with(|| {
            created = true;
            Arc::new(ShadowState::new(PLACEHOLDER_DESCRIPTOR.to_string()))
        }));

        if created && !self.missing_descriptor_warned.swap(true, Ordering::Relaxed) {
            warn!(
                instance = %id,
                "monitored instance created outside the instrumented prepare path, \
                 no operation descriptor available (reported once per process)"
            );
        }

        state
    }

    /// Returns the shadow state for `id` without creating it.
    pub fn get(&self, id: InstanceId) -> Option<Arc<ShadowState>> {
        self.table.get(&id).map(|state| Arc::clone(&state))
    }

    /// Detaches and drops the shadow state for a released instance.
    ///
    /// The open-span cell is cleared first so outstanding handles stop
    /// merging counters into a record for a dead instance.
    pub fn release(&self, id: InstanceId) {
        if let Some((_, state)) = self.table.remove(&id) {
            state.set_last_span(None);
        }
    }

    /// Number of instances currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` when no instance is tracked.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether the missing-descriptor warning has fired.
    pub fn missing_descriptor_warned(&self) -> bool {
        self.missing_descriptor_warned.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn parameter_last_write_wins() {
        let state = ShadowState::new("update widgets set name = ? where id = ?".into());
        state.set_parameter(1, ParameterValue::Scalar("'old'".into()));
        state.set_parameter(2, ParameterValue::Scalar("7".into()));
        state.set_parameter(1, ParameterValue::Null);

        assert_eq!(state.parameter(1), Some(ParameterValue::Null));
        assert_eq!(
            state.parameter(2),
            Some(ParameterValue::Scalar("7".into()))
        );
    }

    #[test]
    fn clear_batch_keeps_parameter_table() {
        let state = ShadowState::new("insert into widgets values (?)".into());
        state.set_parameter(1, ParameterValue::Scalar("'a'".into()));
        state.add_batch_entry();
        state.set_parameter(1, ParameterValue::Scalar("'b'".into()));
        state.add_batch_entry();
        assert_eq!(state.batch_len(), 2);

        state.clear_batch();

        // Only the batch-entry count resets; the last bound value persists
        assert_eq!(state.batch_len(), 0);
        assert_eq!(
            state.parameter(1),
            Some(ParameterValue::Scalar("'b'".into()))
        );
    }

    #[test]
    fn batch_entries_snapshot_bindings_at_queue_time() {
        let state = ShadowState::new("insert into widgets values (?, ?)".into());
        state.set_parameter(1, ParameterValue::Scalar("1".into()));
        state.set_parameter(2, ParameterValue::Scalar("'a'".into()));
        state.add_batch_entry();
        state.set_parameter(2, ParameterValue::Scalar("'b'".into()));
        state.add_batch_entry();

        assert_eq!(
            state.rendered_batches(),
            vec![vec!["1".to_string(), "'a'".to_string()], vec![
                "1".to_string(),
                "'b'".to_string()
            ]]
        );
    }

    #[test]
    fn byte_parameter_round_trips_hex_flag() {
        let state = ShadowState::new("insert into blobs values (?)".into());
        state.set_parameter(
            1,
            ParameterValue::Bytes {
                bytes: vec![0x0a, 0x0b, 0xff],
                display_as_hex: true,
            },
        );

        match state.parameter(1) {
            Some(ParameterValue::Bytes {
                bytes,
                display_as_hex,
            }) => {
                assert_eq!(bytes, vec![0x0a, 0x0b, 0xff]);
                assert!(display_as_hex);
            }
            other => panic!("expected bytes parameter, got {other:?}"),
        }
    }

    #[test]
    fn bytes_parameter_binding_consults_hex_rules() {
        use crate::config::{AgentConfig, CaptureSettings, ConfigRegistry, HexDisplayRule};
        use crate::policy::CapturePolicy;

        let registry = ConfigRegistry::new(AgentConfig {
            capture: CaptureSettings {
                hex_display_rules: vec![HexDisplayRule {
                    descriptor: "insert into blobs values (?, ?)".into(),
                    index: 1,
                }],
                ..CaptureSettings::default()
            },
            ..AgentConfig::default()
        });
        let snapshot = CapturePolicy::install(&registry).snapshot();

        let state = ShadowState::new("insert into blobs values (?, ?)".into());
        state.set_bytes_parameter(&snapshot, 1, vec![0x0a, 0x0b]);
        state.set_bytes_parameter(&snapshot, 2, vec![0x0a, 0x0b]);

        assert_eq!(
            state.rendered_parameters(),
            vec!["0x0a0b".to_string(), "{2 bytes}".to_string()]
        );
    }

    #[test]
    fn parameter_display_forms() {
        assert_eq!(ParameterValue::Scalar("'x'".into()).to_string(), "'x'");
        assert_eq!(ParameterValue::Null.to_string(), "NULL");
        assert_eq!(
            ParameterValue::Streaming.to_string(),
            "<streaming parameter>"
        );
        assert_eq!(
            ParameterValue::Bytes {
                bytes: vec![0x0a, 0x0b],
                display_as_hex: true
            }
            .to_string(),
            "0x0a0b"
        );
        assert_eq!(
            ParameterValue::Bytes {
                bytes: vec![1, 2, 3],
                display_as_hex: false
            }
            .to_string(),
            "{3 bytes}"
        );
    }

    #[test]
    fn concurrent_get_or_create_converges_to_one_state() {
        let store = Arc::new(ShadowStore::new());
        let id = InstanceId(42);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || store.get_or_create(id)));
        }

        let states: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for state in &states[1..] {
            assert!(Arc::ptr_eq(&states[0], state));
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_descriptor_warns_once_across_many_instances() {
        let store = ShadowStore::new();
        assert!(!store.missing_descriptor_warned());

        for i in 0..1_000 {
            let state = store.get_or_create(InstanceId(i));
            assert_eq!(state.descriptor(), PLACEHOLDER_DESCRIPTOR);
        }

        // The latch flipped on the first placeholder and stayed latched
        assert!(store.missing_descriptor_warned());
        assert_eq!(store.len(), 1_000);
    }

    #[test]
    fn attach_path_never_warns() {
        let store = ShadowStore::new();
        let state = store.attach(InstanceId(1), "select 1");
        assert_eq!(state.descriptor(), "select 1");
        assert!(!store.missing_descriptor_warned());

        // Later access returns the attached state, still no warning
        let again = store.get_or_create(InstanceId(1));
        assert!(Arc::ptr_eq(&state, &again));
        assert!(!store.missing_descriptor_warned());
    }

    #[test]
    fn attach_is_first_wins() {
        let store = ShadowStore::new();
        let first = store.attach(InstanceId(5), "select 1");
        let second = store.attach(InstanceId(5), "select 2");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.descriptor(), "select 1");
    }

    #[test]
    fn release_detaches_state() {
        let store = ShadowStore::new();
        store.attach(InstanceId(9), "select 1");
        assert_eq!(store.len(), 1);

        store.release(InstanceId(9));
        assert!(store.is_empty());
        assert!(store.get(InstanceId(9)).is_none());

        // Releasing an unknown instance is a no-op
        store.release(InstanceId(9));
    }

    #[test]
    fn record_rows_without_open_span_is_noop() {
        let state = ShadowState::new("select 1".into());
        assert!(!state.has_open_span());
        state.record_rows(10);
        assert!(!state.has_open_span());
    }
}
