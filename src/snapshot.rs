use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A single scalar telemetry value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

/// Complete point-in-time mapping of polled metrics
pub type Snapshot = HashMap<String, MetricValue>;

#[derive(Debug, Default)]
struct StateInner {
    snapshot: Snapshot,
    // Realtime writes made since the last snapshot replacement
    overrides: Snapshot,
}

impl StateInner {
    fn effective(&self, key: &str) -> Option<&MetricValue> {
        self.overrides.get(key).or_else(|| self.snapshot.get(key))
    }
}

/// Entry-wide telemetry state shared by the poll loop and the realtime stream.
///
/// Every access goes through one mutex. The poll path replaces the snapshot
/// wholesale; the realtime path writes individual keys as overrides. Whichever
/// writes a key last wins: replacing the snapshot drops overrides for every key
/// the new snapshot carries.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<StateInner>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // State is plain data, a panic mid-write cannot leave it torn
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn replace_snapshot(&self, snapshot: Snapshot) {
        let mut inner = self.lock();
        inner.overrides.retain(|key, _| !snapshot.contains_key(key));
        inner.snapshot = snapshot;
    }

    pub fn get(&self, key: &str) -> Option<MetricValue> {
        self.lock().effective(key).cloned()
    }

    /// Writes `value` for `key` unless it already holds an equal value.
    /// Returns whether a write happened.
    pub fn set_if_changed(&self, key: &str, value: MetricValue) -> bool {
        let mut inner = self.lock();
        if inner.effective(key) == Some(&value) {
            return false;
        }
        inner.overrides.insert(key.to_string(), value);
        true
    }

    /// Merged view of the last snapshot and any realtime writes since
    pub fn view(&self) -> Snapshot {
        let inner = self.lock();
        let mut view = inner.snapshot.clone();
        view.extend(inner.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        view
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.snapshot.is_empty() && inner.overrides.is_empty()
    }
}
