use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::snapshot::{MetricValue, SharedState};

/// A live consumer of one metric, told to re-render when its value changes
pub trait Subscriber: Send + Sync {
    fn notify(&self, key: &str, value: &MetricValue) -> anyhow::Result<()>;
}

/// Forwards every notification into an mpsc channel
pub struct ChannelSubscriber {
    sender: UnboundedSender<(String, MetricValue)>,
}

impl ChannelSubscriber {
    pub fn new(sender: UnboundedSender<(String, MetricValue)>) -> Self {
        Self { sender }
    }
}

impl Subscriber for ChannelSubscriber {
    fn notify(&self, key: &str, value: &MetricValue) -> anyhow::Result<()> {
        self.sender
            .send((key.to_string(), value.clone()))
            .map_err(|_| anyhow::anyhow!("receiver for {key} has gone away"))
    }
}

/// Metric key to live subscriber handle
#[derive(Default)]
pub struct SubscriberRegistry {
    live: RwLock<HashMap<String, Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        self.live
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.into(), subscriber);
    }

    pub fn deregister(&self, key: &str) -> bool {
        self.live
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Subscriber>> {
        self.live
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.live
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies every subscriber whose key has a value in `state`.
    /// Failures are logged per key; returns how many notifications failed.
    pub fn notify_all(&self, state: &SharedState) -> usize {
        // Clone the handles so no lock is held while subscribers run
        let live: Vec<_> = self
            .live
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut failures = 0;
        for (key, subscriber) in live {
            let Some(value) = state.get(&key) else {
                continue;
            };
            if let Err(e) = subscriber.notify(&key, &value) {
                warn!("Failed to notify subscriber for {}: {}", key, e);
                failures += 1;
            }
        }
        failures
    }
}
