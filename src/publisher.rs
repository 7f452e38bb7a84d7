use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::meter_frame::{MeterFrame, Phase};
use crate::reader::DeviceReader;
use crate::snapshot::{MetricValue, SharedState};
use crate::subscribers::SubscriberRegistry;
use crate::throttle::RateLimiter;

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Dropped by the rate limiter
    Throttled,
    /// Admitted; `written` keys were changed and had a live subscriber
    Published { written: Vec<String> },
}

/// Pushes realtime meter values straight into shared state, throttled
pub struct ThrottledPublisher {
    reader: Arc<dyn DeviceReader>,
    state: SharedState,
    registry: Arc<SubscriberRegistry>,
    limiter: Mutex<RateLimiter>,
}

impl ThrottledPublisher {
    pub fn new(
        reader: Arc<dyn DeviceReader>,
        state: SharedState,
        registry: Arc<SubscriberRegistry>,
        min_interval: Duration,
    ) -> Self {
        Self {
            reader,
            state,
            registry,
            limiter: Mutex::new(RateLimiter::new(min_interval)),
        }
    }

    pub fn on_frame(&self, frame: &MeterFrame) -> PublishOutcome {
        self.on_frame_at(frame, Instant::now())
    }

    pub fn on_frame_at(&self, frame: &MeterFrame, now: Instant) -> PublishOutcome {
        let admitted = self
            .limiter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_admit(now);
        if !admitted {
            return PublishOutcome::Throttled;
        }

        let mut written = Vec::new();
        for (key, value) in self.derive_metrics(frame) {
            let Some(subscriber) = self.registry.get(&key) else {
                continue;
            };
            if !self.state.set_if_changed(&key, value.clone()) {
                continue;
            }
            if let Err(e) = subscriber.notify(&key, &value) {
                warn!("Failed to notify subscriber for {}: {}", key, e);
            }
            written.push(key);
        }

        if !written.is_empty() {
            debug!("Realtime update wrote {} values", written.len());
        }
        PublishOutcome::Published { written }
    }

    /// Flattens a frame into `(key, value)` pairs, one group per phase
    pub fn derive_metrics(&self, frame: &MeterFrame) -> Vec<(String, MetricValue)> {
        let mut metrics = Vec::with_capacity(frame.production.len() * 8);
        for (phase, production) in &frame.production {
            let suffix = phase.suffix();
            let production_watts = self.reader.adjust_production_value(production.watts);
            let mut push = |name: &str, value: f64| {
                metrics.push((format!("{name}_{suffix}"), MetricValue::Number(value)));
            };
            push("production", production_watts);
            push("voltage", production.volts);
            push("ampere", production.amps);
            push("apparent_power", production.apparent_power);
            push("power_factor", production.power_factor);
            push("reactive_power", production.reactive_power);
            push("frequency", production.frequency);
            if let Some(consumption) = frame.consumption.get(phase) {
                push("consumption", consumption.watts);
            }
        }
        metrics
    }
}

/// Every key [`ThrottledPublisher`] may write for a three-phase meter
pub fn realtime_keys() -> Vec<String> {
    const NAMES: [&str; 8] = [
        "production",
        "voltage",
        "ampere",
        "apparent_power",
        "power_factor",
        "reactive_power",
        "frequency",
        "consumption",
    ];
    Phase::ALL
        .iter()
        .flat_map(|phase| NAMES.iter().map(move |name| format!("{name}_{}", phase.suffix())))
        .collect()
}
