use std::time::Duration;
use tokio::time::Instant;

/// Minimum-interval gate: admits a call only if `interval` has passed since
/// the last admitted one. Rejected calls are dropped, never queued.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_admitted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn try_admit(&mut self, now: Instant) -> bool {
        match self.last_admitted {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_admitted = Some(now);
                true
            }
        }
    }
}
