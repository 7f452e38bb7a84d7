use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::UpdateError;
use crate::reader::DeviceReader;
use crate::snapshot::{SharedState, Snapshot};
use crate::subscribers::SubscriberRegistry;
use crate::token_store::TokenStore;

/// Drives the fixed-interval snapshot refresh
pub struct PollCoordinator {
    name: String,
    reader: Arc<dyn DeviceReader>,
    store: Arc<dyn TokenStore>,
    state: SharedState,
    registry: Arc<SubscriberRegistry>,
    update_interval: Duration,
    update_timeout: Duration,
    last_update_success: AtomicBool,
    reauth_required: AtomicBool,
    first_attempt: OnceLock<Instant>,
    unique_id: Mutex<Option<String>>,
    unique_id_looked_up: AtomicBool,
}

impl PollCoordinator {
    pub fn new(
        name: impl Into<String>,
        reader: Arc<dyn DeviceReader>,
        store: Arc<dyn TokenStore>,
        state: SharedState,
        registry: Arc<SubscriberRegistry>,
        update_interval: Duration,
        update_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            store,
            state,
            registry,
            update_interval,
            update_timeout,
            last_update_success: AtomicBool::new(false),
            reauth_required: AtomicBool::new(false),
            first_attempt: OnceLock::new(),
            unique_id: Mutex::new(None),
            unique_id_looked_up: AtomicBool::new(false),
        }
    }

    /// Seeds a known device identifier; the device is then never asked for one
    pub fn with_unique_id(self, unique_id: Option<String>) -> Self {
        if unique_id.is_some() {
            self.unique_id_looked_up.store(true, Ordering::Relaxed);
        }
        *self.unique_id.lock().unwrap_or_else(|p| p.into_inner()) = unique_id;
        self
    }

    /// The device's stable identifier, once known
    pub fn unique_id(&self) -> Option<String> {
        self.unique_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::Relaxed)
    }

    /// Set once the device rejected our credentials; cleared by the next success
    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::Relaxed)
    }

    /// Restores the reader's auth session from the token store
    pub async fn load_tokens(&self) {
        match self.store.load().await {
            Ok(Some(record)) => {
                debug!("Restored stored Envoy token for {}", self.name);
                self.reader.restore_tokens(record);
            }
            Ok(None) => debug!("No stored Envoy token for {}", self.name),
            Err(e) => warn!("Failed to load stored Envoy token for {}: {:#}", self.name, e),
        }
    }

    async fn persist_tokens(&self) {
        let Some(record) = self.reader.token_record() else {
            return;
        };
        if let Err(e) = self.store.save(&record).await {
            warn!("Failed to save Envoy token for {}: {:#}", self.name, e);
        }
    }

    /// Runs one poll cycle.
    ///
    /// The visible snapshot is only replaced on success. The token store is
    /// written after every attempt, whatever the outcome.
    pub async fn refresh(&self) -> Result<Snapshot, UpdateError> {
        self.first_attempt.get_or_init(Instant::now);
        let outcome = timeout(self.update_timeout, self.reader.fetch_snapshot()).await;

        let snapshot = match outcome {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                self.persist_tokens().await;
                return Err(self.record_failure(e.into()));
            }
            Err(_) => {
                self.persist_tokens().await;
                return Err(self.record_failure(UpdateError::Timeout(self.update_timeout)));
            }
        };

        self.state.replace_snapshot(snapshot.clone());
        self.last_update_success.store(true, Ordering::Relaxed);
        self.reauth_required.store(false, Ordering::Relaxed);
        self.persist_tokens().await;
        self.lookup_unique_id_once().await;

        let failures = self.registry.notify_all(&self.state);
        if failures > 0 {
            warn!("{} subscriber notifications failed for {}", failures, self.name);
        }
        debug!("Finished fetching envoy {} data ({} values)", self.name, snapshot.len());
        Ok(snapshot)
    }

    /// Best-effort serial lookup after the first successful poll
    async fn lookup_unique_id_once(&self) {
        if self.unique_id_looked_up.swap(true, Ordering::Relaxed) {
            return;
        }
        match self.reader.fetch_stable_id().await {
            Ok(serial) => {
                debug!("Envoy {} reports serial {}", self.name, serial);
                *self.unique_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(serial);
            }
            Err(e) => debug!("Could not read serial number of {}: {}", self.name, e),
        }
    }

    fn record_failure(&self, err: UpdateError) -> UpdateError {
        self.last_update_success.store(false, Ordering::Relaxed);
        if err.is_auth_failure() {
            self.reauth_required.store(true, Ordering::Relaxed);
        }
        err
    }

    /// Startup refresh. An auth failure here is assumed to come from the
    /// installer-level data path: it is disabled and the refresh retried once.
    /// A second auth failure is returned as is.
    pub async fn first_refresh(&self) -> Result<Snapshot, UpdateError> {
        match self.refresh().await {
            Err(UpdateError::AuthFailed(reason)) => {
                warn!(
                    "Authentication failed for {} ({}), retrying without installer data",
                    self.name, reason
                );
                self.reader.set_elevated_access(false);
                self.refresh().await
            }
            other => other,
        }
    }

    /// Periodic refresh loop.
    ///
    /// Ticks are anchored at the start of the first refresh, so a slow or
    /// timed-out startup poll does not push the schedule back. Returns on
    /// the first auth failure; polling resumes only with a new coordinator.
    pub async fn run(self: Arc<Self>) {
        let anchor = self.first_attempt.get().copied().unwrap_or_else(Instant::now);
        let mut ticker = interval_at(anchor + self.update_interval, self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.refresh().await {
                Ok(_) => {}
                Err(e @ UpdateError::AuthFailed(_)) => {
                    error!("{}: {}, polling stopped until re-authenticated", self.name, e);
                    return;
                }
                Err(e) => {
                    info!("Update of {} failed: {}", self.name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReaderError;
    use crate::snapshot::MetricValue;
    use crate::subscribers::ChannelSubscriber;
    use crate::test_support::{snapshot, MemoryTokenStore, MockFetch, MockReader};
    use crate::token_store::TokenRecord;
    use tokio::sync::mpsc;
    use tokio::time::sleep_until;

    struct Fixture {
        coordinator: Arc<PollCoordinator>,
        reader: Arc<MockReader>,
        store: Arc<MemoryTokenStore>,
        state: SharedState,
        registry: Arc<SubscriberRegistry>,
    }

    fn fixture(reader: MockReader, store: MemoryTokenStore) -> Fixture {
        let reader = Arc::new(reader);
        reader.restore_tokens(TokenRecord {
            token: "session".into(),
            expires_at: None,
        });
        let store = Arc::new(store);
        let state = SharedState::new();
        let registry = Arc::new(SubscriberRegistry::new());
        let coordinator = Arc::new(PollCoordinator::new(
            "test",
            reader.clone(),
            store.clone(),
            state.clone(),
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(15),
        ));
        Fixture {
            coordinator,
            reader,
            store,
            state,
            registry,
        }
    }

    fn auth_error() -> MockFetch {
        MockFetch::Err(ReaderError::Auth("401 Unauthorized".into()))
    }

    #[tokio::test]
    async fn test_successful_refresh_replaces_snapshot() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Ok(snapshot(&[("production", 900.0)]))),
            MemoryTokenStore::default(),
        );

        let result = f.coordinator.refresh().await.unwrap();

        assert_eq!(result["production"], MetricValue::Number(900.0));
        assert_eq!(f.state.get("production"), Some(MetricValue::Number(900.0)));
        assert!(f.coordinator.last_update_success());
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_keep_previous_snapshot() {
        let f = fixture(
            MockReader::new()
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 900.0)])))
                .with_fetch(MockFetch::Err(ReaderError::Transport("reset".into())))
                .with_fetch(auth_error())
                .with_fetch(MockFetch::Err(ReaderError::Decode("garbage".into()))),
            MemoryTokenStore::default(),
        );

        f.coordinator.refresh().await.unwrap();
        let before = f.state.view();

        assert!(matches!(
            f.coordinator.refresh().await,
            Err(UpdateError::Unavailable(_))
        ));
        assert!(matches!(
            f.coordinator.refresh().await,
            Err(UpdateError::AuthFailed(_))
        ));
        assert!(f.coordinator.reauth_required());
        assert!(f.coordinator.refresh().await.is_err());

        assert_eq!(f.state.view(), before);
        assert!(!f.coordinator.last_update_success());
        // One save per attempt, success or not
        assert_eq!(f.store.save_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Delay(
                Duration::from_secs(20),
                snapshot(&[("production", 1.0)]),
            )),
            MemoryTokenStore::default(),
        );

        let started = Instant::now();
        let result = f.coordinator.refresh().await;

        assert_eq!(result, Err(UpdateError::Timeout(Duration::from_secs(15))));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
        assert!(f.state.is_empty());
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_first_refresh_downgrades_once_on_auth_failure() {
        let f = fixture(
            MockReader::new()
                .with_fetch(auth_error())
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 5.0)]))),
            MemoryTokenStore::default(),
        );

        let result = f.coordinator.first_refresh().await;

        assert!(result.is_ok());
        assert_eq!(f.reader.fetches(), 2);
        assert_eq!(*f.reader.elevation_per_fetch.lock().unwrap(), vec![true, false]);
        assert!(!f.reader.elevated_access());
        assert!(!f.coordinator.reauth_required());
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_not_retried() {
        let f = fixture(
            MockReader::new()
                .with_fetch(auth_error())
                .with_fetch(auth_error())
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 5.0)]))),
            MemoryTokenStore::default(),
        );

        let result = f.coordinator.first_refresh().await;

        assert!(matches!(result, Err(UpdateError::AuthFailed(_))));
        assert_eq!(f.reader.fetches(), 2);
        assert!(f.coordinator.reauth_required());
        assert!(f.state.is_empty());
    }

    #[tokio::test]
    async fn test_first_refresh_transport_failure_is_not_retried() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Err(ReaderError::Transport("down".into()))),
            MemoryTokenStore::default(),
        );

        assert!(f.coordinator.first_refresh().await.is_err());
        assert_eq!(f.reader.fetches(), 1);
        assert!(f.reader.elevated_access());
    }

    #[tokio::test]
    async fn test_store_failures_never_abort_a_poll() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Ok(snapshot(&[("production", 5.0)]))),
            MemoryTokenStore::failing(),
        );

        f.coordinator.load_tokens().await;
        assert!(f.coordinator.refresh().await.is_ok());
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_load_tokens_restores_reader_session() {
        let stored = TokenRecord {
            token: "persisted".into(),
            expires_at: Some(2_000_000_000),
        };
        let f = fixture(MockReader::new(), MemoryTokenStore::with_record(stored.clone()));

        f.coordinator.load_tokens().await;

        assert_eq!(f.reader.token_record(), Some(stored));
    }

    #[tokio::test]
    async fn test_subscribers_notified_after_refresh() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Ok(snapshot(&[("production", 5.0)]))),
            MemoryTokenStore::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.registry
            .register("production", Arc::new(ChannelSubscriber::new(tx)));

        f.coordinator.refresh().await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ("production".to_string(), 5.0.into()));
    }

    #[tokio::test]
    async fn test_failed_notification_still_persists_tokens() {
        let f = fixture(
            MockReader::new().with_fetch(MockFetch::Ok(snapshot(&[("production", 5.0)]))),
            MemoryTokenStore::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        f.registry
            .register("production", Arc::new(ChannelSubscriber::new(tx)));

        assert!(f.coordinator.refresh().await.is_ok());
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval_after_timeout() {
        let f = fixture(
            MockReader::new()
                .with_fetch(MockFetch::Delay(
                    Duration::from_secs(30),
                    snapshot(&[("production", 1.0)]),
                ))
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 2.0)]))),
            MemoryTokenStore::default(),
        );

        let start = Instant::now();
        assert!(matches!(
            f.coordinator.refresh().await,
            Err(UpdateError::Timeout(_))
        ));
        assert!(f.state.is_empty());

        let task = tokio::spawn(f.coordinator.clone().run());

        // Scheduled from when the first poll began, not when it gave up
        sleep_until(start + Duration::from_secs(59)).await;
        assert_eq!(f.reader.fetches(), 1);

        sleep_until(start + Duration::from_secs(61)).await;
        assert_eq!(f.reader.fetches(), 2);
        assert_eq!(f.state.get("production"), Some(MetricValue::Number(2.0)));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_polling_after_auth_failure() {
        let f = fixture(
            MockReader::new()
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 1.0)])))
                .with_fetch(auth_error())
                .with_fetch(auth_error())
                .with_fetch(auth_error())
                .with_fetch(auth_error()),
            MemoryTokenStore::default(),
        );

        let start = Instant::now();
        f.coordinator.first_refresh().await.unwrap();
        let task = tokio::spawn(f.coordinator.clone().run());

        sleep_until(start + Duration::from_secs(241)).await;

        assert_eq!(f.reader.fetches(), 2);
        assert!(f.coordinator.reauth_required());
        assert!(!f.coordinator.last_update_success());
        assert_eq!(f.state.get("production"), Some(MetricValue::Number(1.0)));
        assert!(task.is_finished());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_id_looked_up_once_after_first_success() {
        let f = fixture(
            MockReader::new()
                .with_fetch(MockFetch::Err(ReaderError::Transport("refused".into())))
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 1.0)])))
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 2.0)])))
                .with_stable_id(Ok("122100000007".into())),
            MemoryTokenStore::default(),
        );

        assert!(f.coordinator.refresh().await.is_err());
        assert_eq!(f.reader.stable_id_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.coordinator.unique_id(), None);

        f.coordinator.refresh().await.unwrap();
        f.coordinator.refresh().await.unwrap();

        assert_eq!(f.reader.stable_id_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.coordinator.unique_id().as_deref(), Some("122100000007"));
    }

    #[tokio::test]
    async fn test_failed_unique_id_lookup_is_not_repeated() {
        let f = fixture(
            MockReader::new()
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 1.0)])))
                .with_fetch(MockFetch::Ok(snapshot(&[("production", 2.0)]))),
            MemoryTokenStore::default(),
        );

        f.coordinator.refresh().await.unwrap();
        f.coordinator.refresh().await.unwrap();

        assert_eq!(f.reader.stable_id_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.coordinator.unique_id(), None);
    }
}
