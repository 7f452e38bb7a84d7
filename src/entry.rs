use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EnvoyConfig, STREAM_RECONNECT_DELAY};
use crate::coordinator::PollCoordinator;
use crate::error::{EntryError, UpdateError};
use crate::publisher::ThrottledPublisher;
use crate::reader::DeviceReader;
use crate::snapshot::SharedState;
use crate::subscribers::SubscriberRegistry;
use crate::supervisor::{HostState, StreamState, StreamSupervisor};
use crate::token_store::TokenStore;

/// One configured Envoy: owns the poll loop, the realtime stream and their shared state
pub struct EnvoyEntry {
    name: String,
    state: SharedState,
    registry: Arc<SubscriberRegistry>,
    coordinator: Arc<PollCoordinator>,
    poll_task: Option<JoinHandle<()>>,
    stream: Option<StreamSupervisor>,
}

impl EnvoyEntry {
    /// Restores tokens, polls once, then starts the background tasks.
    ///
    /// Fails only when the device keeps rejecting our credentials after
    /// falling back to non-installer data. Any other first-poll failure is
    /// logged and left to the regular schedule.
    pub async fn start(
        config: &EnvoyConfig,
        reader: Arc<dyn DeviceReader>,
        store: Arc<dyn TokenStore>,
        registry: Arc<SubscriberRegistry>,
        host: watch::Receiver<HostState>,
    ) -> Result<Self, EntryError> {
        Self::start_with_reconnect_delay(
            config,
            reader,
            store,
            registry,
            host,
            STREAM_RECONNECT_DELAY,
        )
        .await
    }

    pub(crate) async fn start_with_reconnect_delay(
        config: &EnvoyConfig,
        reader: Arc<dyn DeviceReader>,
        store: Arc<dyn TokenStore>,
        registry: Arc<SubscriberRegistry>,
        host: watch::Receiver<HostState>,
        reconnect_delay: Duration,
    ) -> Result<Self, EntryError> {
        info!("Setting up Envoy {} at {}", config.name, config.host);
        let state = SharedState::new();
        let coordinator = PollCoordinator::new(
            format!("envoy {}", config.name),
            reader.clone(),
            store,
            state.clone(),
            registry.clone(),
            config.time_between_update,
            config.getdata_timeout,
        )
        .with_unique_id(config.serial.clone());
        let coordinator = Arc::new(coordinator);

        coordinator.load_tokens().await;
        match coordinator.first_refresh().await {
            Ok(_) => {}
            Err(e @ UpdateError::AuthFailed(_)) => return Err(EntryError::ReauthRequired(e)),
            Err(e) => warn!("Initial update of {} failed, will retry: {}", config.name, e),
        }

        let poll_task = tokio::spawn(coordinator.clone().run());

        let stream = if config.enable_realtime_updates {
            let publisher = Arc::new(ThrottledPublisher::new(
                reader.clone(),
                state.clone(),
                registry.clone(),
                config.realtime_update_throttle,
            ));
            Some(StreamSupervisor::spawn(
                reader,
                publisher,
                host,
                reconnect_delay,
            ))
        } else {
            None
        };

        Ok(Self {
            name: config.name.clone(),
            state,
            registry,
            coordinator,
            poll_task: Some(poll_task),
            stream,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured serial, or the one read after the first successful poll
    pub fn unique_id(&self) -> Option<String> {
        self.coordinator.unique_id()
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<PollCoordinator> {
        &self.coordinator
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.stream.as_ref().map(StreamSupervisor::state)
    }

    /// Cancels both background tasks and waits for them. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.stop().await;
        }
        if let Some(handle) = self.poll_task.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Poll task for {} failed: {}", self.name, e);
                }
            }
            info!("Stopped Envoy {}", self.name);
        }
    }
}

impl Drop for EnvoyEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_task.take() {
            handle.abort();
        }
    }
}
