use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::ReaderError;
use crate::meter_frame::MeterFrame;
use crate::publisher::ThrottledPublisher;
use crate::reader::DeviceReader;

/// Lifecycle of the hosting process, as seen by background tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Disconnected,
    Stopped,
}

struct StreamTask {
    reader: Arc<dyn DeviceReader>,
    publisher: Arc<ThrottledPublisher>,
    host: watch::Receiver<HostState>,
    enabled: Arc<AtomicBool>,
    state: Arc<watch::Sender<StreamState>>,
    reconnect_delay: Duration,
}

/// Owns the background task reading `/stream/meter`
pub struct StreamSupervisor {
    handle: Option<JoinHandle<()>>,
    state: Arc<watch::Sender<StreamState>>,
    enabled: Arc<AtomicBool>,
}

impl StreamSupervisor {
    /// Spawns the stream task; it keeps reconnecting until stopped
    pub fn spawn(
        reader: Arc<dyn DeviceReader>,
        publisher: Arc<ThrottledPublisher>,
        host: watch::Receiver<HostState>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        let state = Arc::new(state);
        let enabled = Arc::new(AtomicBool::new(true));

        debug!("Starting loop for /stream/meter");
        let task = StreamTask {
            reader,
            publisher,
            host,
            enabled: enabled.clone(),
            state: state.clone(),
            reconnect_delay,
        };
        let handle = tokio::spawn(task.run());

        Self {
            handle: Some(handle),
            state,
            enabled,
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Disabling takes effect at the next reconnect decision
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancels the task and waits for it to unwind. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Stopping loop for /stream/meter");
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("Realtime stream task failed: {}", e),
            }
        }
        self.state.send_replace(StreamState::Stopped);
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn should_stream(host: HostState, enabled: bool) -> bool {
    match host {
        HostState::NotRunning | HostState::Starting => true,
        HostState::Running => enabled,
        HostState::Stopping => false,
    }
}

/// Resolves once the host starts stopping; never resolves if the host signal is gone
async fn host_stopping(host: &mut watch::Receiver<HostState>) {
    if host
        .wait_for(|state| *state == HostState::Stopping)
        .await
        .is_err()
    {
        future::pending::<()>().await;
    }
}

impl StreamTask {
    async fn run(mut self) {
        loop {
            let host_state = *self.host.borrow();
            if !should_stream(host_state, self.enabled.load(Ordering::Relaxed)) {
                debug!("Realtime updates no longer wanted (host {:?})", host_state);
                break;
            }

            self.state.send_replace(StreamState::Connecting);
            let state = &self.state;
            let publisher = &self.publisher;
            let on_frame = move |frame: MeterFrame| {
                state.send_if_modified(|s| {
                    let changed = *s != StreamState::Streaming;
                    *s = StreamState::Streaming;
                    changed
                });
                publisher.on_frame(&frame);
            };

            let result = tokio::select! {
                result = self.reader.open_stream(&on_frame) => result,
                _ = host_stopping(&mut self.host) => break,
            };
            match result {
                Err(ReaderError::StreamTerminal(reason)) => {
                    warn!(
                        "Reading /stream/meter failed, stopping realtime updates: {}",
                        reason
                    );
                    break;
                }
                Ok(()) => warn!("Re-connecting /stream/meter"),
                Err(e) => warn!("Re-connecting /stream/meter after error: {}", e),
            }

            self.state.send_replace(StreamState::Disconnected);
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = host_stopping(&mut self.host) => break,
            }
        }
        self.state.send_replace(StreamState::Stopped);
    }
}
