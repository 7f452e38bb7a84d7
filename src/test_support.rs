//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ReaderError;
use crate::meter_frame::MeterFrame;
use crate::reader::DeviceReader;
use crate::snapshot::Snapshot;
use crate::token_store::{TokenRecord, TokenStore};

pub enum MockFetch {
    Ok(Snapshot),
    Err(ReaderError),
    /// Sleeps before answering, to trip the poll timeout
    Delay(Duration, Snapshot),
}

pub struct MockStream {
    pub frames: Vec<MeterFrame>,
    pub end: Result<(), ReaderError>,
}

pub struct MockReader {
    fetches: Mutex<VecDeque<MockFetch>>,
    streams: Mutex<VecDeque<MockStream>>,
    stable_id: Mutex<Result<String, ReaderError>>,
    tokens: Mutex<Option<TokenRecord>>,
    elevated: AtomicBool,
    clamp_negative: bool,
    pub fetch_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub stable_id_calls: AtomicUsize,
    /// Elevated-access flag as seen by each fetch, in call order
    pub elevation_per_fetch: Mutex<Vec<bool>>,
}

impl MockReader {
    pub fn new() -> Self {
        Self {
            fetches: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            stable_id: Mutex::new(Err(ReaderError::Transport("no stable id".into()))),
            tokens: Mutex::new(None),
            elevated: AtomicBool::new(true),
            clamp_negative: false,
            fetch_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            stable_id_calls: AtomicUsize::new(0),
            elevation_per_fetch: Mutex::new(Vec::new()),
        }
    }

    pub fn clamp_negative_production(mut self) -> Self {
        self.clamp_negative = true;
        self
    }

    pub fn with_fetch(self, fetch: MockFetch) -> Self {
        self.fetches.lock().unwrap().push_back(fetch);
        self
    }

    pub fn with_stream(self, stream: MockStream) -> Self {
        self.streams.lock().unwrap().push_back(stream);
        self
    }

    pub fn with_stable_id(self, id: Result<String, ReaderError>) -> Self {
        *self.stable_id.lock().unwrap() = id;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

pub fn snapshot(pairs: &[(&str, f64)]) -> Snapshot {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), (*v).into()))
        .collect()
}

#[async_trait]
impl DeviceReader for MockReader {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ReaderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.elevation_per_fetch
            .lock()
            .unwrap()
            .push(self.elevated_access());
        let next = self.fetches.lock().unwrap().pop_front();
        match next {
            Some(MockFetch::Ok(snapshot)) => Ok(snapshot),
            Some(MockFetch::Err(e)) => Err(e),
            Some(MockFetch::Delay(delay, snapshot)) => {
                tokio::time::sleep(delay).await;
                Ok(snapshot)
            }
            None => Err(ReaderError::Transport("no scripted response".into())),
        }
    }

    async fn open_stream(
        &self,
        on_frame: &(dyn Fn(MeterFrame) + Send + Sync),
    ) -> Result<(), ReaderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => {
                for frame in stream.frames {
                    on_frame(frame);
                }
                stream.end
            }
            // Nothing scripted: behave like a quiet, open connection
            None => future::pending().await,
        }
    }

    fn adjust_production_value(&self, raw: f64) -> f64 {
        if self.clamp_negative && raw < 0.0 {
            0.0
        } else {
            raw
        }
    }

    async fn fetch_stable_id(&self) -> Result<String, ReaderError> {
        self.stable_id_calls.fetch_add(1, Ordering::SeqCst);
        self.stable_id.lock().unwrap().clone()
    }

    fn set_elevated_access(&self, enabled: bool) {
        self.elevated.store(enabled, Ordering::SeqCst);
    }

    fn elevated_access(&self) -> bool {
        self.elevated.load(Ordering::SeqCst)
    }

    fn token_record(&self) -> Option<TokenRecord> {
        self.tokens.lock().unwrap().clone()
    }

    fn restore_tokens(&self, record: TokenRecord) {
        *self.tokens.lock().unwrap() = Some(record);
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    pub record: Mutex<Option<TokenRecord>>,
    pub saves: AtomicUsize,
    pub fail: bool,
}

impl MemoryTokenStore {
    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> anyhow::Result<Option<TokenRecord>> {
        if self.fail {
            anyhow::bail!("disk on fire");
        }
        Ok(self.record.lock().unwrap().clone())
    }

    async fn save(&self, record: &TokenRecord) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("disk on fire");
        }
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }
}
