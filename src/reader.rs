use async_trait::async_trait;

use crate::error::ReaderError;
use crate::meter_frame::MeterFrame;
use crate::snapshot::Snapshot;
use crate::token_store::TokenRecord;

/// Everything the update engine needs from the device connection
#[async_trait]
pub trait DeviceReader: Send + Sync {
    /// Fetches a complete snapshot of all polled metrics
    async fn fetch_snapshot(&self) -> Result<Snapshot, ReaderError>;

    /// Opens the realtime meter stream and feeds every frame to `on_frame`.
    ///
    /// Resolves with `Ok(())` when the device closes the stream, and with
    /// [`ReaderError::StreamTerminal`] when reconnecting is pointless.
    async fn open_stream(
        &self,
        on_frame: &(dyn Fn(MeterFrame) + Send + Sync),
    ) -> Result<(), ReaderError>;

    /// Applies the configured production policy to a raw watts value
    fn adjust_production_value(&self, raw: f64) -> f64;

    /// Fetches the device's stable identifier (its serial number)
    async fn fetch_stable_id(&self) -> Result<String, ReaderError>;

    /// Enables or disables the installer-level detail retrieval
    fn set_elevated_access(&self, enabled: bool);

    fn elevated_access(&self) -> bool;

    fn token_record(&self) -> Option<TokenRecord>;

    fn restore_tokens(&self, record: TokenRecord);
}
