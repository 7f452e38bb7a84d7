//! Envoy Monitor Library
//!
//! Keeps a snapshot of an Enphase Envoy's telemetry up to date by polling it on a
//! fixed interval, and optionally layers sub-second per-phase meter readings from
//! the device's realtime stream on top of that snapshot.

pub mod config;
pub mod coordinator;
pub mod entry;
pub mod envoy_reader;
pub mod error;
pub mod meter_frame;
pub mod publisher;
pub mod reader;
pub mod snapshot;
pub mod subscribers;
pub mod supervisor;
pub mod throttle;
pub mod token_store;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for easier access
pub use config::EnvoyConfig;
pub use coordinator::PollCoordinator;
pub use entry::EnvoyEntry;
pub use envoy_reader::EnvoyReader;
pub use error::{EntryError, ReaderError, UpdateError};
pub use meter_frame::{MeterFrame, Phase, PhaseReading};
pub use publisher::ThrottledPublisher;
pub use reader::DeviceReader;
pub use snapshot::{MetricValue, SharedState, Snapshot};
pub use subscribers::{ChannelSubscriber, Subscriber, SubscriberRegistry};
pub use supervisor::{HostState, StreamState, StreamSupervisor};
pub use token_store::{JsonFileTokenStore, TokenRecord, TokenStore};
