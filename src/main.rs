use envoy_monitor::envoy_reader::SNAPSHOT_KEYS;
use envoy_monitor::publisher::realtime_keys;
use envoy_monitor::{
    ChannelSubscriber, EnvoyConfig, EnvoyEntry, EnvoyReader, HostState, JsonFileTokenStore,
    Subscriber, SubscriberRegistry,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting Envoy monitor");
    let config = EnvoyConfig::from_env()?;
    let (host_tx, host_rx) = watch::channel(HostState::Starting);

    let reader = Arc::new(EnvoyReader::new(&config)?);
    let store = Arc::new(JsonFileTokenStore::new(&config.storage_dir, &config.entry_id));

    // Log every value change; stands in for the dashboard entities
    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let subscriber: Arc<dyn Subscriber> = Arc::new(ChannelSubscriber::new(update_tx));
    let registry = Arc::new(SubscriberRegistry::new());
    for key in SNAPSHOT_KEYS {
        registry.register(key, subscriber.clone());
    }
    if config.enable_realtime_updates {
        for key in realtime_keys() {
            registry.register(key, subscriber.clone());
        }
    }
    tokio::spawn(async move {
        while let Some((key, value)) = update_rx.recv().await {
            info!("{key} = {value}");
        }
    });

    let mut entry = EnvoyEntry::start(&config, reader, store, registry, host_rx).await?;
    host_tx.send_replace(HostState::Running);
    info!(
        "Envoy {} ({}) is up",
        entry.name(),
        entry.unique_id().as_deref().unwrap_or("unknown serial")
    );

    tokio::signal::ctrl_c().await?;
    host_tx.send_replace(HostState::Stopping);
    entry.stop().await;

    Ok(())
}
