use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_GETDATA_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REALTIME_UPDATE_THROTTLE: Duration = Duration::from_secs(1);
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Runtime configuration for one monitored Envoy gateway
#[derive(Debug, Clone, PartialEq)]
pub struct EnvoyConfig {
    pub host: String,
    pub name: String,
    pub token: String,
    pub serial: Option<String>,
    pub entry_id: String,
    pub storage_dir: PathBuf,
    pub time_between_update: Duration,
    pub getdata_timeout: Duration,
    pub enable_realtime_updates: bool,
    pub realtime_update_throttle: Duration,
    pub disable_negative_production: bool,
    pub disable_installer_account_use: bool,
}

impl EnvoyConfig {
    /// Builds a config with defaults for everything except the device host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: normalize_host(&host.into()),
            name: "Envoy".to_string(),
            token: String::new(),
            serial: None,
            entry_id: "default".to_string(),
            storage_dir: PathBuf::from(".storage"),
            time_between_update: DEFAULT_SCAN_INTERVAL,
            getdata_timeout: DEFAULT_GETDATA_TIMEOUT,
            enable_realtime_updates: false,
            realtime_update_throttle: DEFAULT_REALTIME_UPDATE_THROTTLE,
            disable_negative_production: false,
            disable_installer_account_use: false,
        }
    }

    /// Reads the configuration from `ENVOY_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("ENVOY_HOST").unwrap_or_default();
        if host.trim().is_empty() {
            anyhow::bail!("ENVOY_HOST is required");
        }

        let mut config = Self::new(host.trim());
        if let Some(name) = non_empty(lookup("ENVOY_NAME")) {
            config.name = name;
        }
        config.token = lookup("ENVOY_TOKEN").unwrap_or_default();
        config.serial = non_empty(lookup("ENVOY_SERIAL"));
        if let Some(entry_id) = non_empty(lookup("ENVOY_ENTRY_ID")) {
            config.entry_id = entry_id;
        }
        if let Some(dir) = non_empty(lookup("ENVOY_STORAGE_DIR")) {
            config.storage_dir = PathBuf::from(dir);
        }
        config.time_between_update = parse_duration_or(
            "ENVOY_TIME_BETWEEN_UPDATE",
            lookup("ENVOY_TIME_BETWEEN_UPDATE"),
            DEFAULT_SCAN_INTERVAL,
        );
        config.getdata_timeout = parse_duration_or(
            "ENVOY_GETDATA_TIMEOUT",
            lookup("ENVOY_GETDATA_TIMEOUT"),
            DEFAULT_GETDATA_TIMEOUT,
        );
        config.enable_realtime_updates = parse_bool_safe(lookup("ENVOY_REALTIME_UPDATES"));
        config.realtime_update_throttle = parse_duration_or(
            "ENVOY_REALTIME_UPDATE_THROTTLE",
            lookup("ENVOY_REALTIME_UPDATE_THROTTLE"),
            DEFAULT_REALTIME_UPDATE_THROTTLE,
        );
        config.disable_negative_production =
            parse_bool_safe(lookup("ENVOY_DISABLE_NEGATIVE_PRODUCTION"));
        config.disable_installer_account_use =
            parse_bool_safe(lookup("ENVOY_DISABLE_INSTALLER_ACCOUNT_USE"));

        Ok(config)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn non_empty(val: Option<String>) -> Option<String> {
    val.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Safely parses a boolean from an optional string, defaulting to false
pub fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

/// Shortest accepted interval, timeout or throttle
const MIN_DURATION: Duration = Duration::from_millis(1);

/// Parses a (possibly fractional) number of seconds, falling back on anything unusable
fn parse_duration_or(name: &str, val: Option<String>, default: Duration) -> Duration {
    let Some(raw) = non_empty(val) else {
        return default;
    };
    let parsed = raw
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    match parsed {
        Some(duration) if duration >= MIN_DURATION => duration,
        _ => {
            warn!("Ignoring invalid {name} value '{raw}', using {default:?}");
            default
        }
    }
}
