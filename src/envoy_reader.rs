use async_trait::async_trait;
use serde_derive::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::EnvoyConfig;
use crate::error::ReaderError;
use crate::meter_frame::{MeterFrame, StreamLines};
use crate::reader::DeviceReader;
use crate::snapshot::{MetricValue, Snapshot};
use crate::token_store::TokenRecord;

/// Keys `fetch_snapshot` reports, besides the per-inverter `inverter_<serial>` ones
pub const SNAPSHOT_KEYS: [&str; 8] = [
    "production",
    "daily_production",
    "seven_days_production",
    "lifetime_production",
    "consumption",
    "daily_consumption",
    "seven_days_consumption",
    "lifetime_consumption",
];

/// HTTP client for the Envoy local API
pub struct EnvoyReader {
    endpoint_url: String,
    client: reqwest::Client,
    tokens: Mutex<Option<TokenRecord>>,
    get_inverters: AtomicBool,
    disable_negative_production: bool,
}

impl EnvoyReader {
    pub fn new(config: &EnvoyConfig) -> Result<Self, ReaderError> {
        // Envoys serve https with a self-signed certificate
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let tokens = if config.token.is_empty() {
            None
        } else {
            Some(TokenRecord {
                token: config.token.clone(),
                expires_at: None,
            })
        };
        Ok(Self {
            endpoint_url: config.host.clone(),
            client,
            tokens: Mutex::new(tokens),
            get_inverters: AtomicBool::new(!config.disable_installer_account_use),
            disable_negative_production: config.disable_negative_production,
        })
    }

    fn current_token(&self) -> Result<Option<String>, ReaderError> {
        let tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        match tokens.as_ref() {
            Some(record) if record.is_expired(unix_now()) => {
                Err(ReaderError::Auth("stored token has expired".to_string()))
            }
            Some(record) => Ok(Some(record.token.clone())),
            None => Ok(None),
        }
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder, ReaderError> {
        let request = self.client.get(format!("{}{}", self.endpoint_url, path));
        Ok(match self.current_token()? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ReaderError> {
        let result = self
            .get(path)?
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }

    async fn read_production(&self, snapshot: &mut Snapshot) -> Result<(), ReaderError> {
        let production: ProductionReport = self.get_json("/production.json").await?;

        // Metered (eim) readings are more accurate than the inverter sum when present
        let produced = production
            .production
            .iter()
            .find(|m| m.kind.as_deref() == Some("eim"))
            .or_else(|| production.production.first());
        if let Some(m) = produced {
            insert_number(
                snapshot,
                "production",
                m.w_now.map(|w| self.adjust_production_value(w)),
            );
            insert_number(snapshot, "daily_production", m.wh_today);
            insert_number(snapshot, "seven_days_production", m.wh_last_seven_days);
            insert_number(snapshot, "lifetime_production", m.wh_lifetime);
        }

        let consumed = production
            .consumption
            .iter()
            .find(|m| m.measurement_type.as_deref() == Some("total-consumption"));
        if let Some(m) = consumed {
            insert_number(snapshot, "consumption", m.w_now);
            insert_number(snapshot, "daily_consumption", m.wh_today);
            insert_number(snapshot, "seven_days_consumption", m.wh_last_seven_days);
            insert_number(snapshot, "lifetime_consumption", m.wh_lifetime);
        }
        Ok(())
    }

    async fn read_inverters(&self, snapshot: &mut Snapshot) -> Result<(), ReaderError> {
        let inverters: Vec<InverterReport> =
            self.get_json("/api/v1/production/inverters").await?;
        for inverter in inverters {
            snapshot.insert(
                format!("inverter_{}", inverter.serial_number),
                MetricValue::Number(inverter.last_report_watts),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceReader for EnvoyReader {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ReaderError> {
        let mut snapshot = Snapshot::new();
        self.read_production(&mut snapshot).await?;
        if self.elevated_access() {
            self.read_inverters(&mut snapshot).await?;
        }
        debug!("Envoy snapshot contains {} values", snapshot.len());
        Ok(snapshot)
    }

    async fn open_stream(
        &self,
        on_frame: &(dyn Fn(MeterFrame) + Send + Sync),
    ) -> Result<(), ReaderError> {
        let mut response = self.get("/stream/meter")?.send().await?;
        let status = response.status().as_u16();
        if matches!(status, 401 | 403 | 404) {
            return Err(ReaderError::StreamTerminal(format!(
                "/stream/meter answered with status {status}"
            )));
        }
        response = response.error_for_status()?;

        let mut lines = StreamLines::default();
        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                match MeterFrame::from_stream_line(&line) {
                    Some(Ok(frame)) => on_frame(frame),
                    Some(Err(e)) => warn!("Skipping meter frame: {}", e),
                    None => {}
                }
            }
        }
        debug!("/stream/meter closed by the device");
        Ok(())
    }

    fn adjust_production_value(&self, raw: f64) -> f64 {
        if self.disable_negative_production && raw < 0.0 {
            0.0
        } else {
            raw
        }
    }

    async fn fetch_stable_id(&self) -> Result<String, ReaderError> {
        let body = self
            .get("/info.xml")?
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        extract_serial(&body)
            .ok_or_else(|| ReaderError::Decode("no <sn> element in /info.xml".to_string()))
    }

    fn set_elevated_access(&self, enabled: bool) {
        self.get_inverters.store(enabled, Ordering::Relaxed);
    }

    fn elevated_access(&self) -> bool {
        self.get_inverters.load(Ordering::Relaxed)
    }

    fn token_record(&self) -> Option<TokenRecord> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn restore_tokens(&self, record: TokenRecord) {
        *self.tokens.lock().unwrap_or_else(|p| p.into_inner()) = Some(record);
    }
}

fn insert_number(snapshot: &mut Snapshot, key: &str, value: Option<f64>) {
    if let Some(value) = value {
        snapshot.insert(key.to_string(), MetricValue::Number(value));
    }
}

fn extract_serial(info_xml: &str) -> Option<String> {
    let start = info_xml.find("<sn>")? + "<sn>".len();
    let end = start + info_xml[start..].find("</sn>")?;
    let serial = info_xml[start..end].trim();
    (!serial.is_empty()).then(|| serial.to_string())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
struct ProductionReport {
    #[serde(default)]
    production: Vec<Measurement>,
    #[serde(default)]
    consumption: Vec<Measurement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Measurement {
    #[serde(rename = "type")]
    kind: Option<String>,
    measurement_type: Option<String>,
    w_now: Option<f64>,
    wh_today: Option<f64>,
    wh_last_seven_days: Option<f64>,
    wh_lifetime: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InverterReport {
    serial_number: String,
    last_report_watts: f64,
}
