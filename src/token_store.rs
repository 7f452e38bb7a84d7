use anyhow::Context;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const STORAGE_KEY: &str = "envoy";
const STORAGE_VERSION: u32 = 1;

/// Session credentials the reader needs to talk to the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    /// Unix timestamp (seconds) after which the token is no longer accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl TokenRecord {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now_unix)
    }
}

/// Durable persistence for the reader's auth session
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns `Ok(None)` when nothing was stored yet
    async fn load(&self) -> anyhow::Result<Option<TokenRecord>>;
    async fn save(&self, record: &TokenRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    version: u32,
    key: String,
    data: TokenRecord,
}

/// Stores the token record as a versioned JSON document, one file per entry
#[derive(Debug, Clone)]
pub struct JsonFileTokenStore {
    key: String,
    path: PathBuf,
}

impl JsonFileTokenStore {
    pub fn new(storage_dir: impl AsRef<Path>, entry_id: &str) -> Self {
        let key = format!("{STORAGE_KEY}.{entry_id}");
        let path = storage_dir.as_ref().join(&key);
        Self { key, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging file for atomic saves, unique per entry within the storage dir
    fn tmp_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.tmp", self.key))
    }
}

#[async_trait]
impl TokenStore for JsonFileTokenStore {
    async fn load(&self) -> anyhow::Result<Option<TokenRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let envelope: StoredEnvelope = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if envelope.version != STORAGE_VERSION {
            anyhow::bail!(
                "unsupported token store version {} in {}",
                envelope.version,
                self.path.display()
            );
        }
        Ok(Some(envelope.data))
    }

    async fn save(&self, record: &TokenRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let envelope = StoredEnvelope {
            version: STORAGE_VERSION,
            key: self.key.clone(),
            data: record.clone(),
        };
        let body = serde_json::to_string_pretty(&envelope)?;

        // Write then rename so a crash never leaves a truncated file behind
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
