use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::ReaderError;

/// Longest meter stream line kept, in bytes
pub const MAX_STREAM_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "ph-a")]
    L1,
    #[serde(rename = "ph-b")]
    L2,
    #[serde(rename = "ph-c")]
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// Suffix used in metric keys, e.g. `voltage_l1`
    pub fn suffix(self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }
}

/// Instantaneous reading of one phase as reported by `/stream/meter`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReading {
    #[serde(rename = "p", default)]
    pub watts: f64,
    #[serde(rename = "q", default)]
    pub reactive_power: f64,
    #[serde(rename = "s", default)]
    pub apparent_power: f64,
    #[serde(rename = "v", default)]
    pub volts: f64,
    #[serde(rename = "i", default)]
    pub amps: f64,
    #[serde(rename = "pf", default)]
    pub power_factor: f64,
    #[serde(rename = "f", default)]
    pub frequency: f64,
}

/// One realtime reading of per-phase production and consumption
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterFrame {
    #[serde(default)]
    pub production: BTreeMap<Phase, PhaseReading>,
    #[serde(rename = "total-consumption", default)]
    pub consumption: BTreeMap<Phase, PhaseReading>,
}

impl MeterFrame {
    /// Decodes the JSON body of one stream event
    pub fn from_json(raw: &str) -> Result<Self, ReaderError> {
        serde_json::from_str(raw).map_err(|e| ReaderError::Decode(format!("meter frame: {e}")))
    }

    /// Extracts a frame from a single `data: {...}` stream line.
    /// Returns `None` for keep-alives, comments and other non-data lines.
    pub fn from_stream_line(line: &str) -> Option<Result<Self, ReaderError>> {
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        Some(Self::from_json(payload))
    }
}

/// Reassembles stream lines from network chunks.
///
/// Bytes are held until a newline arrives, so a character split across two
/// chunks decodes intact. A line growing past [`MAX_STREAM_LINE`] is dropped
/// up to its terminating newline.
#[derive(Debug, Default)]
pub struct StreamLines {
    pending: Vec<u8>,
    discarding: bool,
}

impl StreamLines {
    /// Feeds one chunk and returns every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..newline];
            rest = &rest[newline + 1..];
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if self.pending.len() + head.len() > MAX_STREAM_LINE {
                self.drop_oversized();
                continue;
            }
            self.pending.extend_from_slice(head);
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }

        if !self.discarding {
            if self.pending.len() + rest.len() > MAX_STREAM_LINE {
                self.drop_oversized();
                self.discarding = true;
            } else {
                self.pending.extend_from_slice(rest);
            }
        }
        lines
    }

    fn drop_oversized(&mut self) {
        warn!("Dropping meter stream line longer than {} bytes", MAX_STREAM_LINE);
        self.pending.clear();
    }
}
