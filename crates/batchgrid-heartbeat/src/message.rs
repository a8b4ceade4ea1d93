//! Heartbeat wire format: one JSON object per UDP datagram.

use serde::Deserialize;

use batchgrid_state::{MetricsSnapshot, Platform, StateResult, epoch_secs};

use crate::error::{HeartbeatError, HeartbeatResult};

/// Decoded heartbeat. Metric and YARN counter fields sit at the top level
/// of the JSON object; unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatMessage {
    pub cluster_name: String,
    /// Platform tag of the sender, e.g. `dataproc` or `local`.
    #[serde(default)]
    pub service_type: String,
    /// Sender clock. Missing means "now" on receipt.
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

impl HeartbeatMessage {
    pub fn decode(bytes: &[u8]) -> HeartbeatResult<Self> {
        let message: Self =
            serde_json::from_slice(bytes).map_err(|e| HeartbeatError::Decode(e.to_string()))?;
        if message.cluster_name.trim().is_empty() {
            return Err(HeartbeatError::Decode("empty cluster_name".into()));
        }
        Ok(message)
    }

    pub fn platform(&self) -> StateResult<Platform> {
        self.service_type.parse()
    }

    /// The snapshot to append, stamped with the sender's clock or `now`.
    pub fn into_snapshot(self, now: u64) -> MetricsSnapshot {
        let mut snapshot = self.metrics;
        snapshot.timestamp = self.timestamp.unwrap_or(now);
        snapshot
    }

    pub fn into_snapshot_now(self) -> MetricsSnapshot {
        self.into_snapshot(epoch_secs())
    }
}
