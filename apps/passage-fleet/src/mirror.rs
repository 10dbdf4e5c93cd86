//! Best-effort mirror of fleet state to an external key-value store.
//!
//! The in-process store is authoritative; the mirror exists so a restarted
//! broker can resume still-live sessions. Every write failure is logged and
//! swallowed — a mirror outage must never fail a request.

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fleet::{FleetStatus, SlotSnapshot};

const STATE_PREFIX: &str = "fleet/state/";
const SUMMARY_KEY: &str = "fleet/summary";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStateEntry {
    pub in_use: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_used: u64,
    #[serde(default)]
    pub last_heartbeat: u64,
}

impl From<&SlotSnapshot> for SlotStateEntry {
    fn from(snapshot: &SlotSnapshot) -> Self {
        Self {
            in_use: snapshot.in_use,
            client_id: snapshot.client_id.clone(),
            session_id: snapshot.session_id.clone(),
            last_used: snapshot.last_used,
            last_heartbeat: snapshot.last_heartbeat,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryEntry {
    in_use: usize,
    available: usize,
    total: usize,
    updated_at: u64,
    browsers: Vec<SummaryBrowser>,
}

#[derive(Debug, Serialize)]
struct SummaryBrowser {
    id: usize,
    available: bool,
}

#[derive(Clone)]
pub struct StateMirror {
    redis: ConnectionManager,
}

impl StateMirror {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    pub async fn write_slot(&self, snapshot: &SlotSnapshot) {
        let entry = SlotStateEntry::from(snapshot);
        let key = format!("{STATE_PREFIX}{}", snapshot.slot_id);
        let value = match serde_json::to_string(&entry) {
            Ok(value) => value,
            Err(err) => {
                warn!(slot = snapshot.slot_id, %err, "mirror serialize failed");
                return;
            }
        };
        let mut conn = self.redis.clone();
        if let Err(err) = conn.set::<_, _, ()>(&key, value).await {
            warn!(slot = snapshot.slot_id, %err, "mirror write failed");
        }
    }

    pub async fn write_summary(&self, status: &FleetStatus, updated_at: u64) {
        let entry = SummaryEntry {
            in_use: status.in_use,
            available: status.available,
            total: status.total,
            updated_at,
            browsers: status
                .browsers
                .iter()
                .map(|(id, available)| SummaryBrowser {
                    id: *id,
                    available: *available,
                })
                .collect(),
        };
        let value = match serde_json::to_string(&entry) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "mirror summary serialize failed");
                return;
            }
        };
        let mut conn = self.redis.clone();
        if let Err(err) = conn.set::<_, _, ()>(SUMMARY_KEY, value).await {
            warn!(%err, "mirror summary write failed");
        }
    }

    pub async fn read_slot(&self, slot_id: usize) -> Option<SlotStateEntry> {
        let key = format!("{STATE_PREFIX}{slot_id}");
        let mut conn = self.redis.clone();
        let value: Option<String> = match conn.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(slot = slot_id, %err, "mirror read failed");
                return None;
            }
        };
        let value = value?;
        match serde_json::from_str(&value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(slot = slot_id, %err, "mirror entry unparseable");
                None
            }
        }
    }

    /// Read every slot entry at boot.
    pub async fn read_all(&self, total_slots: usize) -> Vec<(usize, SlotStateEntry)> {
        let mut entries = Vec::new();
        for slot_id in 1..=total_slots {
            if let Some(entry) = self.read_slot(slot_id).await {
                entries.push((slot_id, entry));
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "mirror state loaded");
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_serialize_camel_case() {
        let entry = SlotStateEntry {
            in_use: true,
            client_id: Some("c1".into()),
            session_id: Some("s1".into()),
            last_used: 10,
            last_heartbeat: 20,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"inUse\":true"));
        assert!(json.contains("\"clientId\":\"c1\""));
        assert!(json.contains("\"lastHeartbeat\":20"));
    }

    #[test]
    fn tombstones_round_trip() {
        let json = r#"{"inUse":false}"#;
        let entry: SlotStateEntry = serde_json::from_str(json).unwrap();
        assert!(!entry.in_use);
        assert!(entry.client_id.is_none());
        assert_eq!(entry.last_heartbeat, 0);
    }
}
