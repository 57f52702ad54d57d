//! Client Record: fleet-wide partitioning of the ATR space for cleanup
//!
//! One record per collection lists every live client with a heartbeat and the
//! ATR indices it sweeps. Each client recomputes its own share on every
//! heartbeat from the sorted set of live client ids, so all clients that see
//! the same membership derive the same disjoint cover.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known document id of the client record
pub const CLIENT_RECORD_ID: &str = "_txn:client-record";

/// Xattr holding the record
pub const CLIENT_RECORD_FIELD: &str = "records";

/// Added to the cleanup window before a silent client is considered gone
pub const SAFETY_MARGIN: Duration = Duration::from_millis(20_000);

/// Expired clients pruned per write, bounded by the sub-document spec limit
pub const MAX_PRUNED_PER_WRITE: usize = 16 - 4;

/// One live client's row
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Last heartbeat (millis since UNIX epoch)
    pub heartbeat_ms: u64,
    /// Considered gone this long after the heartbeat
    pub expires_ms: u64,
    /// Size of the ATR space the client used
    pub num_atrs: usize,
    /// ATR indices the client sweeps
    #[serde(default)]
    pub atrs: Vec<u16>,
}

impl ClientEntry {
    /// Whether the client missed its heartbeat deadline
    pub fn has_expired(&self, now_ms: u64) -> bool {
        self.heartbeat_ms.saturating_add(self.expires_ms) < now_ms
    }
}

/// Manual cleanup-disable escape hatch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    /// Whether the override is set
    #[serde(default)]
    pub enabled: bool,
    /// Override lapses after this time (millis since UNIX epoch)
    #[serde(default)]
    pub expires_ms: u64,
}

/// Contents of the `records` xattr
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Live (and not yet pruned) clients
    #[serde(default)]
    pub clients: BTreeMap<String, ClientEntry>,
    /// Override flag
    #[serde(rename = "override", default, skip_serializing_if = "Option::is_none")]
    pub override_entry: Option<OverrideEntry>,
}

impl ClientRecord {
    /// Whether sweepers must stand down
    pub fn override_active(&self, now_ms: u64) -> bool {
        self.override_entry
            .as_ref()
            .is_some_and(|o| o.enabled && o.expires_ms > now_ms)
    }
}

/// Outcome of reading the record from one client's point of view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRecordDetails {
    /// Live clients, this one included, sorted
    pub active_clients: Vec<String>,
    /// Expired clients to prune on the next write
    pub expired_clients: Vec<String>,
    /// This client's position among the live ones
    pub index_of_this_client: usize,
    /// ATR indices this client sweeps
    pub atrs_handled: Vec<u16>,
    /// Whether sweepers must stand down
    pub override_active: bool,
}

impl ClientRecordDetails {
    /// Derive this client's share of `num_atrs` from `record` at `now_ms`
    pub fn compute(record: &ClientRecord, client_id: Uuid, num_atrs: usize, now_ms: u64) -> Self {
        let me = client_id.to_string();
        let mut active = Vec::new();
        let mut expired = Vec::new();
        for (id, entry) in &record.clients {
            if *id == me {
                continue;
            }
            if entry.has_expired(now_ms) {
                expired.push(id.clone());
            } else {
                active.push(id.clone());
            }
        }
        active.push(me.clone());
        active.sort();
        expired.truncate(MAX_PRUNED_PER_WRITE);

        let index = active.iter().position(|id| *id == me).unwrap_or(0);
        let atrs_handled = partition(num_atrs, active.len(), index);
        Self {
            active_clients: active,
            expired_clients: expired,
            index_of_this_client: index,
            atrs_handled,
            override_active: record.override_active(now_ms),
        }
    }

    /// Pacing budget per assigned ATR
    pub fn check_atr_time_window(&self, cleanup_window: Duration) -> Duration {
        let count = self.atrs_handled.len().max(1) as u32;
        cleanup_window / count
    }
}

/// ATR indices owned by client `index` of `num_clients`
pub fn partition(num_atrs: usize, num_clients: usize, index: usize) -> Vec<u16> {
    let num_clients = num_clients.max(1);
    (0..num_atrs)
        .filter(|atr| atr % num_clients == index)
        .map(|atr| atr as u16)
        .collect()
}
