//! Bridge health registry
//!
//! Tracks every bridge heard from and answers "which bridge should traffic
//! use" and "is the internet reachable". Freshness is checked when asked,
//! never when written: an entry is healthy iff `now - last_seen < timeout`.

use canopy_core::{NodeId, Rssi, NO_NODE};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Default staleness limit for bridge status (ms)
pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 60_000;

/// Default registry capacity
pub const DEFAULT_MAX_KNOWN_BRIDGES: usize = 20;

/// One observed bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInfo {
    /// Bridge node
    pub node_id: NodeId,
    /// Bridge reports a working uplink
    pub internet_connected: bool,
    /// Bridge's router signal (dBm)
    pub router_rssi: Rssi,
    /// Router channel
    pub router_channel: u8,
    /// Bridge uptime as reported (ms)
    pub uptime: u64,
    /// Upstream gateway address
    pub gateway_ip: String,
    /// Timestamp carried in the status message
    pub timestamp: u64,
    /// Local time the status was received (ms)
    pub last_seen: u64,
}

impl BridgeInfo {
    /// Status younger than `timeout`.
    pub fn is_healthy(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.last_seen) < timeout
    }
}

/// A status update as it arrives off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatusUpdate {
    /// Reporting bridge
    pub node_id: NodeId,
    /// Uplink flag
    pub internet_connected: bool,
    /// Router signal
    pub router_rssi: Rssi,
    /// Router channel
    pub router_channel: u8,
    /// Reported uptime
    pub uptime: u64,
    /// Upstream gateway address
    pub gateway_ip: String,
    /// Sender timestamp
    pub timestamp: u64,
}

/// What an update changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeUpdate {
    /// Primary bridge before the update (0 = none)
    pub old_primary: NodeId,
    /// Primary bridge after the update (0 = none)
    pub new_primary: NodeId,
    /// First status from this bridge
    pub is_new: bool,
    /// Uplink flag before the update (`false` for new bridges)
    pub was_connected: bool,
    /// Uplink flag after the update
    pub internet_connected: bool,
}

impl BridgeUpdate {
    /// Primary bridge changed
    pub fn primary_changed(&self) -> bool {
        self.old_primary != self.new_primary
    }

    /// Uplink flag flipped (a new bridge counts as previously disconnected)
    pub fn internet_changed(&self) -> bool {
        self.was_connected != self.internet_connected
    }

    /// Diagnostic reason for a primary change
    pub fn change_reason(&self) -> &'static str {
        if self.is_new {
            "New bridge discovered"
        } else if self.internet_connected && !self.was_connected {
            "Bridge Internet restored"
        } else if !self.internet_connected && self.was_connected {
            "Bridge Internet lost"
        } else {
            "Primary bridge changed"
        }
    }
}

/// Last primary bridge change, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeChange {
    /// When it happened (ms)
    pub timestamp: u64,
    /// Previous primary (0 = none)
    pub old_bridge: NodeId,
    /// New primary (0 = none)
    pub new_bridge: NodeId,
    /// Uplink flag carried by the triggering update
    pub internet_available: bool,
    /// Why it changed
    pub reason: String,
}

/// Known bridges, bounded
#[derive(Debug)]
pub struct BridgeRegistry {
    bridges: Vec<BridgeInfo>,
    timeout_ms: u64,
    capacity: usize,
}

/// Strongest signal first, then lowest node id.
fn better(a: &BridgeInfo, b: &BridgeInfo) -> Ordering {
    a.router_rssi
        .cmp(&b.router_rssi)
        .then_with(|| b.node_id.cmp(&a.node_id))
}

impl BridgeRegistry {
    /// Registry with the given staleness limit and capacity
    pub fn new(timeout_ms: u64, capacity: usize) -> Self {
        Self {
            bridges: Vec::new(),
            timeout_ms,
            capacity: capacity.max(1),
        }
    }

    /// Staleness limit (ms)
    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// Change the staleness limit
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    /// Insert or overwrite the entry for `update.node_id`.
    ///
    /// When full and the bridge is new, expired entries are purged first;
    /// if that frees nothing, the entry heard from least recently goes.
    pub fn update_bridge_status(&mut self, update: BridgeStatusUpdate, now: u64) -> BridgeUpdate {
        let old_primary = self.primary_id(now);

        let existing = self
            .bridges
            .iter()
            .position(|bridge| bridge.node_id == update.node_id);

        let (index, is_new, was_connected) = match existing {
            Some(index) => (index, false, self.bridges[index].internet_connected),
            None => {
                if self.bridges.len() >= self.capacity {
                    self.cleanup_expired(now);
                }
                if self.bridges.len() >= self.capacity {
                    self.evict_least_recent();
                }
                self.bridges.push(BridgeInfo {
                    node_id: update.node_id,
                    internet_connected: false,
                    router_rssi: 0,
                    router_channel: 0,
                    uptime: 0,
                    gateway_ip: String::new(),
                    timestamp: 0,
                    last_seen: now,
                });
                (self.bridges.len() - 1, true, false)
            }
        };

        let entry = &mut self.bridges[index];
        entry.internet_connected = update.internet_connected;
        entry.router_rssi = update.router_rssi;
        entry.router_channel = update.router_channel;
        entry.uptime = update.uptime;
        entry.gateway_ip = update.gateway_ip;
        entry.timestamp = update.timestamp;
        entry.last_seen = now;

        if is_new {
            info!(
                bridge = update.node_id,
                internet = update.internet_connected,
                rssi = update.router_rssi,
                "New bridge discovered"
            );
        }

        BridgeUpdate {
            old_primary,
            new_primary: self.primary_id(now),
            is_new,
            was_connected,
            internet_connected: update.internet_connected,
        }
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .bridges
            .iter()
            .enumerate()
            .min_by_key(|(_, bridge)| bridge.last_seen)
            .map(|(index, _)| index);

        if let Some(index) = oldest {
            let evicted = self.bridges.remove(index);
            debug!(bridge = evicted.node_id, last_seen = evicted.last_seen, "Evicted bridge to make room");
        }
    }

    fn best(&self, now: Option<u64>) -> Option<&BridgeInfo> {
        self.bridges
            .iter()
            .filter(|bridge| bridge.internet_connected)
            .filter(|bridge| match now {
                Some(now) => bridge.is_healthy(now, self.timeout_ms),
                None => true,
            })
            .max_by(|a, b| better(a, b))
    }

    /// Best healthy bridge with internet: strongest signal, then lowest id.
    /// Stale entries are never returned.
    pub fn primary_bridge(&self, now: u64) -> Option<&BridgeInfo> {
        self.best(Some(now))
    }

    /// Same choice as [`primary_bridge`](Self::primary_bridge) but without
    /// the freshness check. For display only; do not route on it.
    pub fn last_known_bridge(&self) -> Option<&BridgeInfo> {
        self.best(None)
    }

    /// Node id of the primary bridge, 0 when there is none
    pub fn primary_id(&self, now: u64) -> NodeId {
        self.primary_bridge(now)
            .map(|bridge| bridge.node_id)
            .unwrap_or(NO_NODE)
    }

    /// Whether `node_id` is the primary bridge
    pub fn is_primary(&self, node_id: NodeId, now: u64) -> bool {
        node_id != NO_NODE && self.primary_id(now) == node_id
    }

    /// Some healthy bridge reports internet. Always freshness-checked,
    /// whatever the state of the local links.
    pub fn has_internet_connection(&self, now: u64) -> bool {
        self.bridges
            .iter()
            .any(|bridge| bridge.internet_connected && bridge.is_healthy(now, self.timeout_ms))
    }

    /// Healthy bridges with internet, ascending by node id
    pub fn nodes_with_internet(&self, now: u64) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .bridges
            .iter()
            .filter(|bridge| bridge.internet_connected && bridge.is_healthy(now, self.timeout_ms))
            .map(|bridge| bridge.node_id)
            .collect();
        nodes.sort_unstable();
        nodes
    }

    /// Number of healthy bridges with internet
    pub fn gateway_count(&self, now: u64) -> usize {
        self.nodes_with_internet(now).len()
    }

    /// Entry for `node_id`, fresh or not
    pub fn get(&self, node_id: NodeId) -> Option<&BridgeInfo> {
        self.bridges.iter().find(|bridge| bridge.node_id == node_id)
    }

    /// Snapshot of every entry
    pub fn bridges(&self) -> Vec<BridgeInfo> {
        self.bridges.clone()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Drop stale entries. Returns how many were removed.
    pub fn cleanup_expired(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.bridges.len();
        self.bridges.retain(|bridge| bridge.is_healthy(now, timeout));
        let removed = before - self.bridges.len();
        if removed > 0 {
            debug!(removed, "Removed expired bridges");
        }
        removed
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_TIMEOUT_MS, DEFAULT_MAX_KNOWN_BRIDGES)
    }
}
