//! Configuration management for Canopy nodes.
//!
//! Three records live here:
//!
//! - [`SharedGatewayConfig`]: gateway/relay thresholds shared by every
//!   gateway-capable node. Field names on the wire are camelCase.
//! - [`MeshConfig`]: bridge registry, election and request tuning.
//! - [`NodeConfig`]: what a node process loads from disk.
//!
//! Validation never clamps. Out-of-range values are rejected with a
//! message naming the offending field.

use crate::error::ConfigError;
use crate::types::{NodeId, Rssi};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest SSID accepted by 802.11
pub const MAX_SSID_LEN: usize = 32;
/// Longest WPA2 passphrase
pub const MAX_PASSWORD_LEN: usize = 63;

/// Weakest minimum bridge RSSI that may be configured
pub const MIN_BRIDGE_RSSI_FLOOR: Rssi = -100;
/// Strongest minimum bridge RSSI that may be configured
pub const MIN_BRIDGE_RSSI_CEILING: Rssi = -30;

/// Gateway and relay configuration shared across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedGatewayConfig {
    /// Gates every other check in [`validate`](Self::validate)
    pub enabled: bool,
    /// Upstream network name
    #[serde(rename = "routerSSID")]
    pub router_ssid: String,
    /// Upstream network passphrase (may be empty)
    pub router_password: String,
    /// How often the local uplink is probed (ms)
    pub internet_check_interval: u64,
    /// Host probed by the liveness check
    pub internet_check_host: String,
    /// Port probed by the liveness check
    pub internet_check_port: u16,
    /// Probe timeout (ms)
    pub internet_check_timeout: u64,
    /// Relay attempts before giving up
    pub message_retry_count: u8,
    /// Base delay between relay attempts (ms)
    pub retry_interval: u64,
    /// How long a relayed request is remembered for dedup (ms)
    pub duplicate_tracking_timeout: u64,
    /// Dedup capacity
    pub max_tracked_messages: usize,
    /// Heartbeat broadcast cadence (ms)
    pub gateway_heartbeat_interval: u64,
    /// Primary considered lost after this long without a heartbeat (ms)
    pub gateway_failure_timeout: u64,
    /// Whether this node stands in gateway elections
    pub participate_in_election: bool,
    /// Priority applied to relayed traffic (0 = critical)
    pub relayed_message_priority: u8,
    /// Keep the upstream association up even when idle
    pub maintain_permanent_connection: bool,
}

impl Default for SharedGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            router_ssid: String::new(),
            router_password: String::new(),
            internet_check_interval: 30_000,
            internet_check_host: "8.8.8.8".to_string(),
            internet_check_port: 53,
            internet_check_timeout: 5_000,
            message_retry_count: 3,
            retry_interval: 1_000,
            duplicate_tracking_timeout: 60_000,
            max_tracked_messages: 500,
            gateway_heartbeat_interval: 15_000,
            gateway_failure_timeout: 45_000,
            participate_in_election: true,
            relayed_message_priority: 0,
            maintain_permanent_connection: true,
        }
    }
}

impl SharedGatewayConfig {
    /// Check every constrained field, stopping at the first failure.
    ///
    /// A disabled configuration is always valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.router_ssid.is_empty() {
            return Err(ConfigError::invalid("routerSSID is required when enabled"));
        }
        if self.router_ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::invalid(
                "routerSSID exceeds maximum length of 32 characters",
            ));
        }
        if self.router_password.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::invalid(
                "routerPassword exceeds maximum length of 63 characters",
            ));
        }
        if self.internet_check_host.is_empty() {
            return Err(ConfigError::invalid("internetCheckHost cannot be empty"));
        }
        if self.internet_check_interval < 1_000 {
            return Err(ConfigError::invalid(
                "internetCheckInterval must be at least 1000ms",
            ));
        }
        if self.internet_check_timeout < 100 {
            return Err(ConfigError::invalid(
                "internetCheckTimeout must be at least 100ms",
            ));
        }
        if self.internet_check_timeout >= self.internet_check_interval {
            return Err(ConfigError::invalid(
                "internetCheckTimeout must be less than internetCheckInterval",
            ));
        }
        if self.gateway_heartbeat_interval < 1_000 {
            return Err(ConfigError::invalid(
                "gatewayHeartbeatInterval must be at least 1000ms",
            ));
        }
        if self.gateway_failure_timeout < self.gateway_heartbeat_interval.saturating_mul(2) {
            return Err(ConfigError::invalid(
                "gatewayFailureTimeout should be at least 2x gatewayHeartbeatInterval",
            ));
        }
        if self.duplicate_tracking_timeout < 1_000 {
            return Err(ConfigError::invalid(
                "duplicateTrackingTimeout must be at least 1000ms",
            ));
        }
        if self.max_tracked_messages < 10 {
            return Err(ConfigError::invalid("maxTrackedMessages must be at least 10"));
        }
        if self.retry_interval < 100 {
            return Err(ConfigError::invalid("retryInterval must be at least 100ms"));
        }

        Ok(())
    }

    /// Whether this node may stand in gateway elections.
    pub fn can_participate_in_election(&self) -> bool {
        self.participate_in_election && self.has_router_credentials()
    }

    /// Whether an upstream SSID is configured.
    pub fn has_router_credentials(&self) -> bool {
        !self.router_ssid.is_empty()
    }
}

/// Bridge registry, election and request tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Bridge status older than this is stale (ms)
    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout_ms: u64,
    /// Single-candidate election floor (dBm, -100..=-30)
    #[serde(default = "default_min_bridge_rssi")]
    pub min_bridge_rssi: Rssi,
    /// BRIDGE_STATUS broadcast cadence (ms)
    #[serde(default = "default_bridge_status_interval")]
    pub bridge_status_interval_ms: u64,
    /// Registry capacity
    #[serde(default = "default_max_known_bridges")]
    pub max_known_bridges: usize,
    /// How long bridge election candidacies are collected (ms)
    #[serde(default = "default_election_window")]
    pub election_window_ms: u64,
    /// Gateway election cooldown (ms)
    #[serde(default = "default_election_cooldown")]
    pub election_cooldown_ms: u64,
    /// sendToInternet request timeout (ms)
    #[serde(default = "default_internet_request_timeout")]
    pub internet_request_timeout_ms: u64,
    /// sendToInternet transport retries
    #[serde(default = "default_internet_retry_count")]
    pub internet_retry_count: u8,
    /// sendToInternet base retry delay (ms)
    #[serde(default = "default_internet_retry_delay")]
    pub internet_retry_delay_ms: u64,
    /// Record election history and bridge changes
    #[serde(default = "default_diagnostics")]
    pub diagnostics: bool,
}

fn default_bridge_timeout() -> u64 {
    60_000
}

fn default_min_bridge_rssi() -> Rssi {
    -80
}

fn default_bridge_status_interval() -> u64 {
    30_000
}

fn default_max_known_bridges() -> usize {
    20
}

fn default_election_window() -> u64 {
    5_000
}

fn default_election_cooldown() -> u64 {
    60_000
}

fn default_internet_request_timeout() -> u64 {
    30_000
}

fn default_internet_retry_count() -> u8 {
    3
}

fn default_internet_retry_delay() -> u64 {
    1_000
}

fn default_diagnostics() -> bool {
    true
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bridge_timeout_ms: default_bridge_timeout(),
            min_bridge_rssi: default_min_bridge_rssi(),
            bridge_status_interval_ms: default_bridge_status_interval(),
            max_known_bridges: default_max_known_bridges(),
            election_window_ms: default_election_window(),
            election_cooldown_ms: default_election_cooldown(),
            internet_request_timeout_ms: default_internet_request_timeout(),
            internet_retry_count: default_internet_retry_count(),
            internet_retry_delay_ms: default_internet_retry_delay(),
            diagnostics: default_diagnostics(),
        }
    }
}

impl MeshConfig {
    /// Reject values the mesh cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BRIDGE_RSSI_FLOOR..=MIN_BRIDGE_RSSI_CEILING).contains(&self.min_bridge_rssi) {
            return Err(ConfigError::invalid(format!(
                "minBridgeRssi must be between {} and {} dBm, got {}",
                MIN_BRIDGE_RSSI_FLOOR, MIN_BRIDGE_RSSI_CEILING, self.min_bridge_rssi
            )));
        }
        if self.bridge_timeout_ms == 0 {
            return Err(ConfigError::invalid("bridgeTimeout must be greater than 0ms"));
        }
        if self.max_known_bridges == 0 {
            return Err(ConfigError::invalid("maxKnownBridges must be at least 1"));
        }
        if self.bridge_status_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "bridgeStatusInterval must be greater than 0ms",
            ));
        }
        Ok(())
    }
}

/// Log output format for the node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Everything a node process reads from its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's mesh identity
    pub node_id: NodeId,
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Scheduler driver cadence (ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Whether this node has an upstream uplink of its own
    #[serde(default)]
    pub is_bridge: bool,
    /// Router signal reported with the uplink (dBm) when no radio driver
    /// measures it. `0` means unknown; such a node never qualifies as a
    /// bridge or primary gateway.
    #[serde(default)]
    pub router_rssi: Rssi,
    /// Mesh tuning
    #[serde(default)]
    pub mesh: MeshConfig,
    /// Gateway tuning
    #[serde(default)]
    pub gateway: SharedGatewayConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> u64 {
    100
}

impl NodeConfig {
    /// Configuration for `node_id` with every default applied.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            tick_interval_ms: default_tick_interval(),
            is_bridge: false,
            router_rssi: 0,
            mesh: MeshConfig::default(),
            gateway: SharedGatewayConfig::default(),
        }
    }

    /// Load from a `.toml` file, or JSON for any other extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            Self::from_toml_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        tracing::debug!(path = %path.display(), node_id = config.node_id, "Loaded node configuration");
        Ok(config)
    }

    #[cfg(feature = "toml")]
    fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    #[cfg(not(feature = "toml"))]
    fn from_toml_str(_content: &str) -> Result<Self, ConfigError> {
        Err(ConfigError::invalid(
            "TOML configuration requires the `toml` feature",
        ))
    }

    /// Validate every nested record.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::invalid("nodeId must be non-zero"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tickInterval must be greater than 0ms"));
        }
        if self.router_rssi > 0 {
            return Err(ConfigError::invalid(format!(
                "routerRssi must be negative dBm or 0 when unknown, got {}",
                self.router_rssi
            )));
        }
        self.mesh.validate()?;
        self.gateway.validate()
    }
}
