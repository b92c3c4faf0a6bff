//! Gateway heartbeat tracking and primary failover
//!
//! Gateway-capable nodes broadcast [`GatewayHeartbeat`]s. Every node keeps
//! the latest heartbeat per sender and runs a small election state machine:
//!
//! ```text
//! Idle --start_election--> ElectionRunning --duration elapsed--> Cooldown
//!   ^                             |                                  |
//!   |                   stronger primary claim                       |
//!   |                             v                                  |
//!   +-------------------------- Cooldown <----- cooldown elapsed ----+
//! ```
//!
//! A primary claim only counts when the sender has an uplink and a signal
//! better than -70 dBm. Between competing claims the stronger one is kept,
//! whatever order they arrive in.
//!
//! While Idle, a remote primary that stops heartbeating for longer than the
//! failure timeout is dropped and a new election starts. Convergence is
//! eventual: nodes may disagree on the primary for up to one failure
//! timeout after a real failure.

use crate::wire::{is_acceptable_signal, GatewayHeartbeat};
use canopy_core::{NodeId, Rssi, SharedGatewayConfig, NO_NODE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Default heartbeat broadcast interval (ms)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default silence after which a primary is considered failed (ms)
pub const DEFAULT_FAILURE_TIMEOUT_MS: u64 = 45_000;

/// Default candidate collection time (ms)
pub const DEFAULT_ELECTION_DURATION_MS: u64 = 5_000;

/// Default hold-off after an election (ms)
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    /// Following the current primary, watching for it to go silent
    Idle,
    /// Collecting candidates until the election duration elapses
    ElectionRunning,
    /// Holding the last result; new elections are suppressed
    Cooldown,
}

/// Who won, as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionResult {
    /// Winning node, `NO_NODE` when nobody qualified
    pub winner: NodeId,
    /// The winner is this node
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    rssi: Rssi,
    last_seen: u64,
}

#[derive(Debug, Clone)]
struct SeenHeartbeat {
    heartbeat: GatewayHeartbeat,
    received_at: u64,
}

/// Heartbeat-driven primary gateway election
#[derive(Debug)]
pub struct GatewayElectionManager {
    node_id: NodeId,
    local_has_internet: bool,
    local_rssi: Rssi,

    state: ElectionState,
    election_started: u64,
    cooldown_started: u64,
    election_duration_ms: u64,
    cooldown_ms: u64,
    failure_timeout_ms: u64,
    heartbeat_interval_ms: u64,

    candidates: HashMap<NodeId, Candidate>,
    heartbeats: HashMap<NodeId, SeenHeartbeat>,
    primary_id: NodeId,
    primary_last_seen: u64,
    elected_primary: bool,
    pending_result: Option<ElectionResult>,
}

impl GatewayElectionManager {
    /// Idle manager for `node_id` with default timing and no candidates
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            local_has_internet: false,
            local_rssi: 0,
            state: ElectionState::Idle,
            election_started: 0,
            cooldown_started: 0,
            election_duration_ms: DEFAULT_ELECTION_DURATION_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            failure_timeout_ms: DEFAULT_FAILURE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            candidates: HashMap::new(),
            heartbeats: HashMap::new(),
            primary_id: NO_NODE,
            primary_last_seen: 0,
            elected_primary: false,
            pending_result: None,
        }
    }

    /// Rebind to a new local identity
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    /// Describe this node as a candidate
    pub fn set_local_candidate(&mut self, has_internet: bool, rssi: Rssi) {
        self.local_has_internet = has_internet;
        self.local_rssi = rssi;
    }

    /// How long candidates are collected (ms)
    pub fn set_election_duration(&mut self, duration_ms: u64) {
        self.election_duration_ms = duration_ms;
    }

    /// Hold-off after an election before another may start (ms)
    pub fn set_cooldown_period(&mut self, cooldown_ms: u64) {
        self.cooldown_ms = cooldown_ms;
    }

    /// Take failover timing from the shared gateway configuration
    pub fn configure(&mut self, config: &SharedGatewayConfig) {
        self.failure_timeout_ms = config.gateway_failure_timeout;
        self.heartbeat_interval_ms = config.gateway_heartbeat_interval;
    }

    /// Current election state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Heartbeat broadcast interval (ms)
    pub fn heartbeat_interval(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    /// Silence after which the primary is failed over (ms)
    pub fn failure_timeout(&self) -> u64 {
        self.failure_timeout_ms
    }

    /// Begin collecting candidates. Ignored during cooldown.
    pub fn start_election(&mut self, now: u64) {
        match self.state {
            ElectionState::Cooldown => {
                debug!(node_id = self.node_id, "Election suppressed during cooldown");
                return;
            }
            ElectionState::ElectionRunning => return,
            ElectionState::Idle => {}
        }

        self.candidates.clear();
        if self.local_has_internet {
            self.candidates.insert(
                self.node_id,
                Candidate {
                    rssi: self.local_rssi,
                    last_seen: now,
                },
            );
        }
        self.state = ElectionState::ElectionRunning;
        self.election_started = now;
        info!(
            node_id = self.node_id,
            local_candidate = self.local_has_internet,
            "Gateway election started"
        );
    }

    /// Record a heartbeat from another gateway
    pub fn process_heartbeat(&mut self, heartbeat: &GatewayHeartbeat, now: u64) {
        let sender = heartbeat.from;
        if sender == self.node_id {
            return;
        }

        self.heartbeats.insert(
            sender,
            SeenHeartbeat {
                heartbeat: heartbeat.clone(),
                received_at: now,
            },
        );

        if heartbeat.has_internet {
            self.candidates.insert(
                sender,
                Candidate {
                    rssi: heartbeat.router_rssi,
                    last_seen: now,
                },
            );
        } else {
            self.candidates.remove(&sender);
        }

        // Only a claim that still qualifies keeps the primary alive.
        let qualifies = heartbeat.is_healthy() && heartbeat.has_acceptable_signal();
        if sender == self.primary_id && qualifies {
            self.primary_last_seen = now;
        }

        if !heartbeat.is_primary {
            return;
        }
        if !qualifies {
            debug!(
                claimant = sender,
                rssi = heartbeat.router_rssi,
                has_internet = heartbeat.has_internet,
                "Primary claim ignored"
            );
            return;
        }

        match self.state {
            ElectionState::ElectionRunning => {
                if !self.local_qualifies() || heartbeat.router_rssi > self.local_rssi {
                    info!(
                        primary = sender,
                        rssi = heartbeat.router_rssi,
                        "Deferring to existing primary gateway"
                    );
                    self.adopt_remote_primary(sender, now);
                    self.enter_cooldown(now);
                    self.pending_result = Some(ElectionResult {
                        winner: sender,
                        is_local: false,
                    });
                }
            }
            ElectionState::Idle | ElectionState::Cooldown => {
                if self.elected_primary && !self.outranks_local(heartbeat) {
                    return;
                }
                if sender != self.primary_id && !self.outranks_primary(heartbeat, now) {
                    debug!(
                        primary = self.primary_id,
                        claimant = sender,
                        "Weaker primary claim ignored"
                    );
                    return;
                }
                if self.primary_id != sender {
                    debug!(primary = sender, "Primary gateway claim accepted");
                }
                self.adopt_remote_primary(sender, now);
            }
        }
    }

    fn outranks_local(&self, heartbeat: &GatewayHeartbeat) -> bool {
        heartbeat.has_internet
            && (heartbeat.router_rssi, heartbeat.from) > (self.local_rssi, self.node_id)
    }

    fn local_qualifies(&self) -> bool {
        self.local_has_internet && is_acceptable_signal(self.local_rssi)
    }

    /// A claim beats the current remote primary unless that primary is
    /// still heard with internet and a stronger signal (ties to higher id).
    fn outranks_primary(&self, heartbeat: &GatewayHeartbeat, now: u64) -> bool {
        if self.primary_id == NO_NODE {
            return true;
        }
        let current = self
            .heartbeats
            .get(&self.primary_id)
            .filter(|seen| now.saturating_sub(seen.received_at) <= self.failure_timeout_ms)
            .map(|seen| &seen.heartbeat)
            .filter(|hb| hb.has_internet && hb.has_acceptable_signal());
        match current {
            Some(primary) => {
                (heartbeat.router_rssi, heartbeat.from) > (primary.router_rssi, primary.from)
            }
            None => true,
        }
    }

    fn adopt_remote_primary(&mut self, primary: NodeId, now: u64) {
        self.primary_id = primary;
        self.primary_last_seen = now;
        self.elected_primary = false;
    }

    fn enter_cooldown(&mut self, now: u64) {
        self.state = ElectionState::Cooldown;
        self.cooldown_started = now;
    }

    /// Advance the state machine. Returns true iff this node is the elected
    /// primary and should heartbeat as such.
    pub fn update(&mut self, now: u64) -> bool {
        match self.state {
            ElectionState::ElectionRunning => {
                if now.saturating_sub(self.election_started) >= self.election_duration_ms {
                    self.complete_election(now);
                }
            }
            ElectionState::Cooldown => {
                if now.saturating_sub(self.cooldown_started) > self.cooldown_ms {
                    self.state = ElectionState::Idle;
                    debug!(node_id = self.node_id, "Election cooldown finished");
                }
            }
            ElectionState::Idle => {
                if self.primary_id != NO_NODE
                    && self.primary_id != self.node_id
                    && now.saturating_sub(self.primary_last_seen) > self.failure_timeout_ms
                {
                    warn!(
                        primary = self.primary_id,
                        silent_ms = now.saturating_sub(self.primary_last_seen),
                        "Primary gateway heartbeat lost, starting failover election"
                    );
                    self.primary_id = NO_NODE;
                    self.start_election(now);
                }
            }
        }

        let timeout = self.failure_timeout_ms;
        self.heartbeats
            .retain(|_, seen| now.saturating_sub(seen.received_at) <= timeout);

        self.elected_primary
    }

    fn complete_election(&mut self, now: u64) {
        let timeout = self.failure_timeout_ms;
        let winner = self
            .candidates
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.last_seen) <= timeout)
            .filter(|(_, c)| is_acceptable_signal(c.rssi))
            .max_by_key(|(id, c)| (c.rssi, **id))
            .map(|(id, _)| *id)
            .unwrap_or(NO_NODE);

        self.primary_id = winner;
        self.primary_last_seen = now;
        self.elected_primary = winner != NO_NODE && winner == self.node_id;
        self.enter_cooldown(now);
        self.pending_result = Some(ElectionResult {
            winner,
            is_local: self.elected_primary,
        });

        if winner == NO_NODE {
            warn!(
                node_id = self.node_id,
                "Gateway election found no internet-capable candidate with acceptable signal"
            );
        } else {
            info!(
                winner,
                is_local = self.elected_primary,
                candidates = self.candidates.len(),
                "Gateway election complete"
            );
        }
    }

    /// Result of the last completed or deferred election, once
    pub fn take_result(&mut self) -> Option<ElectionResult> {
        self.pending_result.take()
    }

    /// Internet-capable candidates currently known
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Current primary, `NO_NODE` when none
    pub fn primary_gateway_id(&self) -> NodeId {
        self.primary_id
    }

    /// This node won the last election and heartbeats as primary
    pub fn is_elected_primary(&self) -> bool {
        self.elected_primary
    }

    /// Primary implied by fresh heartbeats alone: healthy senders with
    /// acceptable signal, strongest first, ties to the higher node id.
    pub fn primary_from_heartbeats(&self, now: u64) -> Option<NodeId> {
        self.heartbeats
            .values()
            .filter(|seen| now.saturating_sub(seen.received_at) <= self.failure_timeout_ms)
            .map(|seen| &seen.heartbeat)
            .filter(|hb| hb.is_healthy() && hb.has_acceptable_signal())
            .max_by_key(|hb| (hb.router_rssi, hb.from))
            .map(|hb| hb.from)
    }

    /// Build this node's heartbeat
    pub fn local_heartbeat(&self, uptime: u64, timestamp: u64) -> GatewayHeartbeat {
        GatewayHeartbeat {
            from: self.node_id,
            is_primary: self.elected_primary,
            has_internet: self.local_has_internet,
            router_rssi: self.local_rssi,
            uptime,
            timestamp,
        }
    }

    /// Back to the freshly-constructed state, keeping identity and timing
    pub fn reset(&mut self) {
        self.state = ElectionState::Idle;
        self.candidates.clear();
        self.heartbeats.clear();
        self.primary_id = NO_NODE;
        self.primary_last_seen = 0;
        self.elected_primary = false;
        self.pending_result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(from: NodeId, is_primary: bool, has_internet: bool, rssi: Rssi) -> GatewayHeartbeat {
        GatewayHeartbeat {
            from,
            is_primary,
            has_internet,
            router_rssi: rssi,
            uptime: 3_600,
            timestamp: 0,
        }
    }

    fn instant_election(node_id: NodeId, has_internet: bool, rssi: Rssi) -> GatewayElectionManager {
        let mut election = GatewayElectionManager::new(node_id);
        election.set_local_candidate(has_internet, rssi);
        election.set_election_duration(0);
        election
    }

    #[test]
    fn test_defaults() {
        let election = GatewayElectionManager::new(1);
        assert_eq!(election.state(), ElectionState::Idle);
        assert!(!election.is_elected_primary());
        assert_eq!(election.primary_gateway_id(), NO_NODE);
        assert_eq!(election.candidate_count(), 0);
    }

    #[test]
    fn test_start_with_internet_adds_self() {
        let mut election = instant_election(12345, true, -50);
        election.start_election(1_000);

        assert_eq!(election.state(), ElectionState::ElectionRunning);
        assert_eq!(election.candidate_count(), 1);
        assert!(!election.is_elected_primary());
    }

    #[test]
    fn test_start_without_internet_runs_empty() {
        let mut election = instant_election(12345, false, -50);
        election.start_election(1_000);

        assert_eq!(election.state(), ElectionState::ElectionRunning);
        assert_eq!(election.candidate_count(), 0);
    }

    #[test]
    fn test_idle_heartbeats() {
        let mut election = GatewayElectionManager::new(12345);

        election.process_heartbeat(&heartbeat(55555, false, true, -45), 1_000);
        assert_eq!(election.primary_gateway_id(), NO_NODE);
        assert_eq!(election.state(), ElectionState::Idle);

        election.process_heartbeat(&heartbeat(99999, true, true, -45), 1_000);
        assert_eq!(election.primary_gateway_id(), 99999);
        assert_eq!(election.state(), ElectionState::Idle);
        assert!(!election.is_elected_primary());
    }

    #[test]
    fn test_strongest_candidate_wins() {
        let mut election = instant_election(10000, true, -60);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(20000, false, true, -40), 1_000);
        election.process_heartbeat(&heartbeat(30000, false, true, -50), 1_000);

        let broadcast = election.update(1_000);

        assert_eq!(election.primary_gateway_id(), 20000);
        assert!(!election.is_elected_primary());
        assert!(!broadcast);
        assert_eq!(election.state(), ElectionState::Cooldown);
    }

    #[test]
    fn test_rssi_tie_goes_to_higher_id() {
        let mut election = instant_election(10000, true, -50);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(20000, false, true, -50), 1_000);
        assert!(!election.update(1_000));
        assert_eq!(election.primary_gateway_id(), 20000);

        let mut election = instant_election(30000, true, -50);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(20000, false, true, -50), 1_000);
        assert!(election.update(1_000));
        assert_eq!(election.primary_gateway_id(), 30000);
        assert!(election.is_elected_primary());
    }

    #[test]
    fn test_cooldown() {
        let mut election = instant_election(12345, true, -45);
        election.set_cooldown_period(60_000);
        election.start_election(1_000);
        election.update(1_000);
        assert_eq!(election.state(), ElectionState::Cooldown);

        election.start_election(1_000);
        assert_eq!(election.state(), ElectionState::Cooldown);

        election.update(61_000);
        assert_eq!(election.state(), ElectionState::Cooldown);

        election.update(61_001);
        assert_eq!(election.state(), ElectionState::Idle);

        election.start_election(61_001);
        assert_eq!(election.state(), ElectionState::ElectionRunning);
    }

    #[test]
    fn test_defer_to_stronger_primary_claim() {
        let mut election = GatewayElectionManager::new(10000);
        election.set_local_candidate(true, -50);
        election.set_election_duration(10_000);
        election.start_election(1_000);

        election.process_heartbeat(&heartbeat(99999, true, true, -40), 1_000);

        assert_eq!(election.primary_gateway_id(), 99999);
        assert!(!election.is_elected_primary());
        assert_eq!(election.state(), ElectionState::Cooldown);
        assert_eq!(
            election.take_result(),
            Some(ElectionResult {
                winner: 99999,
                is_local: false
            })
        );
    }

    #[test]
    fn test_weaker_primary_claim_does_not_stop_election() {
        let mut election = GatewayElectionManager::new(10000);
        election.set_local_candidate(true, -50);
        election.set_election_duration(10_000);
        election.start_election(1_000);

        election.process_heartbeat(&heartbeat(99999, true, true, -60), 1_000);

        assert_eq!(election.state(), ElectionState::ElectionRunning);
    }

    #[test]
    fn test_reset() {
        let mut election = instant_election(12345, true, -45);
        election.start_election(1_000);
        election.update(1_000);
        assert_eq!(election.primary_gateway_id(), 12345);
        assert!(election.is_elected_primary());

        election.reset();

        assert_eq!(election.state(), ElectionState::Idle);
        assert_eq!(election.primary_gateway_id(), NO_NODE);
        assert!(!election.is_elected_primary());
        assert_eq!(election.candidate_count(), 0);
    }

    #[test]
    fn test_result_reported_once() {
        let mut election = instant_election(12345, true, -45);
        election.start_election(1_000);
        election.update(1_000);

        assert_eq!(
            election.take_result(),
            Some(ElectionResult {
                winner: 12345,
                is_local: true
            })
        );
        assert_eq!(election.take_result(), None);
    }

    #[test]
    fn test_no_internet_candidates() {
        let mut election = instant_election(12345, false, -45);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(99999, false, false, -40), 1_000);

        election.update(1_000);

        assert_eq!(election.primary_gateway_id(), NO_NODE);
        assert!(!election.is_elected_primary());
        assert_eq!(election.state(), ElectionState::Cooldown);
    }

    #[test]
    fn test_only_internet_capable_nodes_win() {
        let mut election = instant_election(10000, true, -70);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(20000, false, false, -30), 1_000);
        election.process_heartbeat(&heartbeat(30000, false, true, -50), 1_000);

        election.update(1_000);

        assert_eq!(election.primary_gateway_id(), 30000);
    }

    #[test]
    fn test_failover_after_primary_goes_silent() {
        let mut election = GatewayElectionManager::new(10000);
        election.set_local_candidate(true, -55);
        election.set_election_duration(0);
        election.process_heartbeat(&heartbeat(99999, true, true, -40), 0);

        election.update(45_000);
        assert_eq!(election.primary_gateway_id(), 99999);
        assert_eq!(election.state(), ElectionState::Idle);

        election.update(45_001);
        assert_eq!(election.state(), ElectionState::ElectionRunning);
        assert_eq!(election.primary_gateway_id(), NO_NODE);

        assert!(election.update(45_001));
        assert_eq!(election.primary_gateway_id(), 10000);
    }

    #[test]
    fn test_primary_from_heartbeats() {
        let mut election = GatewayElectionManager::new(1);
        election.process_heartbeat(&heartbeat(10, true, true, -60), 0);
        election.process_heartbeat(&heartbeat(20, true, true, -60), 0);
        election.process_heartbeat(&heartbeat(30, true, true, -70), 0);
        election.process_heartbeat(&heartbeat(40, false, true, -30), 0);
        election.process_heartbeat(&heartbeat(50, true, true, 0), 0);

        assert_eq!(election.primary_from_heartbeats(0), Some(20));
        assert_eq!(election.primary_from_heartbeats(45_001), None);
    }

    #[test]
    fn test_weak_primary_claim_not_adopted() {
        let mut election = GatewayElectionManager::new(1);
        election.process_heartbeat(&heartbeat(100, true, true, -40), 0);
        election.process_heartbeat(&heartbeat(200, true, true, -90), 10);

        assert_eq!(election.primary_gateway_id(), 100);

        let mut election = GatewayElectionManager::new(1);
        election.process_heartbeat(&heartbeat(300, true, true, -70), 0);
        election.process_heartbeat(&heartbeat(400, true, false, -40), 0);
        assert_eq!(election.primary_gateway_id(), NO_NODE);
    }

    #[test]
    fn test_competing_claims_keep_stronger_primary() {
        let mut election = GatewayElectionManager::new(1);

        election.process_heartbeat(&heartbeat(100, true, true, -60), 0);
        election.process_heartbeat(&heartbeat(200, true, true, -45), 100);
        assert_eq!(election.primary_gateway_id(), 200);

        // The weaker claimant keeps heartbeating; arrival order must not matter.
        for now in [15_000, 30_000] {
            election.process_heartbeat(&heartbeat(200, true, true, -45), now);
            election.process_heartbeat(&heartbeat(100, true, true, -60), now + 1);
            assert_eq!(election.primary_gateway_id(), 200);
        }
        assert_eq!(election.primary_from_heartbeats(30_001), Some(200));
    }

    #[test]
    fn test_weaker_claim_replaces_silent_primary() {
        let mut election = GatewayElectionManager::new(1);
        election.process_heartbeat(&heartbeat(200, true, true, -45), 0);

        election.process_heartbeat(&heartbeat(100, true, true, -60), 45_001);

        assert_eq!(election.primary_gateway_id(), 100);
        assert_eq!(election.state(), ElectionState::Idle);
    }

    #[test]
    fn test_election_skips_unacceptable_signal() {
        let mut election = instant_election(10000, true, -80);
        election.start_election(1_000);
        election.process_heartbeat(&heartbeat(20000, false, true, -75), 1_000);
        election.process_heartbeat(&heartbeat(30000, false, true, -65), 1_000);

        assert!(!election.update(1_000));
        assert_eq!(election.primary_gateway_id(), 30000);

        let mut election = instant_election(10000, true, -80);
        election.start_election(1_000);
        election.update(1_000);
        assert_eq!(election.primary_gateway_id(), NO_NODE);
        assert!(!election.is_elected_primary());
    }

    #[test]
    fn test_node_without_uplink_defers_to_any_valid_primary() {
        let mut election = GatewayElectionManager::new(10000);
        election.set_election_duration(10_000);
        election.start_election(1_000);

        election.process_heartbeat(&heartbeat(99999, true, true, -65), 1_000);

        assert_eq!(election.primary_gateway_id(), 99999);
        assert_eq!(election.state(), ElectionState::Cooldown);
    }

    #[test]
    fn test_configure_timing() {
        let mut election = GatewayElectionManager::new(1);
        let config = SharedGatewayConfig {
            gateway_heartbeat_interval: 5_000,
            gateway_failure_timeout: 10_000,
            ..SharedGatewayConfig::default()
        };

        election.configure(&config);

        assert_eq!(election.heartbeat_interval(), 5_000);
        assert_eq!(election.failure_timeout(), 10_000);
    }
}
