//! Bridge election
//!
//! Chooses which node should take the upstream uplink. With a single
//! candidate the node must clear an absolute signal floor, so an isolated
//! node with a poor router signal never self-elects. With two or more
//! candidates the strongest signal wins outright, and equal signals go to
//! the lowest node id so every node reaches the same answer on its own.

use crate::error::{MeshError, MeshResult};
use canopy_core::config::{MIN_BRIDGE_RSSI_CEILING, MIN_BRIDGE_RSSI_FLOOR};
use canopy_core::{NodeId, Rssi};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Default single-candidate floor (dBm)
pub const DEFAULT_MIN_BRIDGE_RSSI: Rssi = -80;

/// Default candidacy collection window (ms)
pub const DEFAULT_ELECTION_WINDOW_MS: u64 = 5_000;

/// Elections kept in the diagnostics history
pub const MAX_ELECTION_HISTORY: usize = 10;

/// A node standing for bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionCandidate {
    /// Candidate node
    pub node_id: NodeId,
    /// Candidate's router signal strength
    pub router_rssi: Rssi,
    /// Candidate's reported uptime (ms)
    pub uptime: u64,
}

/// Result of running an election
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// A bridge was chosen
    Elected {
        /// Winning node
        winner: NodeId,
        /// Winner's router signal strength
        rssi: Rssi,
        /// How many candidates took part
        candidates: usize,
    },
    /// The only candidate was below the floor; nobody is designated
    InsufficientSignal {
        /// Candidate's signal strength
        rssi: Rssi,
        /// Floor it had to reach
        minimum: Rssi,
    },
    /// Nothing to elect from
    NoCandidates,
}

impl ElectionOutcome {
    /// Winning node, if any
    pub fn winner(&self) -> Option<NodeId> {
        match self {
            ElectionOutcome::Elected { winner, .. } => Some(*winner),
            _ => None,
        }
    }
}

/// Reject a floor outside -100..=-30 dBm.
pub fn check_minimum_rssi(min_rssi: Rssi) -> MeshResult<Rssi> {
    if (MIN_BRIDGE_RSSI_FLOOR..=MIN_BRIDGE_RSSI_CEILING).contains(&min_rssi) {
        Ok(min_rssi)
    } else {
        Err(MeshError::Config(canopy_core::ConfigError::invalid(format!(
            "minimum bridge RSSI must be between {} and {} dBm, got {}",
            MIN_BRIDGE_RSSI_FLOOR, MIN_BRIDGE_RSSI_CEILING, min_rssi
        ))))
    }
}

/// Pick a bridge from `candidates`.
pub fn elect(candidates: &[ElectionCandidate], min_rssi: Rssi) -> ElectionOutcome {
    let best = candidates.iter().max_by(|a, b| {
        a.router_rssi
            .cmp(&b.router_rssi)
            .then_with(|| b.node_id.cmp(&a.node_id))
    });

    let Some(best) = best else {
        return ElectionOutcome::NoCandidates;
    };

    if candidates.len() == 1 && best.router_rssi < min_rssi {
        return ElectionOutcome::InsufficientSignal {
            rssi: best.router_rssi,
            minimum: min_rssi,
        };
    }

    ElectionOutcome::Elected {
        winner: best.node_id,
        rssi: best.router_rssi,
        candidates: candidates.len(),
    }
}

/// One completed election, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    /// When the election completed (ms)
    pub timestamp: u64,
    /// Winning node
    pub winner: NodeId,
    /// Winner's signal
    pub winner_rssi: Rssi,
    /// Number of candidates
    pub candidate_count: usize,
    /// What triggered the election
    pub reason: String,
}

/// Phase of a windowed election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// No election in progress
    Idle,
    /// Collecting candidacies until the deadline
    Collecting {
        /// When the window closes (ms)
        deadline: u64,
    },
}

/// Windowed bridge election: collect candidacies, then evaluate once.
#[derive(Debug)]
pub struct BridgeElection {
    min_rssi: Rssi,
    window_ms: u64,
    phase: ElectionPhase,
    candidates: Vec<ElectionCandidate>,
    reason: String,
    history: VecDeque<ElectionRecord>,
}

impl BridgeElection {
    /// Election with the given floor and collection window.
    pub fn new(min_rssi: Rssi, window_ms: u64) -> MeshResult<Self> {
        Ok(Self {
            min_rssi: check_minimum_rssi(min_rssi)?,
            window_ms,
            phase: ElectionPhase::Idle,
            candidates: Vec::new(),
            reason: String::new(),
            history: VecDeque::with_capacity(MAX_ELECTION_HISTORY),
        })
    }

    /// Change the single-candidate floor.
    pub fn set_minimum_rssi(&mut self, min_rssi: Rssi) -> MeshResult<()> {
        self.min_rssi = check_minimum_rssi(min_rssi)?;
        Ok(())
    }

    /// Current single-candidate floor
    pub fn minimum_rssi(&self) -> Rssi {
        self.min_rssi
    }

    /// Current phase
    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    /// Whether candidacies are being collected
    pub fn is_collecting(&self) -> bool {
        matches!(self.phase, ElectionPhase::Collecting { .. })
    }

    /// Candidates collected so far
    pub fn candidates(&self) -> &[ElectionCandidate] {
        &self.candidates
    }

    /// Open a collection window with the local node as first candidate.
    ///
    /// Returns `false` if an election is already running.
    pub fn start(&mut self, local: ElectionCandidate, reason: &str, now: u64) -> bool {
        if self.is_collecting() {
            debug!(node_id = local.node_id, "Election already running");
            return false;
        }

        self.candidates.clear();
        self.candidates.push(local);
        self.reason = reason.to_string();
        self.phase = ElectionPhase::Collecting {
            deadline: now.saturating_add(self.window_ms),
        };
        info!(node_id = local.node_id, rssi = local.router_rssi, reason, "Bridge election started");
        true
    }

    /// Record a candidacy heard during the window. A repeat from the same
    /// node replaces its earlier entry; candidacies outside a window are
    /// ignored.
    pub fn add_candidate(&mut self, candidate: ElectionCandidate) -> bool {
        if !self.is_collecting() {
            return false;
        }

        match self
            .candidates
            .iter_mut()
            .find(|existing| existing.node_id == candidate.node_id)
        {
            Some(existing) => *existing = candidate,
            None => self.candidates.push(candidate),
        }
        true
    }

    /// Evaluate once the window has closed. Returns `None` while still
    /// collecting or when idle.
    pub fn poll(&mut self, now: u64) -> Option<ElectionOutcome> {
        let ElectionPhase::Collecting { deadline } = self.phase else {
            return None;
        };
        if now < deadline {
            return None;
        }

        let outcome = elect(&self.candidates, self.min_rssi);
        match &outcome {
            ElectionOutcome::Elected {
                winner,
                rssi,
                candidates,
            } => {
                info!(winner, rssi, candidates, "Bridge election winner");
                self.record(ElectionRecord {
                    timestamp: now,
                    winner: *winner,
                    winner_rssi: *rssi,
                    candidate_count: *candidates,
                    reason: self.reason.clone(),
                });
            }
            ElectionOutcome::InsufficientSignal { rssi, minimum } => {
                info!(rssi, minimum, "Bridge election rejected isolated candidate with weak signal");
            }
            ElectionOutcome::NoCandidates => {
                debug!("Bridge election closed without candidates");
            }
        }

        self.phase = ElectionPhase::Idle;
        self.candidates.clear();
        Some(outcome)
    }

    fn record(&mut self, record: ElectionRecord) {
        if self.history.len() == MAX_ELECTION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Most recent elections, oldest first
    pub fn history(&self) -> impl Iterator<Item = &ElectionRecord> {
        self.history.iter()
    }
}
