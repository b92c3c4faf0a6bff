//! Canopy Mesh - self-healing wireless mesh layer
//!
//! Keeps a tree-shaped mesh routable while links come and go, elects and
//! tracks the bridges that give the mesh internet access, fails over between
//! gateways, and relays requests from any node to the internet with
//! at-most-once processing.
//!
//! # Core Components
//!
//! - **Routing tree**: per-link `Established -> RouteReady` state machine and
//!   loop-free subtree bookkeeping
//! - **Bridge election**: RSSI-based choice of the node that uplinks to the
//!   router
//! - **Bridge registry**: health-checked view of known bridges
//! - **Gateway heartbeats**: primary gateway election and failover
//! - **Relay**: `send_to_internet` requests, deduplication and acknowledgment
//! - **Scheduler / RTC**: deterministic timers and offline wall-clock time
//!
//! Everything is single-threaded and driven by an explicit clock, so a whole
//! mesh can be simulated deterministically in tests.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use canopy_core::{NodeConfig, SystemClock};
//! use canopy_mesh::{GatewayPriority, MeshEvent, MeshNode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut node = MeshNode::new(NodeConfig::new(0x1234), SystemClock::new())?;
//! node.subscribe(|event| {
//!     if let MeshEvent::InternetResult(result) = event {
//!         println!("request {} -> {}", result.message_id, result.http_status);
//!     }
//! });
//!
//! node.link_up(0x5678)?;
//! node.send_to_internet("https://api.example.com/data", "{}", GatewayPriority::Normal);
//! node.tick();
//!
//! for frame in node.drain_outbox() {
//!     println!("{}", frame.message().encode()?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bridge;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod relay;
pub mod retry;
pub mod routing;
pub mod rtc;
pub mod scheduler;
pub mod tracker;
pub mod wire;

// Re-export main types
pub use bridge::{BridgeChange, BridgeInfo, BridgeRegistry, BridgeStatusUpdate, BridgeUpdate};
pub use election::{elect, BridgeElection, ElectionCandidate, ElectionOutcome, ElectionRecord};
pub use error::{MeshError, MeshResult};
pub use heartbeat::{ElectionResult, ElectionState, GatewayElectionManager};
pub use node::{BridgeStatusReport, MeshEvent, MeshNode, Outbound};
pub use relay::{
    GatewayRelay, InternetRelay, InternetRequest, InternetResult, MessageIdGenerator,
    PendingInternetRequest, RelayRequest,
};
pub use retry::{backoff_delay, HttpOutcome};
pub use routing::{Connection, LinkState, NodeTree, RoutingTree, SubtreeUpdate};
pub use rtc::{FailingRtc, FailureMode, RtcKind, RtcManager, SoftwareRtc, TimeSource};
pub use scheduler::{Scheduler, TaskId};
pub use tracker::{GatewayMetrics, MessageKey, MessageTracker};
pub use wire::{
    BridgeStatus, GatewayAckPackage, GatewayDataPackage, GatewayHeartbeat, GatewayPriority,
    NodeSync, Routing, WireMessage,
};
