//! Error types for Canopy mesh operations.
//!
//! Only structural failures live here. Routine outcomes such as "no route",
//! a rejected single-candidate election or a duplicate message are modelled
//! as `Option`, `bool` or outcome enums by the components that produce them.

use canopy_core::NodeId;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Operation referenced a neighbor with no link
    #[error("No link to neighbor {neighbor}")]
    UnknownLink { neighbor: NodeId },

    /// Neighbor tried to open a second link
    #[error("Link to neighbor {neighbor} already exists")]
    DuplicateLink { neighbor: NodeId },

    /// A reported subtree would break the tree property
    #[error("Subtree from {neighbor} contains node {node_id} already reachable elsewhere")]
    SubtreeLoop { neighbor: NodeId, node_id: NodeId },

    /// Wire payload could not be decoded
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Wire payload carried an unknown type discriminator
    #[error("Unknown message type: {0}")]
    UnknownType(u64),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] canopy_core::ConfigError),

    /// Real-time clock errors
    #[error("RTC error: {0}")]
    Rtc(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
