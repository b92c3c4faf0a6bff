//! Core types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a mesh node.
///
/// Assigned externally (hardware-derived) and immutable for the node's
/// lifetime. `0` is reserved to mean "no node".
pub type NodeId = u32;

/// Sentinel id meaning "no node", used where the wire format and APIs
/// report an absent gateway or bridge.
pub const NO_NODE: NodeId = 0;

/// Router signal strength in dBm (range -127..=0, 0 meaning unknown).
pub type Rssi = i8;

/// Role a node plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Node with a direct upstream connection
    Bridge,
    /// Root of the spanning tree without an upstream connection
    Root,
    /// Ordinary mesh member
    Regular,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Bridge => "bridge",
            NodeRole::Root => "root",
            NodeRole::Regular => "regular",
        };
        f.write_str(name)
    }
}
