//! Wire messages exchanged between mesh nodes.
//!
//! Every message travels as a JSON object carrying a numeric `type`
//! discriminator and a `routing` mode (1 = SINGLE, 2 = BROADCAST) next to
//! its camelCase fields. Each type has a fixed schema; there is no open
//! ended document.

use crate::error::{MeshError, MeshResult};
use crate::routing::NodeTree;
use canopy_core::{NodeId, Rssi};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subtree report sent to a neighbor
pub const NODE_SYNC: u16 = 5;
/// Periodic bridge advertisement
pub const BRIDGE_STATUS: u16 = 610;
/// Bridge election candidacy
pub const BRIDGE_ELECTION: u16 = 611;
/// Relay request toward the internet
pub const GATEWAY_DATA: u16 = 620;
/// Relay acknowledgment back to the origin
pub const GATEWAY_ACK: u16 = 621;
/// Gateway liveness advertisement
pub const GATEWAY_HEARTBEAT: u16 = 622;

/// Signal strength a heartbeat must beat (strictly) to be acceptable.
pub const ACCEPTABLE_SIGNAL_FLOOR: Rssi = -70;

/// How a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Destination-addressed, forwarded along the tree
    Single = 1,
    /// Flooded to every node
    Broadcast = 2,
}

impl Routing {
    fn from_wire(raw: u64) -> MeshResult<Self> {
        match raw {
            1 => Ok(Routing::Single),
            2 => Ok(Routing::Broadcast),
            other => Err(MeshError::Malformed(format!("unknown routing mode {}", other))),
        }
    }
}

/// Subtree descriptor from a neighbor (type 5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSync {
    pub from: NodeId,
    pub dest: NodeId,
    /// Sender-rooted view of everything reachable through the sender,
    /// excluding the branch toward `dest`
    pub tree: NodeTree,
}

/// Bridge advertisement (type 610).
///
/// `dest == 0` means the status was broadcast; otherwise it was sent
/// directly to a freshly route-ready neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub from: NodeId,
    #[serde(default)]
    pub dest: NodeId,
    pub internet_connected: bool,
    #[serde(rename = "routerRSSI")]
    pub router_rssi: Rssi,
    pub router_channel: u8,
    pub uptime: u64,
    #[serde(rename = "gatewayIP")]
    pub gateway_ip: String,
    pub timestamp: u64,
}

/// Bridge election candidacy (type 611).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeElection {
    pub from: NodeId,
    #[serde(rename = "routerRSSI")]
    pub router_rssi: Rssi,
    pub uptime: u64,
    pub timestamp: u64,
}

/// Gateway liveness advertisement (type 622).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHeartbeat {
    pub from: NodeId,
    pub is_primary: bool,
    pub has_internet: bool,
    #[serde(rename = "routerRSSI")]
    pub router_rssi: Rssi,
    pub uptime: u64,
    pub timestamp: u64,
}

impl GatewayHeartbeat {
    /// The sender claims primary and has an uplink.
    ///
    /// This is a property of the record itself, unrelated to how old it is.
    pub fn is_healthy(&self) -> bool {
        self.is_primary && self.has_internet
    }

    /// Router signal is strictly better than -70 dBm. `0` means the sender
    /// could not measure it and is never acceptable.
    pub fn has_acceptable_signal(&self) -> bool {
        is_acceptable_signal(self.router_rssi)
    }
}

/// Whether a router signal is good enough for a primary gateway.
/// `0` is an unmeasured signal and never qualifies.
pub fn is_acceptable_signal(rssi: Rssi) -> bool {
    rssi != 0 && rssi > ACCEPTABLE_SIGNAL_FLOOR
}

/// Relay priority, lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GatewayPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl GatewayPriority {
    /// Priority byte as carried on the wire.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire priority byte, treating unknown values as `Low`.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => GatewayPriority::Critical,
            1 => GatewayPriority::High,
            2 => GatewayPriority::Normal,
            _ => GatewayPriority::Low,
        }
    }
}

/// Request to relay a payload to an internet destination (type 620).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDataPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub message_id: u32,
    pub origin_node: NodeId,
    pub timestamp: u64,
    pub priority: u8,
    /// Target address, e.g. an https URL
    pub destination: String,
    pub payload: String,
    pub content_type: String,
    pub retry_count: u8,
    pub requires_ack: bool,
}

/// Outcome of a relay, sent back to the origin (type 621).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAckPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub message_id: u32,
    pub origin_node: NodeId,
    pub success: bool,
    pub http_status: u16,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
}

/// Any message the mesh core understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    NodeSync(NodeSync),
    BridgeStatus(BridgeStatus),
    BridgeElection(BridgeElection),
    GatewayData(GatewayDataPackage),
    GatewayAck(GatewayAckPackage),
    GatewayHeartbeat(GatewayHeartbeat),
}

impl WireMessage {
    /// Numeric type discriminator.
    pub fn message_type(&self) -> u16 {
        match self {
            WireMessage::NodeSync(_) => NODE_SYNC,
            WireMessage::BridgeStatus(_) => BRIDGE_STATUS,
            WireMessage::BridgeElection(_) => BRIDGE_ELECTION,
            WireMessage::GatewayData(_) => GATEWAY_DATA,
            WireMessage::GatewayAck(_) => GATEWAY_ACK,
            WireMessage::GatewayHeartbeat(_) => GATEWAY_HEARTBEAT,
        }
    }

    /// Delivery mode implied by the message and its addressing.
    pub fn routing(&self) -> Routing {
        match self {
            WireMessage::BridgeStatus(status) if status.dest == 0 => Routing::Broadcast,
            WireMessage::BridgeStatus(_) => Routing::Single,
            WireMessage::BridgeElection(_) | WireMessage::GatewayHeartbeat(_) => Routing::Broadcast,
            WireMessage::NodeSync(_) | WireMessage::GatewayData(_) | WireMessage::GatewayAck(_) => {
                Routing::Single
            }
        }
    }

    /// Sending node.
    pub fn sender(&self) -> NodeId {
        match self {
            WireMessage::NodeSync(m) => m.from,
            WireMessage::BridgeStatus(m) => m.from,
            WireMessage::BridgeElection(m) => m.from,
            WireMessage::GatewayData(m) => m.from,
            WireMessage::GatewayAck(m) => m.from,
            WireMessage::GatewayHeartbeat(m) => m.from,
        }
    }

    /// Addressed destination, `None` for broadcasts.
    pub fn dest(&self) -> Option<NodeId> {
        match self {
            WireMessage::NodeSync(m) => Some(m.dest),
            WireMessage::BridgeStatus(m) if m.dest != 0 => Some(m.dest),
            WireMessage::GatewayData(m) => Some(m.dest),
            WireMessage::GatewayAck(m) => Some(m.dest),
            _ => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> MeshResult<String> {
        let mut value = match self {
            WireMessage::NodeSync(m) => serde_json::to_value(m)?,
            WireMessage::BridgeStatus(m) => serde_json::to_value(m)?,
            WireMessage::BridgeElection(m) => serde_json::to_value(m)?,
            WireMessage::GatewayData(m) => serde_json::to_value(m)?,
            WireMessage::GatewayAck(m) => serde_json::to_value(m)?,
            WireMessage::GatewayHeartbeat(m) => serde_json::to_value(m)?,
        };

        let object = value
            .as_object_mut()
            .ok_or_else(|| MeshError::Malformed("message did not serialize to an object".into()))?;
        object.insert("type".to_string(), Value::from(self.message_type()));
        object.insert("routing".to_string(), Value::from(self.routing() as u8));

        Ok(serde_json::to_string(&value)?)
    }

    /// Parse the JSON wire form.
    ///
    /// BRIDGE_STATUS is accepted in either routing mode. Every other type
    /// must arrive in its own mode when `routing` is present.
    pub fn decode(raw: &str) -> MeshResult<Self> {
        let value: Value = serde_json::from_str(raw)?;

        let raw_type = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| MeshError::Malformed("missing numeric type".into()))?;
        let routing = match value.get("routing").and_then(Value::as_u64) {
            Some(raw) => Some(Routing::from_wire(raw)?),
            None => None,
        };
        let kind = u16::try_from(raw_type).map_err(|_| MeshError::UnknownType(raw_type))?;

        let message = match kind {
            NODE_SYNC => WireMessage::NodeSync(serde_json::from_value(value)?),
            BRIDGE_STATUS => WireMessage::BridgeStatus(serde_json::from_value(value)?),
            BRIDGE_ELECTION => WireMessage::BridgeElection(serde_json::from_value(value)?),
            GATEWAY_DATA => WireMessage::GatewayData(serde_json::from_value(value)?),
            GATEWAY_ACK => WireMessage::GatewayAck(serde_json::from_value(value)?),
            GATEWAY_HEARTBEAT => WireMessage::GatewayHeartbeat(serde_json::from_value(value)?),
            _ => return Err(MeshError::UnknownType(raw_type)),
        };

        if let Some(routing) = routing {
            if kind != BRIDGE_STATUS && routing != message.routing() {
                return Err(MeshError::Malformed(format!(
                    "type {} cannot arrive with routing {:?}",
                    kind, routing
                )));
            }
        }

        Ok(message)
    }
}
