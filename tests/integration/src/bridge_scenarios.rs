//! Bridge discovery, health and election across a live mesh

use crate::test_utils::{gateway_config, SimulatedMesh};
use canopy_core::{NodeConfig, NodeRole, NO_NODE};
use canopy_mesh::{ElectionOutcome, MeshEvent};

const BRIDGE_A: u32 = 0xA001;
const NODE_B: u32 = 0xB002;
const NODE_C: u32 = 0xC003;
const RELAY: u32 = 0xD004;

fn has_event(mesh: &SimulatedMesh, node_id: u32, wanted: &MeshEvent) -> bool {
    mesh.events(node_id).iter().any(|event| event == wanted)
}

#[test]
fn test_new_neighbor_learns_bridge_on_route_ready() {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_bridge(BRIDGE_A, -63);
    mesh.add_node(NodeConfig::new(NODE_B));

    mesh.connect(BRIDGE_A, NODE_B);

    let report = mesh.node(NODE_B).bridge_status();
    assert!(!report.is_bridge);
    assert!(report.internet_connected);
    assert_eq!(report.role, NodeRole::Regular);
    assert_eq!(report.bridge_node_id, BRIDGE_A);
    assert_eq!(report.bridge_rssi, -63);
    assert!(has_event(
        &mesh,
        NODE_B,
        &MeshEvent::GatewayChanged {
            old: NO_NODE,
            new: BRIDGE_A
        }
    ));
    assert_eq!(mesh.node(BRIDGE_A).bridge_status().role, NodeRole::Bridge);
}

#[test]
fn test_bridge_status_floods_past_first_hop() {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_bridge(BRIDGE_A, -55);
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.add_node(NodeConfig::new(NODE_B));
    mesh.connect(BRIDGE_A, RELAY);
    mesh.connect(RELAY, NODE_B);
    assert!(!mesh.node(NODE_B).has_internet_connection());

    mesh.tick_all();

    assert!(mesh.node(NODE_B).has_internet_connection());
    assert_eq!(mesh.node(NODE_B).bridges().primary_id(mesh.now()), BRIDGE_A);
}

#[test]
fn test_strongest_bridge_becomes_primary() {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_bridge(BRIDGE_A, -63);
    mesh.add_bridge(NODE_C, -48);
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.connect(BRIDGE_A, RELAY);
    mesh.connect(RELAY, NODE_C);
    mesh.tick_all();

    let relay = mesh.node(RELAY);
    assert_eq!(relay.bridges().gateway_count(mesh.now()), 2);
    assert_eq!(relay.bridge_status().bridge_node_id, NODE_C);
    assert_eq!(relay.internet_gateway(), NODE_C);
}

#[test]
fn test_silent_bridge_expires_and_weak_orphan_is_not_promoted() {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_bridge(BRIDGE_A, -63);
    mesh.add_node(gateway_config(NODE_B)).set_uplink(false, -87);
    mesh.connect(BRIDGE_A, NODE_B);
    mesh.tick_all();
    assert!(mesh.node(NODE_B).has_internet_connection());

    mesh.run_until(2_000);
    mesh.disconnect(BRIDGE_A, NODE_B);
    mesh.run_until(59_000);
    assert!(mesh.node(NODE_B).has_internet_connection());

    mesh.run_until(70_000);

    let node_b = mesh.node(NODE_B);
    assert!(!node_b.has_internet_connection());
    assert!(!node_b.is_bridge());
    assert!(node_b.election_history().is_empty());
    assert!(has_event(
        &mesh,
        NODE_B,
        &MeshEvent::BridgeElectionCompleted(ElectionOutcome::InsufficientSignal {
            rssi: -87,
            minimum: -80,
        })
    ));

    mesh.connect(BRIDGE_A, NODE_B);
    assert!(mesh.node(NODE_B).has_internet_connection());
    assert_eq!(mesh.node(NODE_B).bridge_status().bridge_node_id, BRIDGE_A);
}

#[test]
fn test_strongest_candidate_is_promoted_to_bridge() {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_node(gateway_config(NODE_B)).set_uplink(false, -87);
    mesh.add_node(gateway_config(NODE_C)).set_uplink(true, -70);
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.connect(NODE_B, RELAY);
    mesh.connect(RELAY, NODE_C);

    mesh.run_until(7_000);

    assert!(mesh.node(NODE_C).is_bridge());
    assert!(!mesh.node(NODE_B).is_bridge());
    assert!(has_event(
        &mesh,
        NODE_B,
        &MeshEvent::BridgeElectionCompleted(ElectionOutcome::Elected {
            winner: NODE_C,
            rssi: -70,
            candidates: 2,
        })
    ));

    let history = mesh.node(NODE_C).election_history();
    let last = history.last().expect("election recorded");
    assert_eq!(last.winner, NODE_C);
    assert_eq!(last.candidate_count, 2);

    assert_eq!(mesh.node(NODE_B).bridge_status().bridge_node_id, NODE_C);
    assert!(mesh.node(RELAY).has_internet_connection());
}
