//! Primary gateway election over heartbeats, and failover when the
//! primary goes silent

use crate::test_utils::{gateway_config, SimulatedMesh};
use canopy_core::{NodeConfig, NO_NODE};
use canopy_mesh::{ElectionState, GatewayPriority, MeshEvent};

const GATEWAY_1: u32 = 0x1001;
const GATEWAY_2: u32 = 0x1002;
const RELAY: u32 = 0x2001;

/// Two bridges with internet joined through a plain relay:
/// `GATEWAY_1 (-40) -- RELAY -- GATEWAY_2 (-55)`
fn two_gateway_mesh() -> SimulatedMesh {
    let mut mesh = SimulatedMesh::new(0);
    for (id, rssi) in [(GATEWAY_1, -40), (GATEWAY_2, -55)] {
        let mut config = gateway_config(id);
        config.is_bridge = true;
        mesh.add_node(config).set_uplink(true, rssi);
    }
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.connect(GATEWAY_1, RELAY);
    mesh.connect(RELAY, GATEWAY_2);
    mesh
}

fn elected(mesh: &SimulatedMesh, node_id: u32) -> Vec<(u32, bool)> {
    mesh.events(node_id)
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::GatewayElected { winner, is_local } => Some((winner, is_local)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_strongest_gateway_wins_heartbeat_election() {
    let mut mesh = two_gateway_mesh();

    mesh.run_until(5_000);

    assert!(mesh.node(GATEWAY_1).gateway_election().is_elected_primary());
    assert!(!mesh.node(GATEWAY_2).gateway_election().is_elected_primary());
    assert_eq!(elected(&mesh, GATEWAY_1), vec![(GATEWAY_1, true)]);
    assert_eq!(elected(&mesh, GATEWAY_2), vec![(GATEWAY_1, false)]);
    assert_eq!(
        mesh.node(GATEWAY_2).gateway_election().state(),
        ElectionState::Cooldown
    );
}

#[test]
fn test_relay_adopts_primary_claim_from_heartbeat() {
    let mut mesh = two_gateway_mesh();
    mesh.run_until(5_000);
    assert_eq!(mesh.node(RELAY).gateway_election().primary_gateway_id(), NO_NODE);

    mesh.run_until(15_000);

    let relay = mesh.node(RELAY);
    assert_eq!(relay.gateway_election().primary_gateway_id(), GATEWAY_1);
    assert_eq!(relay.internet_gateway(), GATEWAY_1);
    assert_eq!(relay.gateway_election().candidate_count(), 2);
}

#[test]
fn test_failover_to_backup_gateway_after_primary_silence() {
    let mut mesh = two_gateway_mesh();
    mesh.run_until(20_000);
    assert_eq!(mesh.node(RELAY).internet_gateway(), GATEWAY_1);

    mesh.disconnect(GATEWAY_1, RELAY);

    // Still in cooldown from the first election: no failover yet.
    mesh.run_until(60_000);
    assert!(!mesh.node(GATEWAY_2).gateway_election().is_elected_primary());

    mesh.run_until(100_000);

    let backup = mesh.node(GATEWAY_2);
    assert!(backup.gateway_election().is_elected_primary());
    assert!(elected(&mesh, GATEWAY_2).contains(&(GATEWAY_2, true)));

    let relay = mesh.node(RELAY);
    assert_eq!(relay.gateway_election().primary_gateway_id(), GATEWAY_2);
    assert_eq!(relay.internet_gateway(), GATEWAY_2);
}

#[test]
fn test_requests_follow_failover() {
    let mut mesh = two_gateway_mesh();
    mesh.run_until(20_000);
    mesh.disconnect(GATEWAY_1, RELAY);
    mesh.run_until(100_000);

    let id = mesh
        .node_mut(RELAY)
        .send_to_internet("https://api.example.com/telemetry", "{}", GatewayPriority::Normal)
        .message_id()
        .expect("request pending");
    mesh.pump();

    let requests = mesh.relay_requests(GATEWAY_2);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message_id, id);
    assert_eq!(requests[0].origin_node, RELAY);
    assert!(mesh.relay_requests(GATEWAY_1).is_empty());
}

const STRONG_GATEWAY: u32 = 0x3001;
const WEAK_GATEWAY: u32 = 0x3002;

#[test]
fn test_competing_primary_claims_converge_on_stronger_gateway() {
    // Each gateway elects itself while it is alone.
    let mut mesh = SimulatedMesh::new(0);
    for (id, rssi) in [(STRONG_GATEWAY, -45), (WEAK_GATEWAY, -62)] {
        let mut config = gateway_config(id);
        config.is_bridge = true;
        mesh.add_node(config).set_uplink(true, rssi);
    }
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.connect(STRONG_GATEWAY, RELAY);

    mesh.run_until(16_000);
    assert!(mesh.node(STRONG_GATEWAY).gateway_election().is_elected_primary());
    assert!(mesh.node(WEAK_GATEWAY).gateway_election().is_elected_primary());
    assert_eq!(mesh.node(RELAY).internet_gateway(), STRONG_GATEWAY);

    // Joining the partitions puts two primary claims in front of the relay.
    // The weaker claim is delivered last on every heartbeat round.
    mesh.connect(RELAY, WEAK_GATEWAY);
    mesh.run_until(30_000);

    let relay = mesh.node(RELAY);
    assert_eq!(relay.gateway_election().primary_gateway_id(), STRONG_GATEWAY);
    assert_eq!(relay.internet_gateway(), STRONG_GATEWAY);
    assert!(!mesh.node(WEAK_GATEWAY).gateway_election().is_elected_primary());
    assert_eq!(
        mesh.node(WEAK_GATEWAY).gateway_election().primary_gateway_id(),
        STRONG_GATEWAY
    );

    mesh.run_until(60_000);
    assert_eq!(mesh.node(RELAY).internet_gateway(), STRONG_GATEWAY);
    assert!(mesh.node(STRONG_GATEWAY).gateway_election().is_elected_primary());
}
