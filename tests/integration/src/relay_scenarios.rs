//! `send_to_internet` across several hops

use crate::test_utils::SimulatedMesh;
use canopy_core::NodeConfig;
use canopy_mesh::relay::{DEFAULT_CONTENT_TYPE, ERR_GATEWAY_OFFLINE, ERR_TIMED_OUT};
use canopy_mesh::{GatewayPriority, WireMessage};

const ORIGIN: u32 = 0x0101;
const RELAY: u32 = 0x0202;
const GATEWAY: u32 = 0x0303;

const DESTINATION: &str = "https://api.example.com/readings";
const PAYLOAD: &str = r#"{"temperature":21.5}"#;

/// `ORIGIN -- RELAY -- GATEWAY`, with the gateway's status known everywhere
fn relay_mesh() -> SimulatedMesh {
    let mut mesh = SimulatedMesh::new(1_000);
    mesh.add_node(NodeConfig::new(ORIGIN));
    mesh.add_node(NodeConfig::new(RELAY));
    mesh.add_bridge(GATEWAY, -50);
    mesh.connect(ORIGIN, RELAY);
    mesh.connect(RELAY, GATEWAY);
    mesh.tick_all();
    assert_eq!(mesh.node(ORIGIN).internet_gateway(), GATEWAY);
    mesh
}

fn send(mesh: &mut SimulatedMesh, priority: GatewayPriority) -> u32 {
    let id = mesh
        .node_mut(ORIGIN)
        .send_to_internet(DESTINATION, PAYLOAD, priority)
        .message_id()
        .expect("request pending");
    mesh.pump();
    id
}

fn data_frame_to_gateway(mesh: &SimulatedMesh) -> WireMessage {
    mesh.deliveries()
        .iter()
        .find(|delivery| {
            delivery.to == GATEWAY && matches!(delivery.message, WireMessage::GatewayData(_))
        })
        .map(|delivery| delivery.message.clone())
        .expect("data package reached gateway")
}

#[test]
fn test_request_is_relayed_and_acknowledged_end_to_end() {
    let mut mesh = relay_mesh();

    let id = send(&mut mesh, GatewayPriority::High);

    let requests = mesh.relay_requests(GATEWAY);
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.message_id, id);
    assert_eq!(request.origin_node, ORIGIN);
    assert_eq!(request.destination, DESTINATION);
    assert_eq!(request.payload, PAYLOAD);
    assert_eq!(request.content_type, DEFAULT_CONTENT_TYPE);
    assert_eq!(request.priority, GatewayPriority::High);
    assert_eq!(request.attempt, 0);

    mesh.node_mut(GATEWAY).complete_relay(id, ORIGIN, 200, "");
    mesh.pump();

    let results = mesh.internet_results(ORIGIN);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].message_id, id);
    assert!(results[0].success);
    assert_eq!(results[0].http_status, 200);
    assert!(results[0].error.is_empty());
    assert_eq!(mesh.node(ORIGIN).pending_internet_request_count(), 0);

    let metrics = mesh.node(GATEWAY).gateway_metrics();
    assert_eq!(metrics.messages_processed, 1);
    assert_eq!(metrics.acknowledgments_sent, 1);
}

#[test]
fn test_server_errors_are_retried_by_gateway() {
    let mut mesh = relay_mesh();
    let id = send(&mut mesh, GatewayPriority::Normal);

    mesh.node_mut(GATEWAY).complete_relay(id, ORIGIN, 503, "");
    mesh.pump();
    assert!(mesh.internet_results(ORIGIN).is_empty());

    mesh.run_for(1_000);

    let attempts: Vec<u8> = mesh
        .relay_requests(GATEWAY)
        .iter()
        .map(|request| request.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1]);

    mesh.node_mut(GATEWAY).complete_relay(id, ORIGIN, 200, "");
    mesh.pump();

    let results = mesh.internet_results(ORIGIN);
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
}

#[test]
fn test_terminal_client_error_is_reported_without_retry() {
    let mut mesh = relay_mesh();
    let id = send(&mut mesh, GatewayPriority::Low);

    mesh.node_mut(GATEWAY).complete_relay(id, ORIGIN, 404, "Not Found");
    mesh.pump();
    mesh.run_for(10_000);

    assert_eq!(mesh.relay_requests(GATEWAY).len(), 1);
    let results = mesh.internet_results(ORIGIN);
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].http_status, 404);
    assert_eq!(results[0].error, "Not Found");
}

#[test]
fn test_duplicate_packages_are_processed_once() {
    let mut mesh = relay_mesh();
    let id = send(&mut mesh, GatewayPriority::Critical);
    let frame = data_frame_to_gateway(&mesh);

    mesh.deliver(RELAY, GATEWAY, frame.clone());
    mesh.pump();
    assert_eq!(mesh.relay_requests(GATEWAY).len(), 1);

    mesh.node_mut(GATEWAY).complete_relay(id, ORIGIN, 200, "");
    mesh.pump();
    mesh.deliver(RELAY, GATEWAY, frame);
    mesh.pump();

    assert_eq!(mesh.relay_requests(GATEWAY).len(), 1);
    assert_eq!(mesh.internet_results(ORIGIN).len(), 1);

    let metrics = mesh.node(GATEWAY).gateway_metrics();
    assert_eq!(metrics.messages_processed, 1);
    assert_eq!(metrics.duplicates_detected, 2);
    assert_eq!(metrics.acknowledgments_sent, 1);
}

#[test]
fn test_unanswered_request_times_out() {
    let mut mesh = relay_mesh();
    let id = send(&mut mesh, GatewayPriority::Normal);

    mesh.run_for(29_000);
    assert_eq!(mesh.node(ORIGIN).pending_internet_request_count(), 1);

    mesh.run_for(1_000);

    let results = mesh.internet_results(ORIGIN);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].message_id, id);
    assert_eq!(results[0].error, ERR_TIMED_OUT);
    assert_eq!(mesh.node(ORIGIN).pending_internet_request_count(), 0);
}

#[test]
fn test_gateway_without_uplink_answers_with_failure() {
    let mut mesh = relay_mesh();
    mesh.node_mut(ORIGIN)
        .send_to_internet(DESTINATION, PAYLOAD, GatewayPriority::Normal)
        .message_id()
        .expect("request pending");
    mesh.node_mut(GATEWAY).set_uplink(false, -50);
    mesh.pump();

    assert!(mesh.relay_requests(GATEWAY).is_empty());
    let results = mesh.internet_results(ORIGIN);
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].error, ERR_GATEWAY_OFFLINE);
    assert!(!mesh.node(ORIGIN).has_internet_connection());
}
