//! Tree formation, loop rejection and healing

use crate::test_utils::SimulatedMesh;
use canopy_core::NodeConfig;
use canopy_mesh::{MeshError, MeshEvent};

const A: u32 = 1;
const B: u32 = 2;
const C: u32 = 3;

fn chain() -> SimulatedMesh {
    let mut mesh = SimulatedMesh::new(1_000);
    for id in [A, B, C] {
        mesh.add_node(NodeConfig::new(id));
    }
    mesh.connect(A, B);
    mesh.connect(B, C);
    mesh
}

fn next_hop(mesh: &SimulatedMesh, from: u32, to: u32) -> Option<u32> {
    mesh.node(from).routing().find_route(to).map(|conn| conn.neighbor())
}

#[test]
fn test_multi_hop_routes_form_along_chain() {
    let mesh = chain();

    assert_eq!(next_hop(&mesh, A, C), Some(B));
    assert_eq!(next_hop(&mesh, C, A), Some(B));
    assert_eq!(next_hop(&mesh, B, A), Some(A));
    assert_eq!(next_hop(&mesh, B, C), Some(C));
    assert_eq!(mesh.node(A).routing().node_list(true), vec![A, B, C]);
    assert!(mesh.errors().is_empty());
}

#[test]
fn test_route_ready_events_name_direct_neighbors_only() {
    let mesh = chain();

    let ready: Vec<u32> = mesh
        .events(B)
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::RouteReady { neighbor } => Some(neighbor),
            _ => None,
        })
        .collect();
    assert_eq!(ready, vec![A, C]);

    assert!(!mesh
        .events(A)
        .iter()
        .any(|event| *event == MeshEvent::RouteReady { neighbor: C }));
}

#[test]
fn test_closing_a_cycle_is_rejected() {
    let mut mesh = chain();

    mesh.connect(C, A);

    assert!(mesh
        .errors()
        .iter()
        .any(|(_, e)| matches!(e, MeshError::SubtreeLoop { .. })));
    assert_eq!(next_hop(&mesh, A, C), Some(B));
    assert!(!mesh.node(A).routing().connection(C).unwrap().is_ready());
}

#[test]
fn test_mesh_heals_through_standby_link() {
    let mut mesh = chain();
    mesh.connect(C, A);

    mesh.disconnect(B, C);

    assert_eq!(next_hop(&mesh, A, C), Some(C));
    assert_eq!(next_hop(&mesh, C, B), Some(A));
    assert_eq!(next_hop(&mesh, B, C), Some(A));

    let lost = mesh.events(B).into_iter().find_map(|event| match event {
        MeshEvent::LinkLost {
            neighbor,
            unreachable,
        } => Some((neighbor, unreachable)),
        _ => None,
    });
    assert_eq!(lost, Some((C, vec![C])));
}

#[test]
fn test_partition_makes_far_side_unreachable() {
    let mut mesh = chain();

    mesh.disconnect(A, B);

    assert!(!mesh.node(A).has_active_mesh_connections());
    assert!(!mesh.node(A).routing().is_reachable(C));
    assert!(!mesh.node(C).routing().is_reachable(A));
    assert!(mesh.node(C).routing().is_reachable(B));

    let lost = mesh.events(A).into_iter().find_map(|event| match event {
        MeshEvent::LinkLost { unreachable, .. } => Some(unreachable),
        _ => None,
    });
    assert_eq!(lost, Some(vec![B, C]));
}

#[test]
fn test_topology_json_describes_whole_tree() {
    let mesh = chain();

    let json = mesh.node(B).routing().topology_json(false).unwrap();
    let tree: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(tree["nodeId"], B);
    let subs = tree["subs"].as_array().unwrap();
    assert_eq!(subs.len(), 2);
}
