//! Simulated radio and clock for multi-node scenarios

use canopy_core::{Clock, ManualClock, NodeConfig, NodeId, Rssi};
use canopy_mesh::{
    InternetResult, MeshError, MeshEvent, MeshNode, Outbound, RelayRequest, WireMessage,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::debug;

/// Delivery rounds before a mesh is considered to be flooding itself
const MAX_PUMP_ROUNDS: usize = 64;

/// SSID used by every gateway-capable test node
pub const TEST_ROUTER_SSID: &str = "canopy-uplink";

/// Install a fmt subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Configuration for a node that may stand in gateway elections
pub fn gateway_config(node_id: NodeId) -> NodeConfig {
    let mut config = NodeConfig::new(node_id);
    config.gateway.enabled = true;
    config.gateway.router_ssid = TEST_ROUTER_SSID.to_string();
    config
}

/// Configuration for a node that already uplinks to the router
pub fn bridge_config(node_id: NodeId) -> NodeConfig {
    let mut config = NodeConfig::new(node_id);
    config.is_bridge = true;
    config
}

/// A frame that made it across a simulated link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub message: WireMessage,
}

/// A set of mesh nodes joined by lossless, instantaneous links
pub struct SimulatedMesh {
    clock: ManualClock,
    nodes: BTreeMap<NodeId, MeshNode<ManualClock>>,
    events: BTreeMap<NodeId, Rc<RefCell<Vec<MeshEvent>>>>,
    links: BTreeSet<(NodeId, NodeId)>,
    deliveries: Vec<Delivery>,
    errors: Vec<(NodeId, MeshError)>,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl SimulatedMesh {
    /// Empty mesh whose clock starts at `start_ms`
    pub fn new(start_ms: u64) -> Self {
        init_tracing();
        Self {
            clock: ManualClock::at(start_ms),
            nodes: BTreeMap::new(),
            events: BTreeMap::new(),
            links: BTreeSet::new(),
            deliveries: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Add a node and start recording its events
    pub fn add_node(&mut self, config: NodeConfig) -> &mut MeshNode<ManualClock> {
        let node_id = config.node_id;
        let mut node = MeshNode::new(config, self.clock.clone()).expect("valid node config");

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        node.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        self.events.insert(node_id, events);
        self.nodes.insert(node_id, node);
        self.node_mut(node_id)
    }

    /// Add a bridge that already has internet access
    pub fn add_bridge(&mut self, node_id: NodeId, router_rssi: Rssi) -> &mut MeshNode<ManualClock> {
        let node = self.add_node(bridge_config(node_id));
        node.set_uplink(true, router_rssi);
        node
    }

    pub fn node(&self, node_id: NodeId) -> &MeshNode<ManualClock> {
        self.nodes.get(&node_id).expect("node exists")
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> &mut MeshNode<ManualClock> {
        self.nodes.get_mut(&node_id).expect("node exists")
    }

    /// Bring up the link between `a` and `b` and let the subtree exchange
    /// settle
    pub fn connect(&mut self, a: NodeId, b: NodeId) {
        self.links.insert(link_key(a, b));
        self.node_mut(a).link_up(b).expect("link a->b");
        self.node_mut(b).link_up(a).expect("link b->a");
        self.pump();
    }

    /// Drop the link between `a` and `b` on both ends
    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        self.links.remove(&link_key(a, b));
        self.node_mut(a).link_down(b).expect("unlink a->b");
        self.node_mut(b).link_down(a).expect("unlink b->a");
        self.pump();
    }

    pub fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.contains(&link_key(a, b))
    }

    fn neighbors_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.links
            .iter()
            .filter_map(|&(a, b)| match node_id {
                id if id == a => Some(b),
                id if id == b => Some(a),
                _ => None,
            })
            .collect()
    }

    /// Encode `message` and hand it to `to` as if it arrived from `from`.
    /// Frames on a link that no longer exists are lost.
    pub fn deliver(&mut self, from: NodeId, to: NodeId, message: WireMessage) {
        if !self.is_linked(from, to) {
            debug!(from, to, "Frame lost on missing link");
            return;
        }
        let raw = message.encode().expect("frame encodes");
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if let Err(e) = node.handle_message(from, &raw) {
            debug!(from, to, error = %e, "Frame rejected");
            self.errors.push((to, e));
        }
        self.deliveries.push(Delivery { from, to, message });
    }

    /// Deliver queued frames until every outbox is empty
    pub fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut outgoing = Vec::new();
            for (&node_id, node) in self.nodes.iter_mut() {
                outgoing.extend(node.drain_outbox().into_iter().map(|frame| (node_id, frame)));
            }
            if outgoing.is_empty() {
                return;
            }

            for (from, frame) in outgoing {
                match frame {
                    Outbound::Single { next_hop, message } => self.deliver(from, next_hop, message),
                    Outbound::Broadcast { except, message } => {
                        for neighbor in self.neighbors_of(from) {
                            if Some(neighbor) != except {
                                self.deliver(from, neighbor, message.clone());
                            }
                        }
                    }
                }
            }
        }
        panic!("mesh did not quiesce after {MAX_PUMP_ROUNDS} rounds");
    }

    /// Tick every node at the current time, then deliver what they sent
    pub fn tick_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.tick();
        }
        self.pump();
    }

    /// Move time forward by `duration_ms`, stopping at every due task
    pub fn run_for(&mut self, duration_ms: u64) {
        let end = self.now() + duration_ms;
        loop {
            let now = self.now();
            let next = self
                .nodes
                .values()
                .filter_map(|node| node.next_due())
                .min()
                .map(|due| due.max(now));

            match next {
                Some(due) if due <= end => {
                    self.clock.set(due);
                    self.tick_all();
                }
                _ => {
                    self.clock.set(end);
                    self.tick_all();
                    return;
                }
            }
        }
    }

    /// Run until the clock reads `at_ms`
    pub fn run_until(&mut self, at_ms: u64) {
        let now = self.now();
        self.run_for(at_ms.saturating_sub(now));
    }

    /// Every event `node_id` has published
    pub fn events(&self, node_id: NodeId) -> Vec<MeshEvent> {
        self.events
            .get(&node_id)
            .map(|events| events.borrow().clone())
            .unwrap_or_default()
    }

    /// Forget the events recorded so far for `node_id`
    pub fn clear_events(&self, node_id: NodeId) {
        if let Some(events) = self.events.get(&node_id) {
            events.borrow_mut().clear();
        }
    }

    /// HTTP calls `node_id` has been asked to make
    pub fn relay_requests(&self, node_id: NodeId) -> Vec<RelayRequest> {
        self.events(node_id)
            .into_iter()
            .filter_map(|event| match event {
                MeshEvent::RelayRequested(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Resolved `send_to_internet` requests of `node_id`
    pub fn internet_results(&self, node_id: NodeId) -> Vec<InternetResult> {
        self.events(node_id)
            .into_iter()
            .filter_map(|event| match event {
                MeshEvent::InternetResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Frames a node refused, with the refusing node
    pub fn errors(&self) -> &[(NodeId, MeshError)] {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_makes_both_ends_route_ready() {
        let mut mesh = SimulatedMesh::new(1_000);
        mesh.add_node(NodeConfig::new(1));
        mesh.add_node(NodeConfig::new(2));

        mesh.connect(1, 2);

        assert!(mesh.node(1).routing().is_reachable(2));
        assert!(mesh.node(2).routing().is_reachable(1));
        assert!(mesh.errors().is_empty());
    }

    #[test]
    fn test_frames_on_missing_links_are_lost() {
        let mut mesh = SimulatedMesh::new(0);
        mesh.add_node(NodeConfig::new(1));
        mesh.add_node(NodeConfig::new(2));
        let before = mesh.deliveries().len();

        mesh.node_mut(1).link_up(2).unwrap();
        mesh.pump();

        assert_eq!(mesh.deliveries().len(), before);
        assert!(!mesh.node(1).routing().is_reachable(2));
    }

    #[test]
    fn test_run_for_advances_clock_to_end() {
        let mut mesh = SimulatedMesh::new(500);
        mesh.add_node(NodeConfig::new(1));

        mesh.run_for(2_750);

        assert_eq!(mesh.now(), 3_250);
        assert!(mesh.node(1).next_due().unwrap() > 3_250);
    }
}
