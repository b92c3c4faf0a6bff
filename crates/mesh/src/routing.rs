//! Routing tree - spanning-tree links and route resolution
//!
//! Each direct link is a [`Connection`] carrying the set of nodes reachable
//! through it. The routing table is never stored separately: it is the
//! union of every ready connection's subtree plus the local node.
//!
//! A link moves through two states. It is `Established` as soon as the
//! radio layer reports it, and becomes `RouteReady` only once the neighbor's
//! subtree has been applied. Route lookups ignore links that are not ready,
//! so anything reacting to a new link must wait for the ready transition.

use crate::error::{MeshError, MeshResult};
use canopy_core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Serializable subtree descriptor.
///
/// The node named by `node_id` is the root of this view; `subs` are the
/// branches hanging off it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTree {
    /// Node at the top of this branch
    pub node_id: NodeId,
    /// Whether this node is the designated mesh root
    #[serde(default)]
    pub root: bool,
    /// Child branches
    #[serde(default)]
    pub subs: Vec<NodeTree>,
}

impl NodeTree {
    /// A single node with nothing behind it.
    pub fn leaf(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: false,
            subs: Vec::new(),
        }
    }

    /// A node with the given child branches.
    pub fn with_subs(node_id: NodeId, subs: Vec<NodeTree>) -> Self {
        Self {
            node_id,
            root: false,
            subs,
        }
    }

    /// Every node id in this tree, depth first, including repeats.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.node_id);
        for sub in &self.subs {
            sub.collect_ids(out);
        }
    }

    /// Whether `node_id` appears anywhere in the tree.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.node_id == node_id || self.subs.iter().any(|sub| sub.contains(node_id))
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.subs.iter().map(NodeTree::size).sum::<usize>()
    }

    /// Whether any node in the tree is flagged as root.
    pub fn contains_root(&self) -> bool {
        self.root || self.subs.iter().any(NodeTree::contains_root)
    }
}

/// Lifecycle of a direct link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Link is up, subtree unknown; not routable yet
    Established,
    /// Subtree applied at least once; route lookups are valid
    RouteReady,
}

/// Logical link to a directly reachable neighbor
#[derive(Debug, Clone)]
pub struct Connection {
    neighbor: NodeId,
    state: LinkState,
    subtree: NodeTree,
    reachable: BTreeSet<NodeId>,
    established_at: u64,
    last_sync: Option<u64>,
}

impl Connection {
    fn new(neighbor: NodeId, now: u64) -> Self {
        Self {
            neighbor,
            state: LinkState::Established,
            subtree: NodeTree::leaf(neighbor),
            reachable: BTreeSet::new(),
            established_at: now,
            last_sync: None,
        }
    }

    /// Neighbor at the far end of this link
    pub fn neighbor(&self) -> NodeId {
        self.neighbor
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether route lookups may use this link
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::RouteReady
    }

    /// Whether `node_id` is reachable through this link
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.reachable.contains(&node_id)
    }

    /// Last subtree reported by the neighbor
    pub fn subtree(&self) -> &NodeTree {
        &self.subtree
    }

    /// Nodes reachable through this link, empty until ready
    pub fn reachable(&self) -> &BTreeSet<NodeId> {
        &self.reachable
    }

    /// When the link came up
    pub fn established_at(&self) -> u64 {
        self.established_at
    }

    /// When the subtree was last applied
    pub fn last_sync(&self) -> Option<u64> {
        self.last_sync
    }
}

/// Result of applying a neighbor's subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeUpdate {
    /// First subtree for this link: it just became route-ready
    BecameReady,
    /// Reachable set changed on an already ready link
    Updated,
    /// Same reachable set as before
    Unchanged,
}

/// Spanning tree of direct links
#[derive(Debug)]
pub struct RoutingTree {
    /// Local node ID
    node_id: NodeId,
    /// Whether the local node is the designated root
    root: bool,
    /// Direct links: neighbor -> Connection
    connections: BTreeMap<NodeId, Connection>,
}

impl RoutingTree {
    /// Create an empty tree for `node_id`
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: false,
            connections: BTreeMap::new(),
        }
    }

    /// Local node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Mark the local node as the mesh root
    pub fn set_root(&mut self, root: bool) {
        self.root = root;
    }

    /// Whether the local node is the mesh root
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Record a new physical link. The link is not routable until
    /// [`apply_subtree`](Self::apply_subtree) succeeds for it.
    pub fn link_established(&mut self, neighbor: NodeId, now: u64) -> MeshResult<()> {
        if neighbor == self.node_id {
            return Err(MeshError::InvalidState("link to self".to_string()));
        }
        if self.connections.contains_key(&neighbor) {
            return Err(MeshError::DuplicateLink { neighbor });
        }

        debug!(node_id = self.node_id, neighbor, "Link established");
        self.connections.insert(neighbor, Connection::new(neighbor, now));
        Ok(())
    }

    /// Apply the subtree a neighbor reported for its side of the link.
    ///
    /// Rejects trees that contain the local node or any node already
    /// reachable through a different link; the tree keeps its previous
    /// state in that case.
    pub fn apply_subtree(
        &mut self,
        neighbor: NodeId,
        tree: NodeTree,
        now: u64,
    ) -> MeshResult<SubtreeUpdate> {
        if tree.node_id != neighbor {
            return Err(MeshError::Malformed(format!(
                "subtree from {} is rooted at {}",
                neighbor, tree.node_id
            )));
        }
        if !self.connections.contains_key(&neighbor) {
            return Err(MeshError::UnknownLink { neighbor });
        }

        let mut reachable = BTreeSet::new();
        for id in tree.ids() {
            let owned_elsewhere = self
                .connections
                .values()
                .any(|conn| conn.neighbor != neighbor && (conn.neighbor == id || conn.contains(id)));
            if id == self.node_id || owned_elsewhere || !reachable.insert(id) {
                warn!(
                    node_id = self.node_id,
                    neighbor,
                    looped = id,
                    "Rejected subtree that would create a loop"
                );
                return Err(MeshError::SubtreeLoop {
                    neighbor,
                    node_id: id,
                });
            }
        }

        let conn = self
            .connections
            .get_mut(&neighbor)
            .ok_or(MeshError::UnknownLink { neighbor })?;

        let result = if conn.state == LinkState::Established {
            conn.state = LinkState::RouteReady;
            SubtreeUpdate::BecameReady
        } else if conn.reachable != reachable {
            SubtreeUpdate::Updated
        } else {
            SubtreeUpdate::Unchanged
        };

        conn.reachable = reachable;
        conn.subtree = tree;
        conn.last_sync = Some(now);

        if result == SubtreeUpdate::BecameReady {
            info!(
                node_id = self.node_id,
                neighbor,
                reachable = conn.reachable.len(),
                "Link route-ready"
            );
        }

        Ok(result)
    }

    /// Drop a link. Returns the nodes that were reachable only through it.
    pub fn link_lost(&mut self, neighbor: NodeId) -> MeshResult<Vec<NodeId>> {
        let conn = self
            .connections
            .remove(&neighbor)
            .ok_or(MeshError::UnknownLink { neighbor })?;

        info!(
            node_id = self.node_id,
            neighbor,
            lost = conn.reachable.len(),
            "Link lost"
        );

        if conn.reachable.is_empty() {
            Ok(vec![neighbor])
        } else {
            Ok(conn.reachable.into_iter().collect())
        }
    }

    /// Connection whose subtree contains `destination`.
    ///
    /// `None` is routine (the tree may still be converging) and is not an
    /// error.
    pub fn find_route(&self, destination: NodeId) -> Option<&Connection> {
        let route = self
            .connections
            .values()
            .find(|conn| conn.is_ready() && conn.contains(destination));

        if route.is_none() {
            debug!(node_id = self.node_id, destination, "No route");
        }
        route
    }

    /// Whether a route to `node_id` currently exists
    pub fn is_reachable(&self, node_id: NodeId) -> bool {
        self.connections
            .values()
            .any(|conn| conn.is_ready() && conn.contains(node_id))
    }

    /// Whether at least one link is route-ready
    pub fn has_ready_connection(&self) -> bool {
        self.connections.values().any(Connection::is_ready)
    }

    /// Link to `neighbor`, ready or not
    pub fn connection(&self, neighbor: NodeId) -> Option<&Connection> {
        self.connections.get(&neighbor)
    }

    /// Direct neighbors in any state, ascending
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.connections.keys().copied().collect()
    }

    /// Direct neighbors whose links are route-ready, ascending
    pub fn ready_neighbors(&self) -> Vec<NodeId> {
        self.connections
            .values()
            .filter(|conn| conn.is_ready())
            .map(Connection::neighbor)
            .collect()
    }

    /// Number of direct links
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Every routable node, ascending
    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        let mut nodes: BTreeSet<NodeId> = self
            .connections
            .values()
            .filter(|conn| conn.is_ready())
            .flat_map(|conn| conn.reachable.iter().copied())
            .collect();
        if include_self {
            nodes.insert(self.node_id);
        }
        nodes.into_iter().collect()
    }

    /// Whole mesh as seen from here, rooted at the local node
    pub fn as_node_tree(&self) -> NodeTree {
        self.tree_excluding(None)
    }

    /// View of the mesh to report to `neighbor`: everything except the
    /// branch behind that neighbor
    pub fn tree_for(&self, neighbor: NodeId) -> NodeTree {
        self.tree_excluding(Some(neighbor))
    }

    fn tree_excluding(&self, excluded: Option<NodeId>) -> NodeTree {
        let subs = self
            .connections
            .values()
            .filter(|conn| conn.is_ready() && Some(conn.neighbor) != excluded)
            .map(|conn| conn.subtree.clone())
            .collect();

        NodeTree {
            node_id: self.node_id,
            root: self.root,
            subs,
        }
    }

    /// JSON rendering of [`as_node_tree`](Self::as_node_tree)
    pub fn topology_json(&self, pretty: bool) -> MeshResult<String> {
        let tree = self.as_node_tree();
        let json = if pretty {
            serde_json::to_string_pretty(&tree)?
        } else {
            serde_json::to_string(&tree)?
        };
        Ok(json)
    }
}
