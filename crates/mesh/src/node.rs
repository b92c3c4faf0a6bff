//! Mesh node coordinator
//!
//! [`MeshNode`] owns every piece of per-node state: the routing tree, the
//! bridge registry, both elections, the relay halves, the RTC and the task
//! scheduler. It is driven from outside by three kinds of input:
//!
//! - link changes from the transport ([`link_up`](MeshNode::link_up),
//!   [`link_down`](MeshNode::link_down)),
//! - frames from neighbors ([`handle_message`](MeshNode::handle_message)),
//! - time ([`tick`](MeshNode::tick)).
//!
//! Frames to send accumulate in an outbox the transport drains; anything the
//! application should know about is published as a [`MeshEvent`]. Listeners
//! receive events synchronously, in registration order.

use crate::bridge::{BridgeChange, BridgeRegistry, BridgeStatusUpdate};
use crate::election::{BridgeElection, ElectionCandidate, ElectionOutcome, ElectionRecord};
use crate::error::{MeshError, MeshResult};
use crate::heartbeat::GatewayElectionManager;
use crate::relay::{
    GatewayDecision, GatewayRelay, InternetRelay, InternetRequest, InternetResult, RelayCompletion,
    RelayRequest, ERR_DISABLED, ERR_MAX_RETRIES, ERR_NO_GATEWAY, ERR_NO_MESH_CONNECTIONS,
};
use crate::routing::{RoutingTree, SubtreeUpdate};
use crate::rtc::{RtcManager, TimeSource};
use crate::scheduler::{Scheduler, TaskId};
use crate::tracker::{GatewayMetrics, MessageKey};
use crate::wire::{
    BridgeElection as BridgeElectionMessage, BridgeStatus, GatewayAckPackage, GatewayDataPackage,
    GatewayHeartbeat, GatewayPriority, NodeSync, Routing, WireMessage,
};
use canopy_core::time::MILLIS_PER_SECOND;
use canopy_core::{Clock, NodeConfig, NodeId, NodeRole, Rssi, NO_NODE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// How often election state machines are polled (ms)
pub const ELECTION_POLL_INTERVAL_MS: u64 = 1_000;

/// Something the application may want to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A link finished its subtree exchange and is routable
    RouteReady { neighbor: NodeId },
    /// A link went away along with the nodes behind it
    LinkLost {
        neighbor: NodeId,
        unreachable: Vec<NodeId>,
    },
    /// Primary bridge changed (`NO_NODE` = none)
    GatewayChanged { old: NodeId, new: NodeId },
    /// A bridge's uplink flag flipped, or a new bridge reported one
    BridgeStatusChanged { node_id: NodeId, has_internet: bool },
    /// A bridge election window closed
    BridgeElectionCompleted(ElectionOutcome),
    /// Heartbeat election settled on a primary gateway
    GatewayElected { winner: NodeId, is_local: bool },
    /// A `send_to_internet` request resolved
    InternetResult(InternetResult),
    /// This gateway must perform an HTTP call and report back through
    /// [`MeshNode::complete_relay`]
    RelayRequested(RelayRequest),
    /// RTC was set from a trusted timestamp
    RtcSynced { unix_time: u64 },
}

/// A frame waiting for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Hand to one neighbor
    Single { next_hop: NodeId, message: WireMessage },
    /// Hand to every neighbor except `except`
    Broadcast {
        except: Option<NodeId>,
        message: WireMessage,
    },
}

impl Outbound {
    /// The frame itself
    pub fn message(&self) -> &WireMessage {
        match self {
            Outbound::Single { message, .. } | Outbound::Broadcast { message, .. } => message,
        }
    }
}

/// Snapshot answering "how does this node reach the internet"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatusReport {
    pub is_bridge: bool,
    pub internet_connected: bool,
    pub role: NodeRole,
    pub bridge_node_id: NodeId,
    pub bridge_rssi: Rssi,
    pub time_since_bridge_change: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    BroadcastBridgeStatus,
    BroadcastHeartbeat,
    TrackerCleanup,
    BridgeCleanup,
    ElectionPoll,
    RetryInternetRequest(u32),
    CheckRequestTimeout(u32),
    RetryRelay(MessageKey),
}

type EventListener = Box<dyn FnMut(&MeshEvent)>;
type RouteReadyListener = Box<dyn FnMut(NodeId)>;

/// One node of the mesh
pub struct MeshNode<C: Clock> {
    config: NodeConfig,
    clock: C,
    started_at: u64,

    routing: RoutingTree,
    bridges: BridgeRegistry,
    bridge_election: BridgeElection,
    next_bridge_election_at: u64,
    gateway_election: GatewayElectionManager,
    requests: InternetRelay,
    gateway: GatewayRelay,
    rtc: RtcManager,
    scheduler: Scheduler<Task>,
    request_tasks: HashMap<u32, TaskId>,

    is_bridge: bool,
    internet_connected: bool,
    router_rssi: Rssi,
    router_channel: u8,
    gateway_ip: String,
    wall_clock: Option<(u64, u64)>,
    last_bridge_change: Option<BridgeChange>,

    outbox: Vec<Outbound>,
    listeners: Vec<EventListener>,
    route_ready_listeners: Vec<RouteReadyListener>,
}

impl<C: Clock> MeshNode<C> {
    /// Build a node from a validated configuration and start its periodic
    /// tasks. Nothing runs until the first [`tick`](Self::tick).
    pub fn new(config: NodeConfig, clock: C) -> MeshResult<Self> {
        config.validate()?;
        let now = clock.now();
        let node_id = config.node_id;

        let bridge_election =
            BridgeElection::new(config.mesh.min_bridge_rssi, config.mesh.election_window_ms)?;

        let mut gateway_election = GatewayElectionManager::new(node_id);
        gateway_election.configure(&config.gateway);
        gateway_election.set_cooldown_period(config.mesh.election_cooldown_ms);

        let mut requests = InternetRelay::new(node_id);
        requests.configure(&config.mesh);

        let mut scheduler = Scheduler::new();
        scheduler.schedule_every(now, config.mesh.bridge_status_interval_ms, Task::BroadcastBridgeStatus);
        scheduler.schedule_every(now, config.gateway.gateway_heartbeat_interval, Task::BroadcastHeartbeat);
        scheduler.schedule_every(now, config.gateway.duplicate_tracking_timeout, Task::TrackerCleanup);
        scheduler.schedule_every(now, config.mesh.bridge_timeout_ms, Task::BridgeCleanup);
        scheduler.schedule_every(now, ELECTION_POLL_INTERVAL_MS, Task::ElectionPoll);

        info!(node_id, is_bridge = config.is_bridge, "Mesh node created");

        Ok(Self {
            routing: RoutingTree::new(node_id),
            bridges: BridgeRegistry::new(config.mesh.bridge_timeout_ms, config.mesh.max_known_bridges),
            bridge_election,
            next_bridge_election_at: now,
            gateway_election,
            requests,
            gateway: GatewayRelay::new(node_id, &config.gateway),
            rtc: RtcManager::new(),
            scheduler,
            request_tasks: HashMap::new(),
            is_bridge: config.is_bridge,
            internet_connected: false,
            router_rssi: 0,
            router_channel: 0,
            gateway_ip: String::new(),
            wall_clock: None,
            last_bridge_change: None,
            outbox: Vec::new(),
            listeners: Vec::new(),
            route_ready_listeners: Vec::new(),
            config,
            clock,
            started_at: now,
        })
    }

    /// This node's mesh identity
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Configuration the node was built from
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Milliseconds since construction
    pub fn uptime(&self) -> u64 {
        self.clock.now().saturating_sub(self.started_at)
    }

    /// Receive every event
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&MeshEvent) + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Called with the neighbor id once a link is routable. The routing
    /// tree already reflects the link when the callback runs.
    pub fn on_route_ready<F>(&mut self, listener: F)
    where
        F: FnMut(NodeId) + 'static,
    {
        self.route_ready_listeners.push(Box::new(listener));
    }

    fn emit(&mut self, event: MeshEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    /// Take every frame queued since the last call
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    // ----- routing --------------------------------------------------------

    /// Routing tree, read-only
    pub fn routing(&self) -> &RoutingTree {
        &self.routing
    }

    /// Mark this node as the mesh root
    pub fn set_root(&mut self, root: bool) {
        self.routing.set_root(root);
    }

    /// A neighbor connected. Sends it our view of the tree.
    pub fn link_up(&mut self, neighbor: NodeId) -> MeshResult<()> {
        let now = self.clock.now();
        self.routing.link_established(neighbor, now)?;
        self.send_node_sync(neighbor);
        Ok(())
    }

    /// A neighbor disconnected
    pub fn link_down(&mut self, neighbor: NodeId) -> MeshResult<()> {
        let unreachable = self.routing.link_lost(neighbor)?;
        self.propagate_tree(None);
        self.emit(MeshEvent::LinkLost {
            neighbor,
            unreachable,
        });
        Ok(())
    }

    fn send_node_sync(&mut self, neighbor: NodeId) {
        let message = WireMessage::NodeSync(NodeSync {
            from: self.node_id(),
            dest: neighbor,
            tree: self.routing.tree_for(neighbor),
        });
        self.outbox.push(Outbound::Single {
            next_hop: neighbor,
            message,
        });
    }

    fn propagate_tree(&mut self, except: Option<NodeId>) {
        for neighbor in self.routing.neighbors() {
            if Some(neighbor) != except {
                self.send_node_sync(neighbor);
            }
        }
    }

    /// Queue a destination-addressed frame. `false` when no route exists.
    fn send_single(&mut self, dest: NodeId, message: WireMessage) -> bool {
        match self.routing.find_route(dest) {
            Some(conn) => {
                let next_hop = conn.neighbor();
                self.outbox.push(Outbound::Single { next_hop, message });
                true
            }
            None => false,
        }
    }

    fn broadcast(&mut self, message: WireMessage) {
        if self.routing.connection_count() > 0 {
            self.outbox.push(Outbound::Broadcast {
                except: None,
                message,
            });
        }
    }

    // ----- inbound --------------------------------------------------------

    /// Decode and handle a frame received from `from_neighbor`
    pub fn handle_message(&mut self, from_neighbor: NodeId, raw: &str) -> MeshResult<()> {
        let message = WireMessage::decode(raw)?;
        self.handle_wire(from_neighbor, message)
    }

    /// Handle an already decoded frame
    pub fn handle_wire(&mut self, from_neighbor: NodeId, message: WireMessage) -> MeshResult<()> {
        let now = self.clock.now();

        match message.routing() {
            Routing::Single => {
                let dest = message.dest().unwrap_or(NO_NODE);
                if dest != self.node_id() {
                    if !self.send_single(dest, message) {
                        debug!(node_id = self.node_id(), dest, "No route to forward frame, dropped");
                    }
                    return Ok(());
                }
            }
            Routing::Broadcast => {
                if self.routing.connection_count() > 1 {
                    self.outbox.push(Outbound::Broadcast {
                        except: Some(from_neighbor),
                        message: message.clone(),
                    });
                }
            }
        }

        match message {
            WireMessage::NodeSync(sync) => self.handle_node_sync(from_neighbor, sync, now),
            WireMessage::BridgeStatus(status) => {
                self.handle_bridge_status(status, now);
                Ok(())
            }
            WireMessage::BridgeElection(candidacy) => {
                self.handle_candidacy(candidacy, now);
                Ok(())
            }
            WireMessage::GatewayData(pkg) => {
                self.handle_gateway_data(pkg, now);
                Ok(())
            }
            WireMessage::GatewayAck(ack) => {
                self.handle_ack(&ack);
                Ok(())
            }
            WireMessage::GatewayHeartbeat(heartbeat) => {
                self.handle_heartbeat(&heartbeat, now);
                Ok(())
            }
        }
    }

    fn handle_node_sync(&mut self, from_neighbor: NodeId, sync: NodeSync, now: u64) -> MeshResult<()> {
        if sync.from != from_neighbor {
            return Err(MeshError::Malformed(format!(
                "node sync from {} relayed by {}",
                sync.from, from_neighbor
            )));
        }

        match self.routing.apply_subtree(from_neighbor, sync.tree, now)? {
            SubtreeUpdate::BecameReady => {
                for listener in self.route_ready_listeners.iter_mut() {
                    listener(from_neighbor);
                }
                self.emit(MeshEvent::RouteReady {
                    neighbor: from_neighbor,
                });
                self.propagate_tree(Some(from_neighbor));
                if self.is_bridge {
                    let status = self.local_bridge_status(from_neighbor, now);
                    self.outbox.push(Outbound::Single {
                        next_hop: from_neighbor,
                        message: WireMessage::BridgeStatus(status),
                    });
                }
            }
            SubtreeUpdate::Updated => self.propagate_tree(Some(from_neighbor)),
            SubtreeUpdate::Unchanged => {}
        }
        Ok(())
    }

    // ----- bridges --------------------------------------------------------

    /// Feed the result of the local uplink probe
    pub fn set_uplink(&mut self, internet_connected: bool, router_rssi: Rssi) {
        let changed = self.internet_connected != internet_connected;
        self.internet_connected = internet_connected;
        self.router_rssi = router_rssi;
        self.gateway_election
            .set_local_candidate(internet_connected, router_rssi);

        if changed {
            info!(node_id = self.node_id(), internet_connected, router_rssi, "Uplink state changed");
            if self.is_bridge {
                self.broadcast_bridge_status(self.clock.now());
            }
        }
    }

    /// Router details advertised in bridge status
    pub fn set_router_info(&mut self, channel: u8, gateway_ip: &str) {
        self.router_channel = channel;
        self.gateway_ip = gateway_ip.to_string();
    }

    /// Whether this node currently uplinks for the mesh
    pub fn is_bridge(&self) -> bool {
        self.is_bridge
    }

    /// Uplink state last fed through [`set_uplink`](Self::set_uplink)
    pub fn uplink(&self) -> (bool, Rssi) {
        (self.internet_connected, self.router_rssi)
    }

    /// Known bridges, read-only
    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    /// Any healthy bridge (possibly this node) reports internet
    pub fn has_internet_connection(&self) -> bool {
        self.bridges.has_internet_connection(self.clock.now())
    }

    /// At least one routable link
    pub fn has_active_mesh_connections(&self) -> bool {
        self.routing.has_ready_connection()
    }

    fn local_bridge_status(&self, dest: NodeId, now: u64) -> BridgeStatus {
        BridgeStatus {
            from: self.node_id(),
            dest,
            internet_connected: self.internet_connected,
            router_rssi: self.router_rssi,
            router_channel: self.router_channel,
            uptime: now.saturating_sub(self.started_at),
            gateway_ip: self.gateway_ip.clone(),
            timestamp: self.unix_time_at(now),
        }
    }

    fn broadcast_bridge_status(&mut self, now: u64) {
        let status = self.local_bridge_status(NO_NODE, now);
        self.apply_bridge_status(&status, now);
        self.broadcast(WireMessage::BridgeStatus(status));
    }

    fn handle_bridge_status(&mut self, status: BridgeStatus, now: u64) {
        if status.from == self.node_id() {
            return;
        }
        self.apply_bridge_status(&status, now);

        let from_primary = self.bridges.primary_id(now) == status.from;
        if from_primary && status.internet_connected && status.timestamp != 0 && self.rtc.is_enabled() {
            match self.rtc.sync_from_ntp(status.timestamp, now) {
                Ok(()) => self.emit(MeshEvent::RtcSynced {
                    unix_time: status.timestamp,
                }),
                Err(e) => debug!(error = %e, "RTC sync from bridge status failed"),
            }
        }
    }

    fn apply_bridge_status(&mut self, status: &BridgeStatus, now: u64) {
        let update = self.bridges.update_bridge_status(
            BridgeStatusUpdate {
                node_id: status.from,
                internet_connected: status.internet_connected,
                router_rssi: status.router_rssi,
                router_channel: status.router_channel,
                uptime: status.uptime,
                gateway_ip: status.gateway_ip.clone(),
                timestamp: status.timestamp,
            },
            now,
        );

        if update.primary_changed() {
            if self.config.mesh.diagnostics {
                self.last_bridge_change = Some(BridgeChange {
                    timestamp: now,
                    old_bridge: update.old_primary,
                    new_bridge: update.new_primary,
                    internet_available: update.internet_connected,
                    reason: update.change_reason().to_string(),
                });
            }
            info!(
                old = update.old_primary,
                new = update.new_primary,
                reason = update.change_reason(),
                "Primary bridge changed"
            );
            self.emit(MeshEvent::GatewayChanged {
                old: update.old_primary,
                new: update.new_primary,
            });
        }

        if update.internet_changed() {
            self.emit(MeshEvent::BridgeStatusChanged {
                node_id: status.from,
                has_internet: status.internet_connected,
            });
        }
    }

    /// Summary of bridge and uplink state
    pub fn bridge_status(&self) -> BridgeStatusReport {
        let now = self.clock.now();
        let role = if self.is_bridge {
            NodeRole::Bridge
        } else if self.routing.is_root() {
            NodeRole::Root
        } else {
            NodeRole::Regular
        };
        let primary = self.bridges.primary_bridge(now);

        BridgeStatusReport {
            is_bridge: self.is_bridge,
            internet_connected: if self.is_bridge {
                self.internet_connected
            } else {
                self.bridges.has_internet_connection(now)
            },
            role,
            bridge_node_id: primary.map(|b| b.node_id).unwrap_or(NO_NODE),
            bridge_rssi: primary.map(|b| b.router_rssi).unwrap_or(0),
            time_since_bridge_change: self
                .last_bridge_change
                .as_ref()
                .map(|change| now.saturating_sub(change.timestamp))
                .unwrap_or(0),
        }
    }

    /// Most recent primary bridge change
    pub fn last_bridge_change(&self) -> Option<&BridgeChange> {
        self.last_bridge_change.as_ref()
    }

    // ----- bridge election ------------------------------------------------

    fn bridge_capable(&self) -> bool {
        self.config.gateway.enabled
            && self.config.gateway.has_router_credentials()
            && self.router_rssi != 0
    }

    fn local_candidate(&self, now: u64) -> ElectionCandidate {
        ElectionCandidate {
            node_id: self.node_id(),
            router_rssi: self.router_rssi,
            uptime: now.saturating_sub(self.started_at),
        }
    }

    fn start_bridge_election(&mut self, reason: &str, now: u64) {
        let local = self.local_candidate(now);
        if self.bridge_election.start(local, reason, now) {
            self.broadcast(WireMessage::BridgeElection(BridgeElectionMessage {
                from: local.node_id,
                router_rssi: local.router_rssi,
                uptime: local.uptime,
                timestamp: self.unix_time_at(now),
            }));
        }
    }

    fn handle_candidacy(&mut self, candidacy: BridgeElectionMessage, now: u64) {
        if candidacy.from == self.node_id() {
            return;
        }
        if !self.bridge_election.is_collecting() && !self.is_bridge && self.bridge_capable() {
            self.start_bridge_election("Peer candidacy", now);
        }
        self.bridge_election.add_candidate(ElectionCandidate {
            node_id: candidacy.from,
            router_rssi: candidacy.router_rssi,
            uptime: candidacy.uptime,
        });
    }

    fn poll_bridge_election(&mut self, now: u64) {
        if let Some(outcome) = self.bridge_election.poll(now) {
            self.next_bridge_election_at = now.saturating_add(self.config.mesh.election_cooldown_ms);
            if outcome.winner() == Some(self.node_id()) && !self.is_bridge {
                info!(node_id = self.node_id(), "Promoted to bridge");
                self.is_bridge = true;
                self.broadcast_bridge_status(now);
            }
            self.emit(MeshEvent::BridgeElectionCompleted(outcome));
            return;
        }

        let wants_election = !self.is_bridge
            && self.bridge_capable()
            && !self.bridge_election.is_collecting()
            && now >= self.next_bridge_election_at
            && !self.bridges.has_internet_connection(now);
        if wants_election {
            self.start_bridge_election("No healthy bridge", now);
        }
    }

    /// Recent bridge elections, oldest first
    pub fn election_history(&self) -> Vec<ElectionRecord> {
        self.bridge_election.history().cloned().collect()
    }

    // ----- gateway heartbeat election -------------------------------------

    fn participates_in_gateway_election(&self) -> bool {
        self.config.gateway.enabled && self.config.gateway.can_participate_in_election()
    }

    /// Heartbeat election state, read-only
    pub fn gateway_election(&self) -> &GatewayElectionManager {
        &self.gateway_election
    }

    fn handle_heartbeat(&mut self, heartbeat: &GatewayHeartbeat, now: u64) {
        self.gateway_election.process_heartbeat(heartbeat, now);
        self.publish_gateway_result();
    }

    fn poll_gateway_election(&mut self, now: u64) {
        if self.participates_in_gateway_election()
            && self.internet_connected
            && self.gateway_election.primary_gateway_id() == NO_NODE
        {
            self.gateway_election.start_election(now);
        }
        self.gateway_election.update(now);
        self.publish_gateway_result();
    }

    fn publish_gateway_result(&mut self) {
        if let Some(result) = self.gateway_election.take_result() {
            self.emit(MeshEvent::GatewayElected {
                winner: result.winner,
                is_local: result.is_local,
            });
        }
    }

    /// Gateway used for internet requests, `NO_NODE` when none is known.
    ///
    /// Fresh primary heartbeats decide first, then the election result,
    /// then the registry's primary bridge.
    pub fn internet_gateway(&self) -> NodeId {
        let now = self.clock.now();
        if self.gateway_election.is_elected_primary() {
            return self.node_id();
        }
        if let Some(primary) = self.gateway_election.primary_from_heartbeats(now) {
            if self.routing.is_reachable(primary) {
                return primary;
            }
        }
        let elected = self.gateway_election.primary_gateway_id();
        if elected != NO_NODE && (elected == self.node_id() || self.routing.is_reachable(elected)) {
            return elected;
        }
        match self.bridges.primary_bridge(now) {
            Some(bridge) if bridge.internet_connected => bridge.node_id,
            _ => NO_NODE,
        }
    }

    // ----- internet relay: requester --------------------------------------

    /// Ask a gateway to deliver `payload` to `destination`.
    ///
    /// Immediate failures are also published as
    /// [`MeshEvent::InternetResult`] with message id 0.
    pub fn send_to_internet(
        &mut self,
        destination: &str,
        payload: &str,
        priority: GatewayPriority,
    ) -> InternetRequest {
        let now = self.clock.now();
        let gateway = self.internet_gateway();

        let rejection = if !self.requests.is_enabled() {
            Some(ERR_DISABLED)
        } else if gateway == NO_NODE {
            Some(ERR_NO_GATEWAY)
        } else if gateway != self.node_id() && !self.routing.has_ready_connection() {
            Some(ERR_NO_MESH_CONNECTIONS)
        } else {
            None
        };
        if let Some(error) = rejection {
            warn!(node_id = self.node_id(), destination, error, "Internet request rejected");
            let result = InternetResult::failed(0, error);
            self.emit(MeshEvent::InternetResult(result.clone()));
            return InternetRequest::Failed(result);
        }

        let message_id = self.requests.begin(gateway, destination, payload, priority, now);
        self.attempt_internet_request(message_id, now);
        InternetRequest::Pending(message_id)
    }

    fn attempt_internet_request(&mut self, message_id: u32, now: u64) {
        let current = self.internet_gateway();
        if current != NO_NODE {
            self.requests.retarget(message_id, current);
        }
        let Some(pkg) = self.requests.package(message_id, now) else {
            return;
        };
        let gateway = pkg.dest;

        let delivered = if gateway == self.node_id() {
            self.handle_gateway_data(pkg, now);
            true
        } else {
            self.send_single(gateway, WireMessage::GatewayData(pkg))
        };

        if delivered {
            let timeout = self
                .requests
                .get(message_id)
                .map(|request| request.timeout_ms)
                .unwrap_or_default();
            if self.requests.is_pending(message_id) {
                let task = self
                    .scheduler
                    .schedule_once(now, timeout, Task::CheckRequestTimeout(message_id));
                self.replace_request_task(message_id, task);
            }
            return;
        }

        match self.requests.next_retry_delay(message_id) {
            Some(delay) => {
                debug!(message_id, gateway, delay, "No route to gateway, retry scheduled");
                let task = self
                    .scheduler
                    .schedule_once(now, delay, Task::RetryInternetRequest(message_id));
                self.replace_request_task(message_id, task);
            }
            None => self.resolve_request(message_id, ERR_MAX_RETRIES),
        }
    }

    fn replace_request_task(&mut self, message_id: u32, task: TaskId) {
        if let Some(previous) = self.request_tasks.insert(message_id, task) {
            self.scheduler.cancel(previous);
        }
    }

    fn clear_request_task(&mut self, message_id: u32) {
        if let Some(task) = self.request_tasks.remove(&message_id) {
            self.scheduler.cancel(task);
        }
    }

    fn resolve_request(&mut self, message_id: u32, error: &str) {
        self.clear_request_task(message_id);
        if let Some(result) = self.requests.fail(message_id, error) {
            self.emit(MeshEvent::InternetResult(result));
        }
    }

    fn handle_ack(&mut self, ack: &GatewayAckPackage) {
        if let Some(result) = self.requests.handle_ack(ack) {
            self.clear_request_task(ack.message_id);
            self.emit(MeshEvent::InternetResult(result));
        }
    }

    /// Withdraw a pending request
    pub fn cancel_internet_request(&mut self, message_id: u32) -> bool {
        self.clear_request_task(message_id);
        match self.requests.cancel(message_id) {
            Some(result) => {
                self.emit(MeshEvent::InternetResult(result));
                true
            }
            None => false,
        }
    }

    /// Accept `send_to_internet` calls again
    pub fn enable_send_to_internet(&mut self) {
        self.requests.enable();
    }

    /// Refuse new requests and fail the pending ones
    pub fn disable_send_to_internet(&mut self) {
        for result in self.requests.disable() {
            self.clear_request_task(result.message_id);
            self.emit(MeshEvent::InternetResult(result));
        }
    }

    /// Requests still awaiting a result
    pub fn pending_internet_request_count(&self) -> usize {
        self.requests.pending_count()
    }

    // ----- internet relay: gateway ----------------------------------------

    fn handle_gateway_data(&mut self, pkg: GatewayDataPackage, now: u64) {
        match self.gateway.accept(pkg, self.internet_connected, now) {
            GatewayDecision::Relay(request) => self.emit(MeshEvent::RelayRequested(request)),
            GatewayDecision::Acknowledge(ack) => self.send_ack(ack),
            GatewayDecision::Duplicate | GatewayDecision::Ignore => {}
        }
    }

    /// Report the HTTP outcome of a [`MeshEvent::RelayRequested`] call
    pub fn complete_relay(&mut self, message_id: u32, origin_node: NodeId, http_status: u16, error: &str) {
        let now = self.clock.now();
        let key = MessageKey::new(message_id, origin_node);
        match self.gateway.complete(key, http_status, error, now) {
            RelayCompletion::Retry { key, delay_ms } => {
                self.scheduler.schedule_once(now, delay_ms, Task::RetryRelay(key));
            }
            RelayCompletion::Acknowledge(ack) => self.send_ack(ack),
            RelayCompletion::Done => {}
        }
    }

    fn send_ack(&mut self, ack: GatewayAckPackage) {
        if ack.dest == self.node_id() {
            self.handle_ack(&ack);
            return;
        }
        let dest = ack.dest;
        if !self.send_single(dest, WireMessage::GatewayAck(ack)) {
            debug!(node_id = self.node_id(), dest, "No route for relay ack");
        }
    }

    /// Relay counters of this node's gateway half
    pub fn gateway_metrics(&self) -> GatewayMetrics {
        self.gateway.tracker().metrics()
    }

    // ----- time -----------------------------------------------------------

    /// Install an RTC
    pub fn enable_rtc(&mut self, source: Box<dyn TimeSource>) -> MeshResult<()> {
        self.rtc.enable(source)
    }

    /// Drop the time source
    pub fn disable_rtc(&mut self) {
        self.rtc.disable();
    }

    /// RTC state, read-only
    pub fn rtc(&self) -> &RtcManager {
        &self.rtc
    }

    /// Record a trusted unix time (seconds), e.g. from NTP on a bridge
    pub fn set_unix_time(&mut self, unix_time: u64) {
        let now = self.clock.now();
        self.wall_clock = Some((unix_time, now));
        if self.rtc.is_enabled() && self.rtc.sync_from_ntp(unix_time, now).is_ok() {
            self.emit(MeshEvent::RtcSynced { unix_time });
        }
    }

    /// Best known unix time (seconds), 0 when unknown
    pub fn unix_time(&self) -> u64 {
        self.unix_time_at(self.clock.now())
    }

    fn unix_time_at(&self, now: u64) -> u64 {
        if self.rtc.is_enabled() {
            return self.rtc.get_time(now);
        }
        match self.wall_clock {
            Some((unix, at)) => unix + now.saturating_sub(at) / MILLIS_PER_SECOND,
            None => 0,
        }
    }

    // ----- scheduling -----------------------------------------------------

    /// Run every task that has come due
    pub fn tick(&mut self) {
        let now = self.clock.now();
        for task in self.scheduler.run_due(now) {
            self.run_task(task, now);
        }
    }

    /// Due time of the next scheduled task
    pub fn next_due(&self) -> Option<u64> {
        self.scheduler.next_due()
    }

    fn run_task(&mut self, task: Task, now: u64) {
        match task {
            Task::BroadcastBridgeStatus => {
                if self.is_bridge {
                    self.broadcast_bridge_status(now);
                }
            }
            Task::BroadcastHeartbeat => {
                if self.participates_in_gateway_election() {
                    let heartbeat = self
                        .gateway_election
                        .local_heartbeat(now.saturating_sub(self.started_at), self.unix_time_at(now));
                    self.broadcast(WireMessage::GatewayHeartbeat(heartbeat));
                }
            }
            Task::TrackerCleanup => {
                self.gateway.cleanup(now);
            }
            Task::BridgeCleanup => {
                let removed = self.bridges.cleanup_expired(now);
                if removed > 0 {
                    debug!(removed, "Expired bridges removed");
                }
            }
            Task::ElectionPoll => {
                self.poll_bridge_election(now);
                self.poll_gateway_election(now);
            }
            Task::RetryInternetRequest(message_id) => {
                self.request_tasks.remove(&message_id);
                if self.requests.is_pending(message_id) {
                    self.attempt_internet_request(message_id, now);
                }
            }
            Task::CheckRequestTimeout(message_id) => {
                self.request_tasks.remove(&message_id);
                if let Some(result) = self.requests.check_timeout(message_id) {
                    self.emit(MeshEvent::InternetResult(result));
                }
            }
            Task::RetryRelay(key) => {
                if let Some(request) = self.gateway.retry(key) {
                    self.emit(MeshEvent::RelayRequested(request));
                }
            }
        }
    }
}
