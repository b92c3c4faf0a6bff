//! Internet relay through a gateway node
//!
//! Two halves live here. [`InternetRelay`] is the requester: it allocates
//! message ids, keeps pending requests until an acknowledgment, timeout or
//! cancellation resolves them, and decides retry delays. [`GatewayRelay`]
//! is the gateway: it deduplicates incoming [`GatewayDataPackage`]s, hands
//! first sightings to the application for the actual HTTP call, and turns
//! the outcome into a retry or exactly one acknowledgment.
//!
//! Neither half sends anything itself; the node coordinator owns the
//! outbox and the scheduler.

use crate::retry::{backoff_delay, default_error_for, HttpOutcome};
use crate::tracker::{MessageKey, MessageTracker};
use crate::wire::{GatewayAckPackage, GatewayDataPackage, GatewayPriority};
use canopy_core::{MeshConfig, NodeId, SharedGatewayConfig};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Default wait for an acknowledgment (ms)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default send attempts after the first
pub const DEFAULT_REQUEST_RETRIES: u8 = 3;

/// Content type stamped on relayed payloads
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// No elected gateway or internet bridge is known
pub const ERR_NO_GATEWAY: &str = "No gateway available";
/// The gateway is remote and no link is route-ready
pub const ERR_NO_MESH_CONNECTIONS: &str = "No active mesh connections";
/// Every send attempt found no route to the gateway
pub const ERR_MAX_RETRIES: &str = "Max retries exceeded";
/// No acknowledgment within the request timeout
pub const ERR_TIMED_OUT: &str = "Request timed out";
/// Cancelled by the caller
pub const ERR_CANCELLED: &str = "Request cancelled";
/// Sending to the internet is switched off
pub const ERR_DISABLED: &str = "API disabled";
/// The gateway has lost its own uplink
pub const ERR_GATEWAY_OFFLINE: &str = "Gateway not connected to Internet";

/// Allocates relay message ids.
///
/// The upper 16 bits carry the low 16 bits of the node id, so ids from
/// different origins rarely collide; the lower 16 bits are a counter that
/// starts at a random offset so a rebooted node does not replay old ids.
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    node_bits: u32,
    counter: u16,
}

impl MessageIdGenerator {
    /// Generator for `node_id` with a random counter start
    pub fn new(node_id: NodeId) -> Self {
        Self::with_seed(node_id, rand::random::<u16>())
    }

    /// Deterministic counter start
    pub fn with_seed(node_id: NodeId, seed: u16) -> Self {
        Self {
            node_bits: (node_id & 0xFFFF) << 16,
            counter: seed,
        }
    }

    /// Next id, never 0
    pub fn next_id(&mut self) -> u32 {
        loop {
            self.counter = self.counter.wrapping_add(1);
            let id = self.node_bits | u32::from(self.counter);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Final outcome of a relay request, as seen by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternetResult {
    /// Request id, 0 for requests rejected before an id was assigned
    pub message_id: u32,
    pub success: bool,
    pub http_status: u16,
    pub error: String,
}

impl InternetResult {
    /// Local failure with no HTTP status
    pub fn failed(message_id: u32, error: &str) -> Self {
        Self {
            message_id,
            success: false,
            http_status: 0,
            error: error.to_string(),
        }
    }
}

/// What `send_to_internet` produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternetRequest {
    /// Accepted; the result arrives later
    Pending(u32),
    /// Rejected immediately
    Failed(InternetResult),
}

impl InternetRequest {
    /// Id of an accepted request
    pub fn message_id(&self) -> Option<u32> {
        match self {
            InternetRequest::Pending(id) => Some(*id),
            InternetRequest::Failed(_) => None,
        }
    }
}

/// A request waiting for its acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInternetRequest {
    pub message_id: u32,
    pub created_at: u64,
    pub retry_count: u8,
    pub max_retries: u8,
    pub timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub gateway: NodeId,
    pub destination: String,
    pub payload: String,
    pub priority: GatewayPriority,
}

impl PendingInternetRequest {
    /// Older than its timeout
    pub fn is_timed_out(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.timeout_ms
    }
}

/// Requester side of the relay protocol
#[derive(Debug)]
pub struct InternetRelay {
    node_id: NodeId,
    ids: MessageIdGenerator,
    pending: HashMap<u32, PendingInternetRequest>,
    enabled: bool,
    timeout_ms: u64,
    max_retries: u8,
    retry_delay_ms: u64,
}

impl InternetRelay {
    /// Requester for `node_id` with default timeout and retry policy
    pub fn new(node_id: NodeId) -> Self {
        Self::with_ids(node_id, MessageIdGenerator::new(node_id))
    }

    /// Relay using a caller-supplied id generator
    pub fn with_ids(node_id: NodeId, ids: MessageIdGenerator) -> Self {
        Self {
            node_id,
            ids,
            pending: HashMap::new(),
            enabled: true,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_REQUEST_RETRIES,
            retry_delay_ms: crate::retry::DEFAULT_RETRY_DELAY_MS,
        }
    }

    /// Take timeout and retry policy from the mesh configuration
    pub fn configure(&mut self, config: &MeshConfig) {
        self.timeout_ms = config.internet_request_timeout_ms;
        self.max_retries = config.internet_retry_count;
        self.retry_delay_ms = config.internet_retry_delay_ms;
    }

    /// Whether new requests are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Accept requests again after [`disable`](Self::disable)
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stop accepting requests and fail everything pending
    pub fn disable(&mut self) -> Vec<InternetResult> {
        self.enabled = false;
        let mut failed: Vec<InternetResult> = self
            .pending
            .drain()
            .map(|(id, _)| InternetResult::failed(id, ERR_DISABLED))
            .collect();
        failed.sort_by_key(|r| r.message_id);
        if !failed.is_empty() {
            info!(count = failed.len(), "Internet relay disabled, pending requests failed");
        }
        failed
    }

    /// Register a new request toward `gateway` and return its id
    pub fn begin(
        &mut self,
        gateway: NodeId,
        destination: &str,
        payload: &str,
        priority: GatewayPriority,
        now: u64,
    ) -> u32 {
        let message_id = self.ids.next_id();
        self.pending.insert(
            message_id,
            PendingInternetRequest {
                message_id,
                created_at: now,
                retry_count: 0,
                max_retries: self.max_retries,
                timeout_ms: self.timeout_ms,
                retry_delay_ms: self.retry_delay_ms,
                gateway,
                destination: destination.to_string(),
                payload: payload.to_string(),
                priority,
            },
        );
        debug!(message_id, gateway, destination, "Internet request queued");
        message_id
    }

    /// Wire package for a pending request
    pub fn package(&self, message_id: u32, now: u64) -> Option<GatewayDataPackage> {
        let request = self.pending.get(&message_id)?;
        Some(GatewayDataPackage {
            from: self.node_id,
            dest: request.gateway,
            message_id,
            origin_node: self.node_id,
            timestamp: now,
            priority: request.priority.as_u8(),
            destination: request.destination.clone(),
            payload: request.payload.clone(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            retry_count: request.retry_count,
            requires_ack: true,
        })
    }

    /// Point a pending request at a different gateway
    pub fn retarget(&mut self, message_id: u32, gateway: NodeId) {
        if let Some(request) = self.pending.get_mut(&message_id) {
            request.gateway = gateway;
        }
    }

    /// Consume one retry. Returns the delay before the next attempt, or
    /// `None` when retries are exhausted.
    pub fn next_retry_delay(&mut self, message_id: u32) -> Option<u64> {
        let request = self.pending.get_mut(&message_id)?;
        if request.retry_count >= request.max_retries {
            return None;
        }
        let delay = backoff_delay(request.retry_delay_ms, u32::from(request.retry_count));
        request.retry_count += 1;
        Some(delay)
    }

    /// Resolve a request with a local failure
    pub fn fail(&mut self, message_id: u32, error: &str) -> Option<InternetResult> {
        self.pending.remove(&message_id)?;
        warn!(message_id, error, "Internet request failed");
        Some(InternetResult::failed(message_id, error))
    }

    /// Resolve a request from its acknowledgment. Acks for other origins or
    /// unknown ids are ignored.
    pub fn handle_ack(&mut self, ack: &GatewayAckPackage) -> Option<InternetResult> {
        if ack.origin_node != self.node_id {
            return None;
        }
        if self.pending.remove(&ack.message_id).is_none() {
            debug!(message_id = ack.message_id, "Ack for unknown request ignored");
            return None;
        }
        Some(InternetResult {
            message_id: ack.message_id,
            success: ack.success,
            http_status: ack.http_status,
            error: ack.error.clone(),
        })
    }

    /// Fail a request if it is still pending when its timeout check fires
    pub fn check_timeout(&mut self, message_id: u32) -> Option<InternetResult> {
        self.fail(message_id, ERR_TIMED_OUT)
    }

    /// Cancel a pending request
    pub fn cancel(&mut self, message_id: u32) -> Option<InternetResult> {
        self.pending.remove(&message_id)?;
        info!(message_id, "Internet request cancelled");
        Some(InternetResult::failed(message_id, ERR_CANCELLED))
    }

    /// Pending request by id
    pub fn get(&self, message_id: u32) -> Option<&PendingInternetRequest> {
        self.pending.get(&message_id)
    }

    /// Still waiting for an ack, timeout or cancellation
    pub fn is_pending(&self, message_id: u32) -> bool {
        self.pending.contains_key(&message_id)
    }

    /// Number of unresolved requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// HTTP call the application must perform on the gateway's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub message_id: u32,
    pub origin_node: NodeId,
    pub destination: String,
    pub payload: String,
    pub content_type: String,
    pub priority: GatewayPriority,
    /// 0 for the first try
    pub attempt: u8,
}

/// What the gateway does with an incoming package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayDecision {
    /// Already seen; drop silently
    Duplicate,
    /// Perform the HTTP call
    Relay(RelayRequest),
    /// Answer with this ack right away
    Acknowledge(GatewayAckPackage),
    /// Nothing to do (ack already sent)
    Ignore,
}

/// What the gateway does after an HTTP attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCompletion {
    /// Re-issue after `delay_ms`
    Retry { key: MessageKey, delay_ms: u64 },
    /// Send this ack to the origin
    Acknowledge(GatewayAckPackage),
    /// Ack suppressed or the request is unknown
    Done,
}

#[derive(Debug, Clone)]
struct RelayJob {
    package: GatewayDataPackage,
    attempts: u8,
    /// A retry is scheduled; completions are ignored until it runs
    awaiting_retry: bool,
}

/// Gateway side of the relay protocol
#[derive(Debug)]
pub struct GatewayRelay {
    node_id: NodeId,
    tracker: MessageTracker,
    in_flight: HashMap<MessageKey, RelayJob>,
    retry_count: u8,
    retry_interval_ms: u64,
}

impl GatewayRelay {
    /// Gateway for `node_id` with tracker bounds and retry policy from `config`
    pub fn new(node_id: NodeId, config: &SharedGatewayConfig) -> Self {
        let mut tracker = MessageTracker::default();
        tracker.configure(config);
        Self {
            node_id,
            tracker,
            in_flight: HashMap::new(),
            retry_count: config.message_retry_count,
            retry_interval_ms: config.retry_interval,
        }
    }

    /// Re-read retry policy and tracker bounds
    pub fn configure(&mut self, config: &SharedGatewayConfig) {
        self.tracker.configure(config);
        self.retry_count = config.message_retry_count;
        self.retry_interval_ms = config.retry_interval;
        self.prune_in_flight();
    }

    /// Duplicate tracker, read-only
    pub fn tracker(&self) -> &MessageTracker {
        &self.tracker
    }

    /// Expire old tracker entries and forget relays that went with them.
    /// Returns the number of tracker entries removed.
    pub fn cleanup(&mut self, now: u64) -> usize {
        let removed = self.tracker.cleanup(now);
        self.prune_in_flight();
        removed
    }

    /// In-flight relays never outlive their tracker entry, so they share
    /// its time and capacity bounds.
    fn prune_in_flight(&mut self) {
        let tracker = &self.tracker;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|key, _| tracker.is_tracked(key.message_id, key.origin_node));
        let dropped = before - self.in_flight.len();
        if dropped > 0 {
            debug!(dropped, "Relay requests expired before an HTTP outcome");
        }
    }

    /// Requests currently awaiting an HTTP outcome
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Decide how to handle a package addressed to this gateway
    pub fn accept(
        &mut self,
        package: GatewayDataPackage,
        has_internet: bool,
        now: u64,
    ) -> GatewayDecision {
        if !self.tracker.handle_incoming_message(&package, now) {
            return GatewayDecision::Duplicate;
        }

        let key = MessageKey::new(package.message_id, package.origin_node);
        if !has_internet {
            warn!(
                message_id = key.message_id,
                origin = key.origin_node,
                "Relay request received without uplink"
            );
            return match self.acknowledge(key, false, 0, ERR_GATEWAY_OFFLINE, now) {
                Some(ack) => GatewayDecision::Acknowledge(ack),
                None => GatewayDecision::Ignore,
            };
        }

        let request = relay_request(&package, 0);
        self.in_flight.insert(
            key,
            RelayJob {
                package,
                attempts: 0,
                awaiting_retry: false,
            },
        );
        // Accepting may have evicted older tracker entries.
        if self.in_flight.len() > self.tracker.tracked_count() {
            self.prune_in_flight();
        }
        GatewayDecision::Relay(request)
    }

    /// Record the HTTP outcome for an in-flight request. An empty `error`
    /// is filled from the status where one is known.
    pub fn complete(
        &mut self,
        key: MessageKey,
        http_status: u16,
        error: &str,
        now: u64,
    ) -> RelayCompletion {
        let outcome = HttpOutcome::classify(http_status);
        let job = match self.in_flight.get_mut(&key) {
            Some(job) => job,
            None => {
                debug!(
                    message_id = key.message_id,
                    origin = key.origin_node,
                    "Completion for unknown relay request"
                );
                return RelayCompletion::Done;
            }
        };

        if job.awaiting_retry {
            debug!(
                message_id = key.message_id,
                origin = key.origin_node,
                "Completion while a retry is pending, ignored"
            );
            return RelayCompletion::Done;
        }

        let attempts = job.attempts;
        if outcome.is_retryable() && attempts < self.retry_count {
            job.awaiting_retry = true;
            let delay_ms = backoff_delay(self.retry_interval_ms, u32::from(attempts));
            debug!(
                message_id = key.message_id,
                http_status,
                attempt = attempts + 1,
                delay_ms,
                "Relay attempt failed, retrying"
            );
            return RelayCompletion::Retry { key, delay_ms };
        }

        self.in_flight.remove(&key);
        let error = if error.is_empty() {
            default_error_for(http_status).unwrap_or_default()
        } else {
            error
        };

        match self.acknowledge(key, outcome.is_success(), http_status, error, now) {
            Some(ack) => RelayCompletion::Acknowledge(ack),
            None => RelayCompletion::Done,
        }
    }

    /// Re-issue an in-flight request after a retry delay
    pub fn retry(&mut self, key: MessageKey) -> Option<RelayRequest> {
        let job = self.in_flight.get_mut(&key)?;
        job.attempts += 1;
        job.awaiting_retry = false;
        Some(relay_request(&job.package, job.attempts))
    }

    fn acknowledge(
        &mut self,
        key: MessageKey,
        success: bool,
        http_status: u16,
        error: &str,
        now: u64,
    ) -> Option<GatewayAckPackage> {
        if !self
            .tracker
            .should_send_acknowledgment(key.message_id, key.origin_node)
        {
            return None;
        }
        self.tracker
            .mark_acknowledgment_sent(key.message_id, key.origin_node, now);

        Some(GatewayAckPackage {
            from: self.node_id,
            dest: key.origin_node,
            message_id: key.message_id,
            origin_node: key.origin_node,
            success,
            http_status,
            error: error.to_string(),
            timestamp: now,
        })
    }
}

fn relay_request(package: &GatewayDataPackage, attempt: u8) -> RelayRequest {
    RelayRequest {
        message_id: package.message_id,
        origin_node: package.origin_node,
        destination: package.destination.clone(),
        payload: package.payload.clone(),
        content_type: package.content_type.clone(),
        priority: GatewayPriority::from_u8(package.priority),
        attempt,
    }
}
