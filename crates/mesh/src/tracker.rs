//! Duplicate and acknowledgment tracking for relayed requests
//!
//! A relayed request is identified by `(message_id, origin_node)`; message
//! ids are picked independently by each origin, so the id alone is not
//! unique. The tracker makes sure each pair is processed at most once and
//! acknowledged at most once, within a bounded amount of memory.
//!
//! Tracked entries and metrics have separate lifecycles: clearing one never
//! touches the other.

use crate::wire::GatewayDataPackage;
use canopy_core::{NodeId, SharedGatewayConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Default number of tracked pairs
pub const DEFAULT_MAX_TRACKED_MESSAGES: usize = 500;

/// Default tracking window (ms)
pub const DEFAULT_TRACKING_TIMEOUT_MS: u64 = 60_000;

/// Dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    /// Id chosen by the origin
    pub message_id: u32,
    /// Node that created the request
    pub origin_node: NodeId,
}

impl MessageKey {
    /// Key for a pair
    pub fn new(message_id: u32, origin_node: NodeId) -> Self {
        Self {
            message_id,
            origin_node,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedMessage {
    inserted_at: u64,
    sequence: u64,
    ack_sent: bool,
}

/// Cumulative relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetrics {
    /// First sightings accepted for processing
    pub messages_processed: u64,
    /// Repeat sightings dropped
    pub duplicates_detected: u64,
    /// Acknowledgments marked as sent
    pub acknowledgments_sent: u64,
    /// Acknowledgments suppressed because one was already sent
    pub duplicate_acks_skipped: u64,
}

impl GatewayMetrics {
    /// Share of incoming requests that were duplicates, in percent
    pub fn duplicate_rate(&self) -> f64 {
        percent(self.duplicates_detected, self.messages_processed)
    }

    /// Share of acknowledgment attempts that were suppressed, in percent
    pub fn duplicate_ack_rate(&self) -> f64 {
        percent(self.duplicate_acks_skipped, self.acknowledgments_sent)
    }

    /// Zero every counter
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn percent(part: u64, rest: u64) -> f64 {
    let total = part + rest;
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Bounded dedup/ack tracker
#[derive(Debug)]
pub struct MessageTracker {
    tracked: HashMap<MessageKey, TrackedMessage>,
    max_messages: usize,
    timeout_ms: u64,
    next_sequence: u64,
    metrics: GatewayMetrics,
}

impl MessageTracker {
    /// Tracker holding at most `max_messages` pairs for `timeout_ms`.
    /// A capacity of zero tracks nothing.
    pub fn new(max_messages: usize, timeout_ms: u64) -> Self {
        Self {
            tracked: HashMap::new(),
            max_messages,
            timeout_ms,
            next_sequence: 0,
            metrics: GatewayMetrics::default(),
        }
    }

    /// Apply capacity and window from the shared gateway configuration
    pub fn configure(&mut self, config: &SharedGatewayConfig) {
        self.timeout_ms = config.duplicate_tracking_timeout;
        self.set_max_messages(config.max_tracked_messages);
    }

    /// Decide whether an incoming relay request should be processed.
    ///
    /// `true` on first sighting of its pair; `false` afterwards until the
    /// entry is cleaned up or evicted.
    pub fn handle_incoming_message(&mut self, pkg: &GatewayDataPackage, now: u64) -> bool {
        self.handle_incoming(MessageKey::new(pkg.message_id, pkg.origin_node), now)
    }

    /// Keyed form of [`handle_incoming_message`](Self::handle_incoming_message)
    pub fn handle_incoming(&mut self, key: MessageKey, now: u64) -> bool {
        if self.tracked.contains_key(&key) {
            self.metrics.duplicates_detected += 1;
            debug!(
                message_id = key.message_id,
                origin = key.origin_node,
                "Duplicate relay request dropped"
            );
            return false;
        }

        self.insert(key, now, false);
        self.metrics.messages_processed += 1;
        true
    }

    /// Whether an acknowledgment for the pair may still be sent. A `false`
    /// answer is counted as a skipped duplicate ack.
    pub fn should_send_acknowledgment(&mut self, message_id: u32, origin_node: NodeId) -> bool {
        let key = MessageKey::new(message_id, origin_node);
        match self.tracked.get(&key) {
            Some(entry) if entry.ack_sent => {
                self.metrics.duplicate_acks_skipped += 1;
                trace!(message_id, origin = origin_node, "Duplicate ack suppressed");
                false
            }
            _ => true,
        }
    }

    /// Record that the pair has been acknowledged, tracking it if needed
    /// so a later arrival of the request is treated as a duplicate.
    pub fn mark_acknowledgment_sent(&mut self, message_id: u32, origin_node: NodeId, now: u64) {
        let key = MessageKey::new(message_id, origin_node);
        match self.tracked.get_mut(&key) {
            Some(entry) => entry.ack_sent = true,
            None => self.insert(key, now, true),
        }
        self.metrics.acknowledgments_sent += 1;
    }

    fn insert(&mut self, key: MessageKey, now: u64, ack_sent: bool) {
        if self.max_messages == 0 {
            return;
        }
        while self.tracked.len() >= self.max_messages {
            if !self.evict_oldest() {
                break;
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tracked.insert(
            key,
            TrackedMessage {
                inserted_at: now,
                sequence,
                ack_sent,
            },
        );
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .tracked
            .iter()
            .min_by_key(|(_, entry)| (entry.inserted_at, entry.sequence))
            .map(|(key, _)| *key);

        match oldest {
            Some(key) => {
                self.tracked.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Whether the pair is currently tracked
    pub fn is_tracked(&self, message_id: u32, origin_node: NodeId) -> bool {
        self.tracked
            .contains_key(&MessageKey::new(message_id, origin_node))
    }

    /// Remove entries older than the tracking window. Returns how many.
    pub fn cleanup(&mut self, now: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.tracked.len();
        self.tracked
            .retain(|_, entry| now.saturating_sub(entry.inserted_at) <= timeout);
        let removed = before - self.tracked.len();
        if removed > 0 {
            debug!(removed, remaining = self.tracked.len(), "Cleaned up tracked messages");
        }
        removed
    }

    /// Change capacity, evicting oldest entries if now over it
    pub fn set_max_messages(&mut self, max_messages: usize) {
        self.max_messages = max_messages;
        while self.tracked.len() > self.max_messages {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Capacity
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Change the tracking window
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    /// Tracking window (ms)
    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// Number of tracked pairs
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> GatewayMetrics {
        self.metrics
    }

    /// Zero counters; tracked entries are kept
    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Forget every tracked pair; counters are kept
    pub fn clear_tracked_messages(&mut self) {
        self.tracked.clear();
    }
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_MESSAGES, DEFAULT_TRACKING_TIMEOUT_MS)
    }
}
