//! Domain types for the unified bus
//!
//! Messages carry an opaque payload envelope; subscribers decode lazily using
//! decoders registered per message type. All lifecycle bookkeeping (delivery
//! records, dead letters, bus events) lives here.

use bytes::Bytes;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::domain_types::{
    AgentId, ComponentId, CorrelationId, DeliveryId, MessageId, MessageType, RetryPolicy,
    TrustScore,
};

/// Delivery priority bands, highest first
///
/// Within a band ordering is FIFO by enqueue time; across bands a ready
/// higher-priority message strictly precedes a lower one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// Never silently dropped; exhausted critical sends raise operator alerts
    Critical,
    /// Latency-sensitive governance traffic
    High,
    /// Default band
    #[default]
    Normal,
    /// Deferrable traffic
    Low,
    /// Bulk transfers and housekeeping
    Background,
}

impl MessagePriority {
    /// All bands, highest priority first
    pub const ALL: [Self; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Band index, 0 = critical
    #[must_use]
    pub fn band(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }
}

/// Opaque payload envelope
///
/// Payloads are unstructured at the bus layer; typed decoders registered per
/// message type interpret `bytes` downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    /// Optional schema hint for decoders (e.g. `"vote/v2"`)
    pub schema_hint: Option<String>,
    /// Raw payload bytes
    pub bytes: Bytes,
}

impl PayloadEnvelope {
    /// Wraps raw bytes with no schema hint
    #[must_use]
    pub fn opaque(bytes: Bytes) -> Self {
        Self {
            schema_hint: None,
            bytes,
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Routing hints supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingHints {
    /// Prefer low-latency routes and duplex transports
    pub response_required: bool,
    /// Prefer streaming-capable transports
    pub streaming_required: bool,
    /// Payload must travel encrypted
    pub security_required: bool,
    /// Caller-declared latency sensitivity
    pub latency_sensitive: bool,
}

/// Governance requirements constraining route and target selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceRequirements {
    /// Minimum trust score a route or target must carry
    pub trust_score_minimum: Option<TrustScore>,
    /// Target must support audit trails
    pub audit_required: bool,
    /// Target must support accountability reporting
    pub accountability_required: bool,
    /// Target must participate in consensus
    pub consensus_required: bool,
}

/// A message submitted to the bus
///
/// Immutable after submission; `id` must be unique for the lifetime of the
/// bus and `deadline` must not be in the past at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Caller-supplied unique id
    pub id: MessageId,
    /// Type used for routing, subscriptions, and metric buckets
    pub message_type: MessageType,
    /// Priority band
    pub priority: MessagePriority,
    /// Originating agent
    pub source: AgentId,
    /// Explicit destinations; empty means "resolve from message type"
    pub destinations: Vec<AgentId>,
    /// Opaque payload
    pub payload: PayloadEnvelope,
    /// Optional routing hints
    pub hints: Option<RoutingHints>,
    /// Correlates related messages and events
    pub correlation_id: Option<CorrelationId>,
    /// Hard deadline; the bus rejects or expires past-deadline messages
    pub deadline: SystemTime,
    /// Retry policy for failed delivery attempts
    pub retry_policy: RetryPolicy,
    /// Governance constraints, if any
    pub governance: Option<GovernanceRequirements>,
}

impl Message {
    /// Routing hints, defaulted when absent
    #[must_use]
    pub fn hints_or_default(&self) -> RoutingHints {
        self.hints.clone().unwrap_or_default()
    }
}

/// Delivery lifecycle states
///
/// `submitted → queued → scored → selected → dispatched → acked|failed|timed_out`;
/// retryable failures re-enter `scored` until attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Accepted by `Send`, not yet enqueued
    Submitted,
    /// Waiting in the priority queue
    Queued,
    /// Candidate routes scored
    Scored,
    /// A route was selected
    Selected,
    /// Frame written, awaiting ack
    Dispatched,
    /// Remote acknowledged
    Acked,
    /// Terminally failed
    Failed,
    /// Deadline passed in flight
    TimedOut,
    /// Cancelled via cancellation token
    Cancelled,
}

impl DeliveryState {
    /// Whether the state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Acked | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Per-send tracking record owned by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Opaque id returned by `Send`
    pub delivery_id: DeliveryId,
    /// Message being delivered
    pub message_id: MessageId,
    /// Current lifecycle state
    pub state: DeliveryState,
    /// Attempts so far (1-based after first dispatch)
    pub attempts: u8,
    /// Destinations that already failed and are excluded from rescoring
    pub excluded_destinations: Vec<AgentId>,
    /// Last classified error, if any
    pub last_error: Option<String>,
    /// When the message was accepted
    pub submitted_at: SystemTime,
    /// Last state change
    pub updated_at: SystemTime,
}

impl DeliveryRecord {
    /// Creates a record in `Submitted` state
    #[must_use]
    pub fn new(delivery_id: DeliveryId, message_id: MessageId, now: SystemTime) -> Self {
        Self {
            delivery_id,
            message_id,
            state: DeliveryState::Submitted,
            attempts: 0,
            excluded_destinations: Vec::new(),
            last_error: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Reasons a message lands in the dead letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No route could be found
    NoRoute,
    /// All candidates were circuit-broken
    AllRoutesOpen,
    /// Retry attempts exhausted
    RetriesExhausted,
    /// Deadline passed before delivery
    DeadlineExceeded,
    /// Remote peer rejected the message
    RemoteRejected,
    /// The queue dropped it under overflow policy
    Overflow,
    /// Cancelled by the caller
    Cancelled,
}

/// A dead-lettered message with its failure context
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The undeliverable message
    pub message: Message,
    /// Why it could not be delivered
    pub reason: FailureReason,
    /// When it was dead-lettered
    pub at: SystemTime,
}

/// Dead letter queue statistics
#[derive(Debug, Clone, Default)]
pub struct DeadLetterStats {
    /// Total messages currently held
    pub total: usize,
    /// Count per failure reason
    pub by_reason: std::collections::HashMap<FailureReason, usize>,
}

/// Unique identifier for a bus subscription
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a bus event
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Lifecycle and telemetry events fanned out by the bus
///
/// The event queue is the mediator between health, alerting, and recovery:
/// components hold a handle to the bus, never to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique id, used for duplicate suppression
    pub id: EventId,
    /// Event type for subscription matching
    pub event_type: MessageType,
    /// Component that raised the event
    pub source: ComponentId,
    /// Correlates the event with a message flow
    pub correlation_id: Option<CorrelationId>,
    /// JSON payload; subscribers decode lazily
    pub payload: serde_json::Value,
    /// When the event was published
    pub at: SystemTime,
}

/// Filter narrowing which events a subscription receives
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events from these sources, when non-empty
    pub sources: Vec<ComponentId>,
    /// Only events carrying this correlation id
    pub correlation_id: Option<CorrelationId>,
}

impl EventFilter {
    /// Whether the event passes this filter
    #[must_use]
    pub fn matches(&self, event: &BusEvent) -> bool {
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        if let Some(wanted) = &self.correlation_id {
            return event.correlation_id.as_ref() == Some(wanted);
        }
        true
    }
}

/// Per-subscription delivery options
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Serialize delivery so events arrive in submission order
    pub ordering_guaranteed: bool,
    /// Size of the duplicate-suppression id window
    pub dedup_window: usize,
    /// Bound on the subscription's private queue
    pub queue_capacity: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            ordering_guaranteed: false,
            dedup_window: 1024,
            queue_capacity: 1024,
        }
    }
}

/// Policy applied when a bounded queue hits its high-watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new item with `QueueFull`
    #[default]
    Reject,
    /// Drop the oldest queued item to make room
    DropOldest,
    /// Drop the lowest-priority queued item to make room
    DropLowestPriority,
}

/// Component heartbeat merged by `update_component_health`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentHeartbeat {
    /// Free-form status string (`"ok"`, `"degraded: queue depth"`)
    pub status: Option<String>,
    /// Counters and gauges reported by the component
    pub metrics: std::collections::HashMap<String, f64>,
}

/// Aggregated component health entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthEntry {
    /// Latest reported status
    pub status: String,
    /// Merged metrics, last writer wins per key
    pub metrics: std::collections::HashMap<String, f64>,
    /// Last heartbeat time
    pub last_heartbeat: SystemTime,
}

/// Well-known bus event types
pub mod event_types {
    /// A message was dispatched to a target
    pub const MESSAGE_DISPATCHED: &str = "bus.message_dispatched";
    /// A delivery terminally failed
    pub const DELIVERY_FAILED: &str = "bus.delivery_failed";
    /// A delivery was acknowledged
    pub const DELIVERY_ACKED: &str = "bus.delivery_acked";
    /// An agent's derived health level changed
    pub const HEALTH_CHANGED: &str = "health.changed";
    /// An alert was raised
    pub const ALERT_RAISED: &str = "alert.raised";
    /// An alert escalated one level
    pub const ALERT_ESCALATED: &str = "alert.escalated";
    /// A component switched strategy
    pub const ADAPTATION_TRIGGERED: &str = "adaptation.triggered";
    /// A recovery execution changed state
    pub const RECOVERY_STATE_CHANGED: &str = "recovery.state_changed";
    /// A critical-priority send exhausted all alternatives
    pub const CRITICAL_DELIVERY_EXHAUSTED: &str = "bus.critical_delivery_exhausted";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_band_ordering() {
        assert!(MessagePriority::Critical < MessagePriority::High);
        assert!(MessagePriority::High < MessagePriority::Normal);
        assert!(MessagePriority::Low < MessagePriority::Background);
        assert_eq!(MessagePriority::Critical.band(), 0);
        assert_eq!(MessagePriority::Background.band(), 4);
    }

    #[test]
    fn terminal_states() {
        assert!(DeliveryState::Acked.is_terminal());
        assert!(DeliveryState::TimedOut.is_terminal());
        assert!(!DeliveryState::Dispatched.is_terminal());
    }

    #[test]
    fn event_filter_matches_source_and_correlation() {
        let source = ComponentId::try_new("router".to_string()).unwrap();
        let other = ComponentId::try_new("pool".to_string()).unwrap();
        let event = BusEvent {
            id: EventId::generate(),
            event_type: MessageType::try_new("bus.delivery_acked".to_string()).unwrap(),
            source: source.clone(),
            correlation_id: None,
            payload: serde_json::Value::Null,
            at: SystemTime::now(),
        };

        let open = EventFilter::default();
        assert!(open.matches(&event));

        let narrowed = EventFilter {
            sources: vec![other],
            correlation_id: None,
        };
        assert!(!narrowed.matches(&event));

        let with_correlation = EventFilter {
            sources: vec![],
            correlation_id: Some(CorrelationId::try_new("c1".to_string()).unwrap()),
        };
        assert!(!with_correlation.matches(&event));
    }
}
