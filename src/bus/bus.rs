//! Unified bus implementation
//!
//! Owns the three internal queues (message, delivery, event), the delivery
//! record table, the dead letter queue, and the component-health registry.
//! Dispatching is delegated to an injected [`MessageDispatcher`] so the
//! routing pipeline stays replaceable in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::config::BusConfig;
use super::domain_types::{
    event_types, BusEvent, ComponentHealthEntry, ComponentHeartbeat, DeadLetter, DeadLetterStats,
    DeliveryRecord, DeliveryState, EventFilter, EventId, FailureReason, Message, MessagePriority,
    SubscriptionId, SubscriptionOptions,
};
use super::queues::{PriorityQueue, Pushed};
use super::subscriptions::{EventSink, SubscriptionRegistry};
use crate::cancel::CancellationToken;
use crate::domain_types::{AgentId, ComponentId, DeliveryId, MessageId, MessageType, ProtocolId};
use crate::error::CommError;
use crate::time_provider::TimeProvider;

/// Outcome of a successful dispatch attempt
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Destination the message was delivered to
    pub destination: AgentId,
    /// Transport profile used
    pub protocol: ProtocolId,
    /// Observed round-trip latency to ack
    pub latency: Duration,
}

/// A failed dispatch attempt with enough context to rescore
#[derive(Debug)]
pub struct DispatchFailure {
    /// Classified error
    pub error: CommError,
    /// Destination that failed, excluded from the next scoring pass
    pub failed_destination: Option<AgentId>,
}

/// Seam between the bus and the routing pipeline
///
/// The production implementation chains router, protocol selector, load
/// balancer, and pool manager; tests substitute a mock.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Scores, selects, and delivers one message attempt
    async fn dispatch(
        &self,
        message: &Message,
        excluded: &[AgentId],
    ) -> Result<DispatchOutcome, DispatchFailure>;
}

/// Windowed throughput tracker (messages per second over the window)
struct ThroughputTracker {
    window: Duration,
    samples: DashMap<u64, u64>,
}

impl ThroughputTracker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: DashMap::new(),
        }
    }

    fn record(&self, epoch_secs: u64) {
        self.samples
            .entry(epoch_secs)
            .and_modify(|count| *count += 1)
            .or_insert(1);
        let cutoff = epoch_secs.saturating_sub(self.window.as_secs());
        self.samples.retain(|&second, _| second >= cutoff);
    }

    fn rate(&self, epoch_secs: u64) -> f64 {
        let cutoff = epoch_secs.saturating_sub(self.window.as_secs());
        let total: u64 = self
            .samples
            .iter()
            .filter(|entry| *entry.key() >= cutoff)
            .map(|entry| *entry.value())
            .sum();
        (total as f64) / self.window.as_secs_f64()
    }
}

/// Bounded window of message ids for uniqueness enforcement
struct IdWindow {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
    capacity: usize,
}

impl IdWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    /// Releases an id that was never enqueued, so a retry can reuse it
    fn remove(&mut self, id: &MessageId) {
        if self.seen.remove(id) {
            self.order.retain(|seen_id| seen_id != id);
        }
    }
}

struct QueuedMessage {
    message: Message,
    delivery_id: DeliveryId,
    cancel: CancellationToken,
}

/// Bus performance statistics
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Total messages accepted by `send`
    pub messages_accepted: u64,
    /// Total terminal failures
    pub messages_failed: u64,
    /// Total acknowledged deliveries
    pub messages_acked: u64,
    /// Messages per second over the tracker window
    pub throughput_per_second: f64,
    /// Message queue depth per priority band, highest first
    pub queue_depths: [usize; 5],
    /// Active subscriptions
    pub subscriptions: usize,
    /// Dead letter statistics
    pub dead_letters: DeadLetterStats,
}

/// The single ingress/egress for all cross-component traffic
pub struct UnifiedBus {
    config: BusConfig,
    time: Arc<dyn TimeProvider>,
    dispatcher: Arc<dyn MessageDispatcher>,

    message_queue: Arc<PriorityQueue<QueuedMessage>>,
    event_sender: mpsc::Sender<BusEvent>,
    event_receiver: Mutex<Option<mpsc::Receiver<BusEvent>>>,

    deliveries: DashMap<DeliveryId, DeliveryRecord>,
    id_window: Mutex<IdWindow>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    component_health: DashMap<ComponentId, ComponentHealthEntry>,
    subscriptions: SubscriptionRegistry,

    accepted: AtomicU64,
    failed: AtomicU64,
    acked: AtomicU64,
    throughput: ThroughputTracker,

    is_running: AtomicBool,
    is_shutdown: AtomicBool,
}

impl UnifiedBus {
    /// Creates a bus with the given configuration, clock, and dispatcher
    ///
    /// # Errors
    /// Returns `CommError::Validation` when the configuration is invalid.
    pub fn new(
        config: BusConfig,
        time: Arc<dyn TimeProvider>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Arc<Self>, CommError> {
        config.validate().map_err(|e| CommError::Validation {
            field: "bus_config".to_string(),
            reason: e.to_string(),
        })?;

        let message_queue = Arc::new(PriorityQueue::new(
            config.message_queue_capacity.as_usize(),
            config.high_watermark,
            config.overflow_policy,
        ));
        let (event_sender, event_receiver) = mpsc::channel(config.event_queue_capacity.as_usize());
        let id_window = Mutex::new(IdWindow::new(config.id_window_size));

        info!(workers = config.worker_count, "unified bus created");

        Ok(Arc::new(Self {
            id_window,
            message_queue,
            event_sender,
            event_receiver: Mutex::new(Some(event_receiver)),
            deliveries: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            component_health: DashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            accepted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            throughput: ThroughputTracker::new(Duration::from_secs(60)),
            is_running: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
            config,
            time,
            dispatcher,
        }))
    }

    /// Starts the message workers and the event fan-out loop; idempotent
    pub fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("bus already running");
            return;
        }

        for worker_id in 0..self.config.worker_count {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                bus.run_worker(worker_id).await;
            });
        }

        let receiver = self
            .event_receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut receiver) = receiver {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    bus.subscriptions.fan_out(&event);
                }
                trace!("event fan-out loop exited");
            });
        }

        info!(workers = self.config.worker_count, "unified bus started");
    }

    /// Initiates graceful shutdown; queued messages drain, new sends fail
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.message_queue.close();
        info!("unified bus shutting down");
    }

    /// Submits a message for delivery
    ///
    /// Validates uniqueness, payload size, and deadline before enqueueing.
    /// Returns an opaque delivery id once the message is durably enqueued.
    ///
    /// # Errors
    /// `Validation` on malformed input, `DeadlineExceeded` on a past deadline,
    /// `QueueFull` when the ingress queue is at its high-watermark.
    pub fn send(&self, message: Message) -> Result<DeliveryId, CommError> {
        self.send_with_cancel(message, CancellationToken::never())
    }

    /// [`send`](Self::send) with a caller-owned cancellation token
    ///
    /// # Errors
    /// See [`send`](Self::send).
    pub fn send_with_cancel(
        &self,
        message: Message,
        cancel: CancellationToken,
    ) -> Result<DeliveryId, CommError> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(CommError::Cancelled {
                operation: "send (bus shut down)".to_string(),
            });
        }

        self.validate(&message)?;

        {
            let mut window = self
                .id_window
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !window.insert(message.id.clone()) {
                return Err(CommError::Validation {
                    field: "id".to_string(),
                    reason: format!("duplicate message id {}", message.id),
                });
            }
        }

        let now = self.time.now();
        let delivery_id = DeliveryId::generate();
        let message_id = message.id.clone();
        let mut record = DeliveryRecord::new(delivery_id, message_id.clone(), now);
        record.state = DeliveryState::Queued;
        record.updated_at = now;
        self.deliveries.insert(delivery_id, record);

        let priority = message.priority;
        let queued = QueuedMessage {
            message,
            delivery_id,
            cancel,
        };
        match self.message_queue.push(priority, queued) {
            Ok(Pushed::Accepted) => {}
            Ok(Pushed::Displaced { victim, .. }) => {
                self.transition(victim.delivery_id, DeliveryState::Failed, Some("displaced by overflow policy".to_string()));
                self.dead_letter(victim.message, FailureReason::Overflow);
            }
            Err(full) => {
                // QueueFull is retryable backpressure: the message was never
                // enqueued, so its id must not stay burned in the window.
                self.deliveries.remove(&delivery_id);
                self.id_window
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&message_id);
                drop(full);
                return Err(CommError::QueueFull {
                    queue: "message".to_string(),
                });
            }
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(delivery_id)
    }

    fn validate(&self, message: &Message) -> Result<(), CommError> {
        if message.payload.is_empty() {
            return Err(CommError::Validation {
                field: "payload".to_string(),
                reason: "payload must not be empty".to_string(),
            });
        }
        if message.payload.len() > self.config.max_payload_bytes {
            return Err(CommError::Validation {
                field: "payload".to_string(),
                reason: format!(
                    "payload of {} bytes exceeds limit of {}",
                    message.payload.len(),
                    self.config.max_payload_bytes
                ),
            });
        }
        if message.deadline < self.time.now() {
            return Err(CommError::DeadlineExceeded {
                message_id: message.id.clone(),
            });
        }
        Ok(())
    }

    /// Registers a subscription for matching event types
    pub fn subscribe(
        &self,
        subscriber: ComponentId,
        types: Vec<MessageType>,
        filter: EventFilter,
        opts: SubscriptionOptions,
        sink: Arc<dyn EventSink>,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(subscriber, types, filter, opts, sink)
    }

    /// Removes a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Publishes an event; fan-out is asynchronous and best-effort
    ///
    /// # Errors
    /// `QueueFull` when the event queue is at capacity.
    pub fn publish_event(&self, event: BusEvent) -> Result<(), CommError> {
        match self.event_sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(CommError::QueueFull {
                queue: "event".to_string(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommError::Cancelled {
                operation: "publish_event (bus shut down)".to_string(),
            }),
        }
    }

    /// Merges a component heartbeat into the health registry
    pub fn update_component_health(&self, component: ComponentId, heartbeat: ComponentHeartbeat) {
        let now = self.time.now();
        match self.component_health.entry(component) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if let Some(status) = heartbeat.status {
                    entry.status = status;
                }
                for (key, value) in heartbeat.metrics {
                    entry.metrics.insert(key, value);
                }
                entry.last_heartbeat = now;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ComponentHealthEntry {
                    status: heartbeat.status.unwrap_or_else(|| "ok".to_string()),
                    metrics: heartbeat.metrics,
                    last_heartbeat: now,
                });
            }
        }
    }

    /// Snapshot of the component-health registry
    #[must_use]
    pub fn component_health(&self) -> HashMap<ComponentId, ComponentHealthEntry> {
        self.component_health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Current delivery record for a send, if still tracked
    #[must_use]
    pub fn delivery(&self, id: DeliveryId) -> Option<DeliveryRecord> {
        self.deliveries.get(&id).map(|r| r.value().clone())
    }

    /// Cancels an in-flight delivery; observed at the next suspension point
    pub fn cancel_delivery(&self, id: DeliveryId) {
        if let Some(mut record) = self.deliveries.get_mut(&id) {
            if !record.state.is_terminal() {
                record.state = DeliveryState::Cancelled;
                record.updated_at = self.time.now();
            }
        }
    }

    /// Dead letter statistics
    #[must_use]
    pub fn dead_letter_stats(&self) -> DeadLetterStats {
        let letters = self
            .dead_letters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut by_reason: HashMap<FailureReason, usize> = HashMap::new();
        for letter in letters.iter() {
            *by_reason.entry(letter.reason).or_insert(0) += 1;
        }
        DeadLetterStats {
            total: letters.len(),
            by_reason,
        }
    }

    /// Current bus statistics
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_accepted: self.accepted.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_acked: self.acked.load(Ordering::Relaxed),
            throughput_per_second: self.throughput.rate(self.time.epoch_millis() / 1000),
            queue_depths: self.message_queue.depths(),
            subscriptions: self.subscriptions.len(),
            dead_letters: self.dead_letter_stats(),
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "bus worker started");
        while let Some((_, queued)) = self.message_queue.pop().await {
            self.process(queued).await;
        }
        debug!(worker_id, "bus worker exited");
    }

    async fn process(&self, queued: QueuedMessage) {
        let QueuedMessage {
            message,
            delivery_id,
            cancel,
        } = queued;

        // Respect a cancellation that raced the queue.
        if cancel.is_cancelled() || self.is_cancelled(delivery_id) {
            self.transition(delivery_id, DeliveryState::Cancelled, None);
            self.dead_letter(message, FailureReason::Cancelled);
            return;
        }

        if message.deadline < self.time.now() {
            self.transition(delivery_id, DeliveryState::TimedOut, Some("deadline passed in queue".to_string()));
            self.fail_terminally(message, FailureReason::DeadlineExceeded, delivery_id);
            return;
        }

        let max_attempts = message.retry_policy.max_attempts.as_u8();
        let mut excluded: Vec<AgentId> = Vec::new();

        for attempt in 1..=max_attempts {
            self.transition(delivery_id, DeliveryState::Scored, None);
            if let Some(mut record) = self.deliveries.get_mut(&delivery_id) {
                record.attempts = attempt;
                record.excluded_destinations.clone_from(&excluded);
            }

            match self.dispatcher.dispatch(&message, &excluded).await {
                Ok(outcome) => {
                    self.transition(delivery_id, DeliveryState::Acked, None);
                    self.acked.fetch_add(1, Ordering::Relaxed);
                    self.throughput.record(self.time.epoch_millis() / 1000);
                    // Deliver the envelope to message-type subscribers, who
                    // decode lazily.
                    self.emit(
                        message.message_type.as_ref(),
                        &message,
                        json!({
                            "message_id": message.id.to_string(),
                            "source": message.source.to_string(),
                            "destination": outcome.destination.to_string(),
                            "envelope": serde_json::to_value(&message.payload)
                                .unwrap_or(serde_json::Value::Null),
                        }),
                    );
                    if self.config.emit_lifecycle_events {
                        self.emit(
                            event_types::DELIVERY_ACKED,
                            &message,
                            json!({
                                "delivery_id": delivery_id.to_string(),
                                "destination": outcome.destination.to_string(),
                                "protocol": outcome.protocol.to_string(),
                                "latency_ms": outcome.latency.as_millis() as u64,
                                "attempt": attempt,
                            }),
                        );
                    }
                    return;
                }
                Err(failure) => {
                    warn!(
                        message = %message.id,
                        attempt,
                        error = %failure.error,
                        "dispatch attempt failed"
                    );
                    self.transition(
                        delivery_id,
                        DeliveryState::Scored,
                        Some(failure.error.to_string()),
                    );
                    if let Some(dest) = failure.failed_destination {
                        if !excluded.contains(&dest) {
                            excluded.push(dest);
                        }
                    }
                    let retryable = failure.error.is_retryable() && attempt < max_attempts;
                    if !retryable {
                        let reason = match &failure.error {
                            CommError::NoRoute { .. } => FailureReason::NoRoute,
                            CommError::AllRoutesOpen { .. } => FailureReason::AllRoutesOpen,
                            CommError::RemoteRejected { .. } => FailureReason::RemoteRejected,
                            CommError::DeadlineExceeded { .. } => FailureReason::DeadlineExceeded,
                            _ => FailureReason::RetriesExhausted,
                        };
                        self.transition(delivery_id, DeliveryState::Failed, Some(failure.error.to_string()));
                        self.fail_terminally(message, reason, delivery_id);
                        return;
                    }
                    // Backoff before the rescoring pass; cancellation is a
                    // suspension point.
                    let delay = message.retry_policy.delay_for_attempt(attempt);
                    tokio::select! {
                        () = self.time.sleep(delay) => {}
                        () = cancel.cancelled() => {}
                    }
                    if cancel.is_cancelled() || self.is_cancelled(delivery_id) {
                        self.transition(delivery_id, DeliveryState::Cancelled, None);
                        self.dead_letter(message, FailureReason::Cancelled);
                        return;
                    }
                    if message.deadline < self.time.now() {
                        self.transition(delivery_id, DeliveryState::TimedOut, None);
                        self.fail_terminally(message, FailureReason::DeadlineExceeded, delivery_id);
                        return;
                    }
                }
            }
        }
    }

    fn is_cancelled(&self, id: DeliveryId) -> bool {
        self.deliveries
            .get(&id)
            .is_some_and(|r| r.state == DeliveryState::Cancelled)
    }

    fn transition(&self, id: DeliveryId, state: DeliveryState, error: Option<String>) {
        if let Some(mut record) = self.deliveries.get_mut(&id) {
            // Cancelled is sticky: a worker observing it must not overwrite.
            if record.state == DeliveryState::Cancelled && state != DeliveryState::Cancelled {
                return;
            }
            record.state = state;
            record.updated_at = self.time.now();
            if let Some(error) = error {
                record.last_error = Some(error);
            }
        }
    }

    fn fail_terminally(&self, message: Message, reason: FailureReason, delivery_id: DeliveryId) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if self.config.emit_lifecycle_events {
            self.emit(
                event_types::DELIVERY_FAILED,
                &message,
                json!({
                    "delivery_id": delivery_id.to_string(),
                    "reason": format!("{reason:?}"),
                }),
            );
        }
        // A critical send that exhausts all alternatives is operator-visible.
        if message.priority == MessagePriority::Critical {
            self.emit(
                event_types::CRITICAL_DELIVERY_EXHAUSTED,
                &message,
                json!({
                    "message_id": message.id.to_string(),
                    "source": message.source.to_string(),
                    "reason": format!("{reason:?}"),
                }),
            );
        }
        self.dead_letter(message, reason);
    }

    fn dead_letter(&self, message: Message, reason: FailureReason) {
        let mut letters = self
            .dead_letters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if letters.len() >= self.config.dead_letter_capacity {
            letters.pop_front();
        }
        trace!(message = %message.id, ?reason, "message dead-lettered");
        letters.push_back(DeadLetter {
            message,
            reason,
            at: self.time.now(),
        });
    }

    fn emit(&self, event_type: &str, message: &Message, payload: serde_json::Value) {
        let Ok(event_type) = MessageType::try_new(event_type.to_string()) else {
            return;
        };
        let Ok(source) = ComponentId::try_new("bus".to_string()) else {
            return;
        };
        let event = BusEvent {
            id: EventId::generate(),
            event_type,
            source,
            correlation_id: message.correlation_id.clone(),
            payload,
            at: self.time.now(),
        };
        if let Err(err) = self.publish_event(event) {
            trace!(error = %err, "lifecycle event dropped");
        }
    }
}

impl std::fmt::Debug for UnifiedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedBus")
            .field("running", &self.is_running.load(Ordering::SeqCst))
            .field("queue_depths", &self.message_queue.depths())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::domain_types::PayloadEnvelope;
    use crate::domain_types::RetryPolicy;
    use crate::time_provider::MockTimeProvider;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct StubDispatcher {
        fail_first: AtomicU64,
        dispatched: StdMutex<Vec<MessageId>>,
    }

    impl StubDispatcher {
        fn new(failures: u64) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicU64::new(failures),
                dispatched: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageDispatcher for StubDispatcher {
        async fn dispatch(
            &self,
            message: &Message,
            _excluded: &[AgentId],
        ) -> Result<DispatchOutcome, DispatchFailure> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(DispatchFailure {
                    error: CommError::RemoteTimeout { timeout_ms: 10 },
                    failed_destination: message.destinations.first().cloned(),
                });
            }
            self.dispatched.lock().unwrap().push(message.id.clone());
            Ok(DispatchOutcome {
                destination: message
                    .destinations
                    .first()
                    .cloned()
                    .unwrap_or_else(|| AgentId::try_new("default".to_string()).unwrap()),
                protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
                latency: Duration::from_millis(5),
            })
        }
    }

    fn make_message(id: &str, priority: MessagePriority) -> Message {
        Message {
            id: MessageId::try_new(id.to_string()).unwrap(),
            message_type: MessageType::try_new("task_assignment".to_string()).unwrap(),
            priority,
            source: AgentId::try_new("source".to_string()).unwrap(),
            destinations: vec![AgentId::try_new("target".to_string()).unwrap()],
            payload: PayloadEnvelope::opaque(Bytes::from_static(b"{}")),
            hints: None,
            correlation_id: None,
            deadline: SystemTime::now() + Duration::from_secs(60),
            retry_policy: RetryPolicy {
                initial_delay: crate::domain_types::RetryDelayMs::try_new(10).unwrap(),
                ..RetryPolicy::default()
            },
            governance: None,
        }
    }

    fn make_bus(dispatcher: Arc<dyn MessageDispatcher>) -> Arc<UnifiedBus> {
        let bus = UnifiedBus::new(
            BusConfig::testing(),
            Arc::new(MockTimeProvider::new()),
            dispatcher,
        )
        .unwrap();
        bus.start();
        bus
    }

    #[tokio::test]
    async fn send_reaches_acked() {
        let dispatcher = StubDispatcher::new(0);
        let bus = make_bus(dispatcher.clone());
        let delivery_id = bus.send(make_message("m1", MessagePriority::Normal)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = bus.delivery(delivery_id).unwrap();
        assert_eq!(record.state, DeliveryState::Acked);
        assert_eq!(dispatcher.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let bus = make_bus(StubDispatcher::new(0));
        bus.send(make_message("dup", MessagePriority::Normal)).unwrap();
        let err = bus.send(make_message("dup", MessagePriority::Normal)).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn queue_full_releases_the_message_id() {
        // Workers never started, so the tiny queue stays full.
        let config = BusConfig {
            message_queue_capacity: crate::domain_types::ChannelCapacity::try_new(2).unwrap(),
            ..BusConfig::testing()
        };
        let bus = UnifiedBus::new(
            config,
            Arc::new(MockTimeProvider::new()),
            StubDispatcher::new(0),
        )
        .unwrap();
        bus.send(make_message("fill-a", MessagePriority::Normal)).unwrap();
        bus.send(make_message("fill-b", MessagePriority::Normal)).unwrap();

        let err = bus.send(make_message("retry-me", MessagePriority::Normal)).unwrap_err();
        assert_eq!(err.kind(), "queue_full");
        assert!(err.is_retryable());

        // The rejected id was never enqueued; a retry with the same immutable
        // id must hit backpressure again, not duplicate-id validation.
        let err = bus.send(make_message("retry-me", MessagePriority::Normal)).unwrap_err();
        assert_eq!(err.kind(), "queue_full");
    }

    #[tokio::test]
    async fn past_deadline_rejected_at_send() {
        let bus = make_bus(StubDispatcher::new(0));
        let mut message = make_message("late", MessagePriority::Normal);
        message.deadline = SystemTime::now() - Duration::from_secs(1);
        let err = bus.send(message).unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
    }

    #[tokio::test]
    async fn retryable_failures_are_retried() {
        let dispatcher = StubDispatcher::new(1);
        let bus = make_bus(dispatcher.clone());
        let mut message = make_message("retry", MessagePriority::Normal);
        message.retry_policy.max_attempts = crate::domain_types::MaxRetries::try_new(3).unwrap();
        let delivery_id = bus.send(message).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = bus.delivery(delivery_id).unwrap();
        assert_eq!(record.state, DeliveryState::Acked);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.excluded_destinations.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let dispatcher = StubDispatcher::new(10);
        let bus = make_bus(dispatcher);
        let delivery_id = bus.send(make_message("doomed", MessagePriority::Normal)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = bus.delivery(delivery_id).unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert_eq!(bus.dead_letter_stats().total, 1);
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let bus = make_bus(StubDispatcher::new(0));
        let mut message = make_message("big", MessagePriority::Normal);
        message.payload = PayloadEnvelope::opaque(Bytes::from(vec![0u8; 100_000]));
        let err = bus.send(message).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn component_heartbeats_merge() {
        let bus = make_bus(StubDispatcher::new(0));
        let component = ComponentId::try_new("router".to_string()).unwrap();
        bus.update_component_health(
            component.clone(),
            ComponentHeartbeat {
                status: Some("ok".to_string()),
                metrics: HashMap::from([("depth".to_string(), 3.0)]),
            },
        );
        bus.update_component_health(
            component.clone(),
            ComponentHeartbeat {
                status: None,
                metrics: HashMap::from([("depth".to_string(), 5.0)]),
            },
        );
        let health = bus.component_health();
        let entry = health.get(&component).unwrap();
        assert_eq!(entry.status, "ok");
        assert!((entry.metrics["depth"] - 5.0).abs() < f64::EPSILON);
    }
}
