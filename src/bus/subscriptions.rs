//! Subscription registry and event fan-out
//!
//! Replaces implicit emitter-style pub/sub with an explicit registry keyed by
//! event type. Each subscription owns a bounded queue and a worker task;
//! delivery is best-effort per subscription. When ordering is guaranteed the
//! worker awaits each delivery before the next; otherwise deliveries may run
//! concurrently. Duplicate suppression uses a bounded id window, so false
//! negatives are possible beyond the window.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};

use super::domain_types::{BusEvent, EventFilter, EventId, SubscriptionId, SubscriptionOptions};
use crate::domain_types::{ComponentId, MessageType};

/// Receiver side of a subscription
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handles one event; the envelope is decoded lazily by the subscriber
    async fn deliver(&self, event: BusEvent);
}

/// Concurrent deliveries per unordered subscription
const UNORDERED_CONCURRENCY: usize = 8;

struct SubscriptionEntry {
    subscriber: ComponentId,
    types: HashSet<MessageType>,
    filter: EventFilter,
    sender: mpsc::Sender<BusEvent>,
}

/// Bounded id window for duplicate suppression
struct DedupWindow {
    order: VecDeque<EventId>,
    seen: HashSet<EventId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records the id; returns false if it was already within the window
    fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
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
}

/// Registry of active subscriptions with fan-out
pub struct SubscriptionRegistry {
    entries: DashMap<SubscriptionId, SubscriptionEntry>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.entries.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers a subscription and spawns its worker
    ///
    /// An empty `types` list subscribes to every event type.
    pub fn subscribe(
        &self,
        subscriber: ComponentId,
        types: Vec<MessageType>,
        filter: EventFilter,
        opts: SubscriptionOptions,
        sink: Arc<dyn EventSink>,
    ) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let (sender, receiver) = mpsc::channel(opts.queue_capacity.max(1));

        debug!(
            subscription = %id,
            subscriber = %subscriber,
            types = types.len(),
            ordered = opts.ordering_guaranteed,
            "subscription registered"
        );

        tokio::spawn(run_worker(id, receiver, sink, opts));

        self.entries.insert(
            id,
            SubscriptionEntry {
                subscriber,
                types: types.into_iter().collect(),
                filter,
                sender,
            },
        );
        id
    }

    /// Removes a subscription; its worker drains and exits
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "subscription removed");
        }
        removed
    }

    /// Fans an event out to every matching subscription, best-effort
    ///
    /// Returns the number of subscriptions the event was queued for.
    pub fn fan_out(&self, event: &BusEvent) -> usize {
        let mut queued = 0;
        for entry in &self.entries {
            let sub = entry.value();
            if !sub.types.is_empty() && !sub.types.contains(&event.event_type) {
                continue;
            }
            if !sub.filter.matches(event) {
                continue;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscription = %entry.key(),
                        subscriber = %sub.subscriber,
                        event = %event.id,
                        "subscription queue full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subscription = %entry.key(), "subscription worker gone");
                }
            }
        }
        queued
    }

    /// Number of active subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no subscriptions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    id: SubscriptionId,
    mut receiver: mpsc::Receiver<BusEvent>,
    sink: Arc<dyn EventSink>,
    opts: SubscriptionOptions,
) {
    let mut dedup = DedupWindow::new(opts.dedup_window);
    let limiter = Arc::new(Semaphore::new(UNORDERED_CONCURRENCY));

    while let Some(event) = receiver.recv().await {
        if !dedup.insert(event.id) {
            trace!(subscription = %id, event = %event.id, "duplicate suppressed");
            continue;
        }
        if opts.ordering_guaranteed {
            sink.deliver(event).await;
        } else {
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                sink.deliver(event).await;
                drop(permit);
            });
        }
    }
    trace!(subscription = %id, "subscription worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::SystemTime;

    struct Recorder {
        seen: Mutex<Vec<EventId>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn deliver(&self, event: BusEvent) {
            self.seen.lock().unwrap().push(event.id);
        }
    }

    fn make_event(event_type: &str) -> BusEvent {
        BusEvent {
            id: EventId::generate(),
            event_type: MessageType::try_new(event_type.to_string()).unwrap(),
            source: ComponentId::try_new("test".to_string()).unwrap(),
            correlation_id: None,
            payload: serde_json::Value::Null,
            at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn events_reach_matching_subscriptions_once() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.subscribe(
            ComponentId::try_new("sub".to_string()).unwrap(),
            vec![MessageType::try_new("health.changed".to_string()).unwrap()],
            EventFilter::default(),
            SubscriptionOptions {
                ordering_guaranteed: true,
                ..SubscriptionOptions::default()
            },
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        let event = make_event("health.changed");
        assert_eq!(registry.fan_out(&event), 1);
        // Duplicate of the same event id is suppressed by the worker.
        assert_eq!(registry.fan_out(&event), 1);
        let other = make_event("alert.raised");
        assert_eq!(registry.fan_out(&other), 0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], event.id);
    }

    #[tokio::test]
    async fn ordered_subscription_preserves_submission_order() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.subscribe(
            ComponentId::try_new("sub".to_string()).unwrap(),
            vec![],
            EventFilter::default(),
            SubscriptionOptions {
                ordering_guaranteed: true,
                ..SubscriptionOptions::default()
            },
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );

        let events: Vec<BusEvent> = (0..20).map(|_| make_event("tick")).collect();
        for event in &events {
            registry.fan_out(event);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let seen = sink.seen.lock().unwrap();
        let expected: Vec<EventId> = events.iter().map(|e| e.id).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let id = registry.subscribe(
            ComponentId::try_new("sub".to_string()).unwrap(),
            vec![],
            EventFilter::default(),
            SubscriptionOptions::default(),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        assert!(registry.unsubscribe(id));
        assert_eq!(registry.fan_out(&make_event("tick")), 0);
    }

    #[test]
    fn dedup_window_is_bounded() {
        let mut window = DedupWindow::new(2);
        let a = EventId::generate();
        let b = EventId::generate();
        let c = EventId::generate();
        assert!(window.insert(a));
        assert!(window.insert(b));
        assert!(!window.insert(a));
        assert!(window.insert(c)); // evicts a
        assert!(window.insert(a)); // false negative beyond the window
    }
}
