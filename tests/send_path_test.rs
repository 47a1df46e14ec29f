//! End-to-end send over the full pipeline

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agora::bus::domain_types::{
    BusEvent, DeliveryState, EventFilter, MessagePriority, SubscriptionOptions,
};
use agora::bus::subscriptions::EventSink;
use agora::domain_types::{ComponentId, MessageType};
use agora::pool::config::CircuitBreakerConfig;

use common::{message, TestCore};

struct Recorder {
    seen: Mutex<Vec<BusEvent>>,
}

#[async_trait]
impl EventSink for Recorder {
    async fn deliver(&self, event: BusEvent) {
        self.seen.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn send_happy_path_delivers_exactly_once() {
    let core = TestCore::start(CircuitBreakerConfig::default());
    core.register_target("target-t", 0.9, 0.99, 50.0);

    let sink = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    core.bus.subscribe(
        ComponentId::try_new("subscriber".to_string()).unwrap(),
        vec![MessageType::try_new("task_assignment".to_string()).unwrap()],
        EventFilter::default(),
        SubscriptionOptions {
            ordering_guaranteed: true,
            ..SubscriptionOptions::default()
        },
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );

    let delivery_id = core
        .bus
        .send(message("m1", "task_assignment", MessagePriority::Normal, "target-t"))
        .unwrap();

    // Within a second the subscription sees m1 exactly once.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = core.bus.delivery(delivery_id).unwrap();
    assert_eq!(record.state, DeliveryState::Acked);

    let seen = sink.seen.lock().unwrap();
    let matching: Vec<_> = seen
        .iter()
        .filter(|event| event.payload["message_id"] == "m1")
        .collect();
    assert_eq!(matching.len(), 1, "m1 delivered exactly once");

    // The target's pool holds at least one idle connection afterwards.
    let metrics = core.pools.all_metrics();
    assert!(!metrics.is_empty());
    assert!(metrics.iter().any(|(_, m)| m.idle >= 1));
}

#[tokio::test]
async fn unknown_destination_fails_with_no_route() {
    let core = TestCore::start(CircuitBreakerConfig::default());
    let delivery_id = core
        .bus
        .send(message("m2", "task_assignment", MessagePriority::Normal, "ghost"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = core.bus.delivery(delivery_id).unwrap();
    assert_eq!(record.state, DeliveryState::Failed);
    assert!(record.last_error.unwrap().contains("No route"));
    assert_eq!(core.bus.dead_letter_stats().total, 1);
}
