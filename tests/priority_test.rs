//! Priority preemption through the bus queue

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use agora::bus::bus::{DispatchFailure, DispatchOutcome, MessageDispatcher, UnifiedBus};
use agora::bus::config::BusConfig;
use agora::bus::domain_types::{Message, MessagePriority, PayloadEnvelope};
use agora::domain_types::{
    AgentId, ChannelCapacity, MessageId, MessageType, ProtocolId, RetryPolicy,
};
use agora::time_provider::MockTimeProvider;

/// Dispatcher that records dispatch order and simulates per-message work
struct SlowRecorder {
    order: Mutex<Vec<String>>,
    delay: Duration,
}

#[async_trait]
impl MessageDispatcher for SlowRecorder {
    async fn dispatch(
        &self,
        message: &Message,
        _excluded: &[AgentId],
    ) -> Result<DispatchOutcome, DispatchFailure> {
        tokio::time::sleep(self.delay).await;
        self.order.lock().unwrap().push(message.id.to_string());
        Ok(DispatchOutcome {
            destination: AgentId::try_new("t".to_string()).unwrap(),
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            latency: self.delay,
        })
    }
}

fn make_message(id: &str, priority: MessagePriority) -> Message {
    Message {
        id: MessageId::try_new(id.to_string()).unwrap(),
        message_type: MessageType::try_new("work".to_string()).unwrap(),
        priority,
        source: AgentId::try_new("s".to_string()).unwrap(),
        destinations: vec![AgentId::try_new("t".to_string()).unwrap()],
        payload: PayloadEnvelope::opaque(Bytes::from_static(b"x")),
        hints: None,
        correlation_id: None,
        deadline: SystemTime::now() + Duration::from_secs(60),
        retry_policy: RetryPolicy::default(),
        governance: None,
    }
}

#[tokio::test]
async fn critical_preempts_queued_normals() {
    let dispatcher = Arc::new(SlowRecorder {
        order: Mutex::new(Vec::new()),
        delay: Duration::from_millis(5),
    });
    let config = BusConfig {
        worker_count: 1,
        message_queue_capacity: ChannelCapacity::try_new(500).unwrap(),
        ..BusConfig::testing()
    };
    let bus = UnifiedBus::new(config, Arc::new(MockTimeProvider::new()), dispatcher.clone()).unwrap();

    // Queue 100 normals, then one critical, then start the single worker.
    for n in 0..100 {
        bus.send(make_message(&format!("normal-{n}"), MessagePriority::Normal))
            .unwrap();
    }
    bus.send(make_message("critical-1", MessagePriority::Critical))
        .unwrap();
    bus.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let order = dispatcher.order.lock().unwrap();
    assert!(!order.is_empty());
    // The critical message is dispatched first: nothing was in flight when
    // the worker started, so the highest band wins immediately.
    assert_eq!(order[0], "critical-1");
}

#[tokio::test]
async fn critical_jumps_ahead_of_inflight_backlog() {
    let dispatcher = Arc::new(SlowRecorder {
        order: Mutex::new(Vec::new()),
        delay: Duration::from_millis(10),
    });
    let config = BusConfig {
        worker_count: 1,
        ..BusConfig::testing()
    };
    let bus = UnifiedBus::new(config, Arc::new(MockTimeProvider::new()), dispatcher.clone()).unwrap();
    bus.start();

    for n in 0..20 {
        bus.send(make_message(&format!("normal-{n}"), MessagePriority::Normal))
            .unwrap();
    }
    // Let the worker pick up the first normal, then submit the critical.
    tokio::time::sleep(Duration::from_millis(15)).await;
    bus.send(make_message("critical-1", MessagePriority::Critical))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let order = dispatcher.order.lock().unwrap();
    let critical_pos = order.iter().position(|id| id == "critical-1").unwrap();
    // The currently-processing message may finish first; the critical is
    // dispatched next, ahead of the remaining normals.
    assert!(
        critical_pos <= 2,
        "critical dispatched at position {critical_pos}, order: {order:?}"
    );
    assert_eq!(order.len(), 21);
}

#[tokio::test]
async fn equal_priority_preserves_enqueue_order() {
    let dispatcher = Arc::new(SlowRecorder {
        order: Mutex::new(Vec::new()),
        delay: Duration::from_millis(1),
    });
    let bus = UnifiedBus::new(
        BusConfig {
            worker_count: 1,
            ..BusConfig::testing()
        },
        Arc::new(MockTimeProvider::new()),
        dispatcher.clone(),
    )
    .unwrap();

    for n in 0..50 {
        bus.send(make_message(&format!("m-{n:02}"), MessagePriority::Normal))
            .unwrap();
    }
    bus.start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let order = dispatcher.order.lock().unwrap();
    let expected: Vec<String> = (0..50).map(|n| format!("m-{n:02}")).collect();
    assert_eq!(*order, expected);
}
