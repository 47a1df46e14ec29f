//! Circuit breaker cycle through the full pipeline

mod common;

use std::time::Duration;

use agora::bus::domain_types::{DeliveryState, MessagePriority};
use agora::domain_types::AgentId;
use agora::pool::config::CircuitBreakerConfig;

use common::{message, TestCore};

fn breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 1,
        timeout: Duration::from_secs(30),
    }
}

async fn send_and_wait(core: &TestCore, id: &str) -> DeliveryState {
    let delivery_id = core
        .bus
        .send(message(id, "task_assignment", MessagePriority::Normal, "target-t"))
        .unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(record) = core.bus.delivery(delivery_id) {
            if record.state.is_terminal() {
                return record.state;
            }
        }
    }
    panic!("delivery {id} never reached a terminal state");
}

#[tokio::test]
async fn three_failures_open_the_breaker_then_probe_recloses() {
    let core = TestCore::start(breaker());
    core.register_target("target-t", 0.9, 0.99, 50.0);

    // Warm the pool so failure injection reaches live transports.
    assert_eq!(send_and_wait(&core, "warm").await, DeliveryState::Acked);

    for transport in core.factory.transports() {
        transport.inject_failure(true);
    }

    // Three consecutive transport failures trip the target's breaker.
    for n in 0..3 {
        let state = send_and_wait(&core, &format!("fail-{n}")).await;
        assert_eq!(state, DeliveryState::Failed);
    }
    let agent = AgentId::try_new("target-t".to_string()).unwrap();
    assert!(!core.balancer.is_agent_admitted(&agent), "breaker open");

    // While open, selection skips the target entirely.
    let state = send_and_wait(&core, "blocked").await;
    assert_eq!(state, DeliveryState::Failed);

    // Heal the transport; after the timeout one probe is admitted and its
    // success recloses the breaker.
    for transport in core.factory.transports() {
        transport.inject_failure(false);
    }
    core.clock.advance(Duration::from_secs(31));
    assert_eq!(send_and_wait(&core, "probe").await, DeliveryState::Acked);
    assert!(core.balancer.is_agent_admitted(&agent), "breaker closed");
    assert_eq!(send_and_wait(&core, "after").await, DeliveryState::Acked);
}

#[tokio::test]
async fn probe_failure_reopens_the_breaker() {
    let core = TestCore::start(breaker());
    core.register_target("target-t", 0.9, 0.99, 50.0);
    assert_eq!(send_and_wait(&core, "warm").await, DeliveryState::Acked);

    for transport in core.factory.transports() {
        transport.inject_failure(true);
    }
    for n in 0..3 {
        send_and_wait(&core, &format!("fail-{n}")).await;
    }
    let agent = AgentId::try_new("target-t".to_string()).unwrap();
    assert!(!core.balancer.is_agent_admitted(&agent));

    // Probe admitted after the timeout, but the transport still fails.
    core.clock.advance(Duration::from_secs(31));
    assert_eq!(send_and_wait(&core, "probe").await, DeliveryState::Failed);
    assert!(!core.balancer.is_agent_admitted(&agent), "reopened");
}
