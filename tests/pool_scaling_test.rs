//! Pool scaling scenario: grow under load, shrink to minimum when idle

use std::sync::Arc;
use std::time::Duration;

use agora::bus::domain_types::MessagePriority;
use agora::domain_types::{EndpointAddress, ProtocolId};
use agora::pool::config::{PoolConfig, ScalingPolicy};
use agora::pool::connection::{ConnectionFactory, ConnectionMetadata, LoopbackFactory};
use agora::pool::domain_types::{AcquireRequest, ConnectionRequirements, Lease};
use agora::pool::pool::ConnectionPool;
use agora::time_provider::{MockTimeProvider, TimeProvider};

fn request() -> AcquireRequest {
    AcquireRequest {
        protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
        endpoint: EndpointAddress::try_new("scale-target:9000".to_string()).unwrap(),
        requirements: ConnectionRequirements::default(),
        priority: MessagePriority::Normal,
        timeout: Duration::from_secs(1),
        requester: "scaling-test".to_string(),
    }
}

fn pool_with_spec_numbers() -> (Arc<ConnectionPool>, Arc<MockTimeProvider>) {
    let clock = Arc::new(MockTimeProvider::new());
    let pool = ConnectionPool::new(
        ProtocolId::try_new("stream".to_string()).unwrap(),
        EndpointAddress::try_new("scale-target:9000".to_string()).unwrap(),
        PoolConfig {
            min_size: 2,
            max_size: 10,
            scaling: ScalingPolicy {
                high_threshold: 0.8,
                low_threshold: 0.3,
                trigger_duration: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
                scale_up_increment: 2,
                scale_down_increment: 2,
                max_scale_up_rate: 5,
                ..ScalingPolicy::default()
            },
            ..PoolConfig::default()
        },
        Arc::new(LoopbackFactory::with_metadata(ConnectionMetadata::default()))
            as Arc<dyn ConnectionFactory>,
        Arc::clone(&clock) as Arc<dyn TimeProvider>,
    );
    (pool, clock)
}

#[tokio::test]
async fn sustained_high_utilization_grows_to_max_then_idle_shrinks_to_min() {
    let (pool, clock) = pool_with_spec_numbers();
    pool.initialize().await.unwrap();
    assert_eq!(pool.metrics().total_connections, 2);

    // Drive utilization to ~0.9 and hold it across scaling cycles.
    let mut leases: Vec<Lease> = Vec::new();
    for _ in 0..2 {
        leases.push(pool.acquire(&request()).await.unwrap());
    }
    let mut cycles = 0;
    loop {
        pool.evaluate_scaling().await;
        clock.advance(Duration::from_secs(61));
        pool.evaluate_scaling().await;

        // Keep the new capacity saturated too.
        while pool.metrics().idle > 0 {
            leases.push(pool.acquire(&request()).await.unwrap());
        }
        cycles += 1;
        if pool.metrics().total_connections >= 10 || cycles > 10 {
            break;
        }
        clock.advance(Duration::from_secs(61));
    }
    // Growth by increments per cycle, capped at max_size = 10.
    assert_eq!(pool.metrics().total_connections, 10);

    // Release everything and idle for a long stretch: shrink to min, never
    // below.
    for lease in leases {
        pool.release(lease.lease_id, None);
    }
    for _ in 0..10 {
        pool.evaluate_scaling().await;
        clock.advance(Duration::from_secs(61));
    }
    pool.evaluate_scaling().await;
    let total = pool.metrics().total_connections;
    assert_eq!(total, 2, "shrinks to min and never below, got {total}");
}
