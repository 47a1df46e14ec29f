//! Shared fixture assembling a full core against loopback transports

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use agora::balancer::balancer::{BalancerConfig, LoadBalancer};
use agora::balancer::domain_types::{GovernanceProfile, LoadBalanceTarget};
use agora::bus::bus::UnifiedBus;
use agora::bus::config::BusConfig;
use agora::bus::domain_types::{Message, MessagePriority, PayloadEnvelope};
use agora::bus::pipeline::{BalancerAdmission, DeliveryPipeline};
use agora::domain_types::{
    AgentId, EndpointAddress, LoadFactor, MessageId, MessageType, ProtocolId, Reliability,
    RetryDelayMs, RetryPolicy, TrustScore,
};
use agora::efficiency::{EfficiencyConfig, EfficiencyMonitor};
use agora::health::monitor::NullPublisher;
use agora::pool::config::{CircuitBreakerConfig, PoolConfig};
use agora::pool::connection::{ConnectionFactory, ConnectionMetadata, LoopbackFactory};
use agora::pool::manager::PoolManager;
use agora::protocol::conditions::NetworkMonitor;
use agora::protocol::profiles::ProfileRegistry;
use agora::protocol::selector::{ProtocolSelector, SelectorConfig};
use agora::router::domain_types::{Route, RouteId};
use agora::router::router::{
    DestinationResolver, MessageRouter, RouteDiscoverer, RouterConfig, StaticTopology,
};
use agora::time_provider::{MockTimeProvider, TimeProvider};

/// A fully wired core over loopback transports
pub struct TestCore {
    pub bus: Arc<UnifiedBus>,
    pub balancer: Arc<LoadBalancer>,
    pub pools: Arc<PoolManager>,
    pub topology: Arc<StaticTopology>,
    pub factory: Arc<LoopbackFactory>,
    pub clock: Arc<MockTimeProvider>,
}

impl TestCore {
    pub fn start(breaker: CircuitBreakerConfig) -> Self {
        let clock = Arc::new(MockTimeProvider::new());
        let time: Arc<dyn TimeProvider> = Arc::clone(&clock) as Arc<dyn TimeProvider>;

        let topology = Arc::new(StaticTopology::new());
        let balancer = Arc::new(LoadBalancer::new(
            BalancerConfig {
                breaker: breaker.clone(),
                ..BalancerConfig::default()
            },
            Arc::clone(&time),
        ));
        let router = Arc::new(MessageRouter::new(
            RouterConfig::default(),
            Arc::clone(&topology) as Arc<dyn DestinationResolver>,
            Arc::clone(&topology) as Arc<dyn RouteDiscoverer>,
            Arc::new(BalancerAdmission(Arc::clone(&balancer))),
            Arc::clone(&time),
        ));
        let network = Arc::new(NetworkMonitor::new(32, Arc::clone(&time)));
        let selector = Arc::new(ProtocolSelector::new(
            SelectorConfig::default(),
            Arc::new(ProfileRegistry::with_builtins()),
            Arc::clone(&time),
        ));
        let factory = Arc::new(LoopbackFactory::with_metadata(ConnectionMetadata {
            encrypted: true,
            authenticated: true,
            trust: Some(TrustScore::try_new(0.9).unwrap()),
            bandwidth_mbps: Some(1_000.0),
            latency_ms: Some(1.0),
        }));
        let pools = PoolManager::new(
            PoolConfig {
                min_size: 1,
                max_size: 4,
                breaker,
                ..PoolConfig::default()
            },
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            Arc::clone(&time),
        );
        let efficiency = EfficiencyMonitor::new(
            EfficiencyConfig::default(),
            Arc::new(NullPublisher),
            Arc::clone(&time),
        );
        let pipeline = DeliveryPipeline::new(
            router,
            selector,
            network,
            Arc::clone(&balancer),
            Arc::clone(&pools),
            efficiency,
            Arc::clone(&time),
            Duration::from_millis(500),
        );
        let bus = UnifiedBus::new(BusConfig::testing(), Arc::clone(&time), pipeline).unwrap();
        bus.start();

        Self {
            bus,
            balancer,
            pools,
            topology,
            factory,
            clock,
        }
    }

    /// Registers an agent as both a route destination and a balance target
    pub fn register_target(&self, name: &str, trust: f64, reliability: f64, latency_ms: f64) {
        let agent = AgentId::try_new(name.to_string()).unwrap();
        self.topology.register_destination(
            agent.clone(),
            vec![Route {
                route_id: RouteId::try_new(format!("{name}:stream")).unwrap(),
                destination: agent.clone(),
                protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
                est_latency_ms: latency_ms,
                est_bandwidth_mbps: 1_000.0,
                reliability: Reliability::try_new(reliability).unwrap(),
                load_factor: LoadFactor::try_new(0.1).unwrap(),
                trust: Some(TrustScore::try_new(trust).unwrap()),
                cost_score: 0.0,
                hops: vec![],
            }],
        );
        self.balancer.register_target(LoadBalanceTarget {
            agent,
            endpoint: EndpointAddress::try_new(format!("{name}:9000")).unwrap(),
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            capacity: 16,
            weight: 1.0,
            governance: GovernanceProfile {
                trust: TrustScore::try_new(trust).unwrap(),
                audit_capable: true,
                ..GovernanceProfile::default()
            },
        });
    }
}

/// Builds a message bound for a named target
pub fn message(id: &str, message_type: &str, priority: MessagePriority, dest: &str) -> Message {
    Message {
        id: MessageId::try_new(id.to_string()).unwrap(),
        message_type: MessageType::try_new(message_type.to_string()).unwrap(),
        priority,
        source: AgentId::try_new("test-source".to_string()).unwrap(),
        destinations: vec![AgentId::try_new(dest.to_string()).unwrap()],
        payload: PayloadEnvelope::opaque(Bytes::from_static(b"{\"op\":\"noop\"}")),
        hints: None,
        correlation_id: None,
        deadline: SystemTime::now() + Duration::from_secs(60),
        retry_policy: RetryPolicy {
            initial_delay: RetryDelayMs::try_new(10).unwrap(),
            ..RetryPolicy::default()
        },
        governance: None,
    }
}
