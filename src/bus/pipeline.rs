//! Production delivery pipeline
//!
//! Chains the router, protocol selector, load balancer, and pool manager
//! behind the bus's [`MessageDispatcher`] seam:
//!
//! router scores candidates -> selector picks a transport profile ->
//! balancer picks one target -> pool leases a connection -> the frame is
//! written and the outcome fans back into every adaptive table.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use super::bus::{DispatchFailure, DispatchOutcome, MessageDispatcher};
use super::domain_types::Message;
use crate::balancer::balancer::LoadBalancer;
use crate::balancer::domain_types::SelectRequest;
use crate::domain_types::AgentId;
use crate::efficiency::EfficiencyMonitor;
use crate::error::CommError;
use crate::pool::domain_types::{AcquireRequest, ConnectionRequirements, LeaseUsage};
use crate::pool::manager::PoolManager;
use crate::protocol::conditions::NetworkMonitor;
use crate::protocol::selector::ProtocolSelector;
use crate::router::router::{MessageRouter, RouteAdmission};
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::storage::Store;
use crate::time_provider::TimeProvider;

/// Router admission backed by the balancer's per-target breakers
pub struct BalancerAdmission(pub Arc<LoadBalancer>);

impl RouteAdmission for BalancerAdmission {
    fn is_admitted(&self, destination: &AgentId) -> bool {
        self.0.is_agent_admitted(destination)
    }
}

/// The production dispatcher wiring all four subsystems
pub struct DeliveryPipeline {
    router: Arc<MessageRouter>,
    selector: Arc<ProtocolSelector>,
    network: Arc<NetworkMonitor>,
    balancer: Arc<LoadBalancer>,
    pools: Arc<PoolManager>,
    efficiency: Arc<EfficiencyMonitor>,
    time: Arc<dyn TimeProvider>,
    /// How long a lease acquisition may wait
    acquire_timeout: Duration,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline").finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Wires the pipeline
    #[must_use]
    pub fn new(
        router: Arc<MessageRouter>,
        selector: Arc<ProtocolSelector>,
        network: Arc<NetworkMonitor>,
        balancer: Arc<LoadBalancer>,
        pools: Arc<PoolManager>,
        efficiency: Arc<EfficiencyMonitor>,
        time: Arc<dyn TimeProvider>,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            selector,
            network,
            balancer,
            pools,
            efficiency,
            time,
            acquire_timeout,
        })
    }

    /// Registers snapshot-persistence jobs with the scheduler
    pub async fn register_jobs(self: &Arc<Self>, scheduler: &Arc<Scheduler>, store: Arc<dyn Store>) {
        let pipeline = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "route-snapshot".to_string(),
                interval: Duration::from_secs(60),
                max_jitter: Duration::from_secs(5),
                run: Arc::new(move || {
                    let pipeline = Arc::clone(&pipeline);
                    let store = Arc::clone(&store);
                    Box::pin(async move {
                        let routes = pipeline.router.cache_snapshot();
                        if let Err(err) = store.save_route_snapshot(routes).await {
                            warn!(error = %err, "route snapshot persistence failed");
                        }
                        for ((_, endpoint), _) in pipeline.pools.all_metrics() {
                            if let Err(err) = store
                                .save_pool_config(&endpoint, pipeline.pools.default_config())
                                .await
                            {
                                warn!(error = %err, "pool config persistence failed");
                            }
                        }
                    })
                }),
            })
            .await;
    }

    fn requirements_for(message: &Message) -> ConnectionRequirements {
        let hints = message.hints_or_default();
        ConnectionRequirements {
            encryption: hints.security_required,
            authentication: message
                .governance
                .as_ref()
                .is_some_and(|g| g.accountability_required),
            min_trust: message
                .governance
                .as_ref()
                .and_then(|g| g.trust_score_minimum),
            min_bandwidth_mbps: None,
            max_latency_ms: None,
        }
    }
}

#[async_trait]
impl MessageDispatcher for DeliveryPipeline {
    async fn dispatch(
        &self,
        message: &Message,
        excluded: &[AgentId],
    ) -> Result<DispatchOutcome, DispatchFailure> {
        // Routing: score candidates, pick a primary plus alternatives.
        let decision =
            self.router
                .route(message, excluded)
                .await
                .map_err(|err| DispatchFailure {
                    error: err.into(),
                    failed_destination: None,
                })?;

        // Transport selection under current network conditions.
        let conditions = self.network.current();
        let protocol = self
            .selector
            .pick(message, &conditions)
            .map_err(|error| DispatchFailure {
                error,
                failed_destination: None,
            })?;

        // Balance among the route's endpoint set.
        let mut candidates: Vec<AgentId> = vec![decision.selected.destination.clone()];
        for alternative in &decision.alternatives {
            if !candidates.contains(&alternative.destination) {
                candidates.push(alternative.destination.clone());
            }
        }
        let hints = message.hints_or_default();
        let select_request = SelectRequest {
            priority: message.priority,
            latency_sensitive: hints.latency_sensitive,
            expected_duration_ms: Some(decision.est_delivery_ms.max(1.0)),
            governance: message.governance.clone(),
            performance: None,
            allow_unhealthy: false,
        };
        let selection =
            self.balancer
                .select(&select_request, &candidates)
                .map_err(|error| DispatchFailure {
                    error,
                    failed_destination: None,
                })?;

        // Lease a connection to the selected endpoint.
        let acquire = AcquireRequest {
            protocol: protocol.profile_id.clone(),
            endpoint: selection.endpoint.clone(),
            requirements: Self::requirements_for(message),
            priority: message.priority,
            timeout: self.acquire_timeout,
            requester: message.source.to_string(),
        };
        let lease = match self.pools.acquire(&acquire).await {
            Ok(lease) => lease,
            Err(error) => {
                self.balancer
                    .report_completion(selection.request_id, false, 0.0, Some(&error));
                return Err(DispatchFailure {
                    error,
                    failed_destination: Some(selection.agent),
                });
            }
        };

        // Write the frame and wait for the transport-level ack.
        let started = self.time.instant();
        let pool = self
            .pools
            .existing_pool(&protocol.profile_id, &selection.endpoint);
        let send_result = match pool
            .as_ref()
            .and_then(|pool| pool.leased_connection(&lease))
        {
            Some(connection) => {
                connection
                    .send_frame(&message.payload.bytes, self.time.epoch_millis())
                    .await
            }
            None => Err(CommError::Transport {
                detail: "leased connection vanished before send".to_string(),
                retryable: true,
            }),
        };
        let latency = started.elapsed();
        let latency_ms = latency.as_secs_f64() * 1_000.0;

        // Fan the outcome back into every adaptive table.
        let success = send_result.is_ok();
        let usage = LeaseUsage {
            requests: 1,
            bytes_sent: message.payload.len() as u64,
            bytes_received: 0,
            errors: u32::from(!success),
            mean_latency_ms: Some(latency_ms),
        };
        self.pools.release(&lease, Some(usage));
        if let Some(pool) = &pool {
            pool.record_result(success, latency_ms);
        }
        self.balancer.report_completion(
            selection.request_id,
            success,
            latency_ms,
            send_result.as_ref().err(),
        );
        self.selector.record_outcome(
            &protocol.profile_id,
            &message.message_type,
            success,
            latency_ms,
            message.payload.len(),
        );
        self.router.record_outcome(
            &message.message_type,
            decision.algorithm,
            success,
            latency_ms,
        );
        let header_overhead = self.selector.header_overhead(&protocol.profile_id);
        self.efficiency.record_delivery(
            success,
            latency_ms,
            message.payload.len(),
            message.payload.len() + header_overhead,
        );

        match send_result {
            Ok(()) => {
                trace!(
                    message = %message.id,
                    destination = %selection.agent,
                    protocol = %protocol.profile_id,
                    "dispatch complete"
                );
                Ok(DispatchOutcome {
                    destination: selection.agent,
                    protocol: protocol.profile_id,
                    latency,
                })
            }
            Err(error) => Err(DispatchFailure {
                error,
                failed_destination: Some(selection.agent),
            }),
        }
    }
}
