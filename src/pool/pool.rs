//! A single connection pool for one `(protocol, endpoint)` pair
//!
//! One lock protects the connection map, idle list, lease table, and waiter
//! queue; it is never held across an await. Lease grants to contending
//! waiters follow priority then FIFO. Expired leases are reclaimed by the
//! sweeper, which marks the connection failed and schedules a replacement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use super::circuit_breaker::CircuitBreaker;
use super::config::{PoolConfig, ScalingAlgorithm};
use super::connection::{ConnectionFactory, PooledConnection};
use super::domain_types::{
    AcquireRequest, ConnectionId, ConnectionRequirements, ConnectionStatus, Lease, LeaseId,
    LeaseUsage, PoolId, PoolMetrics, PoolStatus,
};
use crate::bus::domain_types::MessagePriority;
use crate::domain_types::{EndpointAddress, ProtocolId};
use crate::error::CommError;
use crate::time_provider::TimeProvider;

const LATENCY_RING_CAPACITY: usize = 256;
const FAILURE_EMA_ALPHA: f64 = 0.1;

struct Waiter {
    priority: MessagePriority,
    seq: u64,
    requirements: ConnectionRequirements,
    sender: oneshot::Sender<Arc<PooledConnection>>,
}

struct PoolState {
    connections: HashMap<ConnectionId, Arc<PooledConnection>>,
    idle: VecDeque<ConnectionId>,
    leases: HashMap<LeaseId, Lease>,
    waiters: Vec<Waiter>,
    next_waiter_seq: u64,
    status: PoolStatus,
    creating: usize,
    high_since: Option<SystemTime>,
    low_since: Option<SystemTime>,
    last_scale_action: Option<SystemTime>,
}

/// Reusable connections sharing an endpoint and protocol
pub struct ConnectionPool {
    /// Pool identifier
    pub id: PoolId,
    /// Transport protocol
    pub protocol: ProtocolId,
    /// Endpoint served
    pub endpoint: EndpointAddress,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    time: Arc<dyn TimeProvider>,
    breaker: Arc<CircuitBreaker>,
    state: Mutex<PoolState>,

    leases_granted: AtomicU64,
    leases_expired: AtomicU64,
    failure_ema: Mutex<f64>,
    latencies: Mutex<VecDeque<f64>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates a pool in `Initializing` state; call [`initialize`](Self::initialize)
    /// to warm it to `min_size`
    #[must_use]
    pub fn new(
        protocol: ProtocolId,
        endpoint: EndpointAddress,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        if config.scaling.algorithm != ScalingAlgorithm::Reactive {
            warn!(
                algorithm = ?config.scaling.algorithm,
                "scaling algorithm not implemented, falling back to reactive"
            );
        }
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), Arc::clone(&time)));
        Arc::new(Self {
            id: PoolId::generate(),
            protocol,
            endpoint,
            config,
            factory,
            time,
            breaker,
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                idle: VecDeque::new(),
                leases: HashMap::new(),
                waiters: Vec::new(),
                next_waiter_seq: 0,
                status: PoolStatus::Initializing,
                creating: 0,
                high_since: None,
                low_since: None,
                last_scale_action: None,
            }),
            leases_granted: AtomicU64::new(0),
            leases_expired: AtomicU64::new(0),
            failure_ema: Mutex::new(0.0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_RING_CAPACITY)),
        })
    }

    /// Warms the pool to `min_size` and transitions to `Active`
    ///
    /// # Errors
    /// Returns the last creation error when the minimum cannot be reached;
    /// the pool is left `Degraded`.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), CommError> {
        let mut last_error = None;
        for _ in 0..self.config.min_size {
            match self.create_connection().await {
                Ok(()) => {}
                Err(err) => last_error = Some(err),
            }
        }
        let mut state = self.lock();
        if state.connections.len() >= self.config.min_size {
            state.status = PoolStatus::Active;
            info!(pool = %self.id, endpoint = %self.endpoint, size = state.connections.len(), "pool active");
            Ok(())
        } else {
            state.status = PoolStatus::Degraded;
            warn!(pool = %self.id, endpoint = %self.endpoint, "pool degraded during initialization");
            Err(last_error.unwrap_or(CommError::Transport {
                detail: "pool initialization fell short of min_size".to_string(),
                retryable: true,
            }))
        }
    }

    /// Current pool status
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.lock().status
    }

    /// The pool's circuit breaker
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Leases a connection satisfying the request's requirements
    ///
    /// Prefers an idle connection; creates one when under `max_size`;
    /// otherwise waits up to `timeout` ordered by priority then FIFO.
    ///
    /// # Errors
    /// `Unhealthy` when the pool is failed or in maintenance,
    /// `AcquireTimeout` when no connection frees up in time, `Transport`
    /// when creation persistently fails.
    pub async fn acquire(self: &Arc<Self>, request: &AcquireRequest) -> Result<Lease, CommError> {
        let validation_budget =
            self.config.max_size * self.config.connection_failure_threshold as usize;
        let mut validation_failures = 0usize;
        loop {
            let action = self.try_acquire_action(request)?;
            match action {
                AcquireAction::Granted(connection) => {
                    if self.config.validate_on_acquire {
                        if let Err(err) = self.validate(&connection).await {
                            trace!(pool = %self.id, connection = %connection.id, error = %err, "validation failed");
                            validation_failures += 1;
                            if validation_failures > validation_budget {
                                return Err(CommError::Transport {
                                    detail: "validation failing across the pool".to_string(),
                                    retryable: true,
                                });
                            }
                            continue;
                        }
                    }
                    return Ok(self.grant(&connection, &request.requester));
                }
                AcquireAction::Create => match self.create_connection_retrying().await {
                    Ok(()) => continue,
                    Err(err) => return Err(err),
                },
                AcquireAction::Wait(receiver) => {
                    if request.timeout.is_zero() {
                        // try_acquire_action never returns Wait for a zero
                        // timeout, but keep the invariant visible.
                        return Err(self.timeout_error(request));
                    }
                    tokio::select! {
                        granted = receiver => match granted {
                            Ok(connection) => {
                                return Ok(self.grant(&connection, &request.requester));
                            }
                            Err(_) => continue,
                        },
                        () = tokio::time::sleep(request.timeout) => {
                            self.abandon_wait(request);
                            return Err(self.timeout_error(request));
                        }
                    }
                }
            }
        }
    }

    /// Releases a lease, returning the connection to `idle`
    ///
    /// Idempotent: releasing an unknown or already-released lease is a no-op.
    pub fn release(&self, lease_id: LeaseId, usage: Option<LeaseUsage>) {
        let (connection, waiter) = {
            let mut state = self.lock();
            let Some(lease) = state.leases.remove(&lease_id) else {
                return;
            };
            let Some(connection) = state.connections.get(&lease.connection_id).cloned() else {
                return;
            };

            if let Some(usage) = usage {
                self.record_usage(&connection, usage);
            }

            if connection.status() != ConnectionStatus::Busy {
                // Reclaimed by the sweeper while leased; nothing to return.
                return;
            }

            // Hand the connection straight to the best matching waiter.
            let waiter = take_matching_waiter(&mut state.waiters, &connection);
            if waiter.is_none() {
                connection.set_status(ConnectionStatus::Idle);
                let id = connection.id;
                state.idle.push_back(id);
            }
            (connection, waiter)
        };

        if let Some(waiter) = waiter {
            if let Err(returned) = waiter.sender.send(Arc::clone(&connection)) {
                // Waiter gave up; back to idle.
                returned.set_status(ConnectionStatus::Idle);
                let mut state = self.lock();
                let id = returned.id;
                state.idle.push_back(id);
            }
        }
    }

    /// Reclaims expired leases; their connections are marked failed and
    /// replacements are scheduled
    pub async fn sweep_expired_leases(self: &Arc<Self>) {
        let now = self.time.now();
        let reclaimed: Vec<Arc<PooledConnection>> = {
            let mut state = self.lock();
            let expired: Vec<LeaseId> = state
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires_at < now)
                .map(|(id, _)| *id)
                .collect();
            let mut reclaimed = Vec::new();
            for lease_id in expired {
                if let Some(lease) = state.leases.remove(&lease_id) {
                    self.leases_expired.fetch_add(1, Ordering::Relaxed);
                    if let Some(connection) = state.connections.remove(&lease.connection_id) {
                        let connection_id = connection.id;
                        state.idle.retain(|id| *id != connection_id);
                        connection.set_status(ConnectionStatus::Failed);
                        warn!(pool = %self.id, lease = %lease_id, connection = %connection_id, "expired lease reclaimed");
                        reclaimed.push(connection);
                    }
                }
            }
            reclaimed
        };
        for connection in &reclaimed {
            connection.close().await;
        }
        if !reclaimed.is_empty() {
            self.ensure_min().await;
        }
    }

    /// One reactive scaling evaluation
    pub async fn evaluate_scaling(self: &Arc<Self>) {
        let now = self.time.now();
        let policy = &self.config.scaling;
        enum Action {
            Up(usize),
            Down(usize),
        }

        let action = {
            let mut state = self.lock();
            let total = state.connections.len();
            if total == 0 {
                return;
            }
            let busy = total - state.idle.len();
            let utilization = busy as f64 / total as f64;

            if utilization > policy.high_threshold {
                state.low_since = None;
                let since = *state.high_since.get_or_insert(now);
                let held = now.duration_since(since).unwrap_or(Duration::ZERO);
                if held >= policy.trigger_duration && self.cooldown_passed(&state, now) {
                    let headroom = self.config.max_size.saturating_sub(total);
                    let add = policy
                        .scale_up_increment
                        .min(policy.max_scale_up_rate)
                        .min(headroom);
                    if add > 0 {
                        state.last_scale_action = Some(now);
                        state.high_since = None;
                        state.status = PoolStatus::Scaling;
                        Some(Action::Up(add))
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else if utilization < policy.low_threshold {
                state.high_since = None;
                let since = *state.low_since.get_or_insert(now);
                let held = now.duration_since(since).unwrap_or(Duration::ZERO);
                if held >= policy.trigger_duration && self.cooldown_passed(&state, now) {
                    let removable = total.saturating_sub(self.config.min_size);
                    let remove = policy.scale_down_increment.min(removable).min(state.idle.len());
                    if remove > 0 {
                        state.last_scale_action = Some(now);
                        state.low_since = None;
                        state.status = PoolStatus::Scaling;
                        Some(Action::Down(remove))
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                state.high_since = None;
                state.low_since = None;
                None
            }
        };

        match action {
            Some(Action::Up(add)) => {
                debug!(pool = %self.id, add, "scaling up");
                for _ in 0..add {
                    if self.create_connection().await.is_err() {
                        break;
                    }
                }
                self.finish_scaling();
            }
            Some(Action::Down(remove)) => {
                debug!(pool = %self.id, remove, "scaling down");
                let victims: Vec<Arc<PooledConnection>> = {
                    let mut state = self.lock();
                    let mut victims = Vec::new();
                    for _ in 0..remove {
                        let Some(id) = state.idle.pop_front() else { break };
                        if let Some(connection) = state.connections.remove(&id) {
                            victims.push(connection);
                        }
                    }
                    victims
                };
                for victim in victims {
                    victim.close().await;
                }
                self.finish_scaling();
            }
            None => {}
        }
    }

    /// Records a delivery outcome against the pool and its breaker
    pub fn record_result(&self, success: bool, latency_ms: f64) {
        {
            let mut ema = self
                .failure_ema
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let sample = if success { 0.0 } else { 1.0 };
            *ema = FAILURE_EMA_ALPHA * sample + (1.0 - FAILURE_EMA_ALPHA) * *ema;
        }
        if success {
            let mut ring = self
                .latencies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if ring.len() >= LATENCY_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(latency_ms);
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }

    /// Whether the pool is healthy per its thresholds
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let metrics = self.metrics();
        metrics.failure_rate < self.config.healthy_failure_rate
            && metrics.p95_latency_ms < self.config.healthy_p95_latency_ms
            && metrics.utilization >= self.config.scaling.low_threshold
            && metrics.utilization <= self.config.scaling.high_threshold
    }

    /// Point-in-time metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.lock();
        let total = state.connections.len();
        let idle = state.idle.len();
        let busy = total - idle;
        let p95 = {
            let ring = self
                .latencies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            percentile(ring.iter().copied(), 0.95)
        };
        PoolMetrics {
            total_connections: total,
            idle,
            busy,
            waiting: state.waiters.len(),
            utilization: if total == 0 { 0.0 } else { busy as f64 / total as f64 },
            failure_rate: *self
                .failure_ema
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            p95_latency_ms: p95,
            leases_granted: self.leases_granted.load(Ordering::Relaxed),
            leases_expired: self.leases_expired.load(Ordering::Relaxed),
        }
    }

    /// Looks up a live connection by lease
    #[must_use]
    pub fn leased_connection(&self, lease: &Lease) -> Option<Arc<PooledConnection>> {
        let state = self.lock();
        if !state.leases.contains_key(&lease.lease_id) {
            return None;
        }
        state.connections.get(&lease.connection_id).cloned()
    }

    /// Closes every connection and rejects future acquires
    pub async fn close(self: &Arc<Self>) {
        let connections: Vec<Arc<PooledConnection>> = {
            let mut state = self.lock();
            state.status = PoolStatus::Failed;
            state.idle.clear();
            state.leases.clear();
            state.waiters.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close().await;
        }
    }

    // ------------------------------------------------------------------
    // internals

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn timeout_error(&self, request: &AcquireRequest) -> CommError {
        CommError::AcquireTimeout {
            endpoint: self.endpoint.clone(),
            timeout_ms: u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn try_acquire_action(
        self: &Arc<Self>,
        request: &AcquireRequest,
    ) -> Result<AcquireAction, CommError> {
        let mut state = self.lock();
        match state.status {
            PoolStatus::Failed => {
                return Err(CommError::Unhealthy {
                    subject: self.endpoint.to_string(),
                    reason: "pool failed".to_string(),
                })
            }
            PoolStatus::Maintenance => {
                return Err(CommError::Unhealthy {
                    subject: self.endpoint.to_string(),
                    reason: "pool in maintenance".to_string(),
                })
            }
            _ => {}
        }

        // Idle connection satisfying the requirements, FIFO over idle order.
        let mut searched = state.idle.len();
        while searched > 0 {
            searched -= 1;
            let Some(id) = state.idle.pop_front() else { break };
            let Some(connection) = state.connections.get(&id).cloned() else {
                continue;
            };
            if !connection.satisfies(&request.requirements) {
                state.idle.push_back(id);
                continue;
            }
            if connection.transition(ConnectionStatus::Idle, ConnectionStatus::Busy) {
                return Ok(AcquireAction::Granted(connection));
            }
        }

        if state.connections.len() + state.creating < self.config.max_size {
            state.creating += 1;
            return Ok(AcquireAction::Create);
        }

        if request.timeout.is_zero() {
            return Err(self.timeout_error(request));
        }

        let (sender, receiver) = oneshot::channel();
        let seq = state.next_waiter_seq;
        state.next_waiter_seq += 1;
        state.waiters.push(Waiter {
            priority: request.priority,
            seq,
            requirements: request.requirements.clone(),
            sender,
        });
        // Priority then FIFO.
        state.waiters.sort_by_key(|w| (w.priority, w.seq));
        Ok(AcquireAction::Wait(receiver))
    }

    fn abandon_wait(&self, _request: &AcquireRequest) {
        // The timed-out receiver was dropped, so its sender reads closed.
        let mut state = self.lock();
        state.waiters.retain(|waiter| !waiter.sender.is_closed());
    }

    fn grant(&self, connection: &Arc<PooledConnection>, requester: &str) -> Lease {
        let now = self.time.now();
        let lease = Lease {
            lease_id: LeaseId::generate(),
            connection_id: connection.id,
            pool_id: self.id,
            requester: requester.to_string(),
            issued_at: now,
            expires_at: now + self.config.lease_ttl,
        };
        self.leases_granted.fetch_add(1, Ordering::Relaxed);
        self.lock().leases.insert(lease.lease_id, lease.clone());
        trace!(pool = %self.id, lease = %lease.lease_id, connection = %connection.id, "lease granted");
        lease
    }

    async fn validate(&self, connection: &Arc<PooledConnection>) -> Result<(), CommError> {
        connection.set_status(ConnectionStatus::Validating);
        match connection.probe().await {
            Ok(()) => {
                connection.set_status(ConnectionStatus::Busy);
                Ok(())
            }
            Err(err) => {
                if connection.consecutive_probe_failures() >= self.config.connection_failure_threshold
                {
                    connection.set_status(ConnectionStatus::Failed);
                    let mut state = self.lock();
                    let id = connection.id;
                    state.connections.remove(&id);
                    state.idle.retain(|idle_id| *idle_id != id);
                } else {
                    connection.set_status(ConnectionStatus::Idle);
                    self.lock().idle.push_back(connection.id);
                }
                Err(err)
            }
        }
    }

    async fn create_connection_retrying(self: &Arc<Self>) -> Result<(), CommError> {
        let mut last_error = None;
        for attempt in 0..self.config.connection_retry_attempts.max(1) {
            if attempt > 0 {
                self.time.sleep(self.config.connection_retry_delay).await;
            }
            match self.create_connection_inner().await {
                Ok(()) => {
                    let mut state = self.lock();
                    state.creating = state.creating.saturating_sub(1);
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }
        {
            let mut state = self.lock();
            state.creating = state.creating.saturating_sub(1);
            if state.status == PoolStatus::Active {
                state.status = PoolStatus::Degraded;
            }
        }
        warn!(pool = %self.id, endpoint = %self.endpoint, "connection creation persistently failing");
        Err(last_error.unwrap_or(CommError::Transport {
            detail: "connection creation failed".to_string(),
            retryable: true,
        }))
    }

    async fn create_connection(self: &Arc<Self>) -> Result<(), CommError> {
        self.create_connection_inner().await
    }

    async fn create_connection_inner(self: &Arc<Self>) -> Result<(), CommError> {
        let new_connection = self
            .factory
            .connect(&self.protocol, &self.endpoint)
            .await?;
        let connection = Arc::new(PooledConnection::new(
            self.id,
            self.time.now(),
            new_connection,
        ));
        let mut state = self.lock();
        if state.connections.len() >= self.config.max_size {
            return Ok(()); // raced a concurrent creator; drop the extra
        }
        let id = connection.id;
        state.connections.insert(id, connection);
        state.idle.push_back(id);
        Ok(())
    }

    async fn ensure_min(self: &Arc<Self>) {
        loop {
            {
                let state = self.lock();
                if state.connections.len() >= self.config.min_size {
                    break;
                }
            }
            if self.create_connection().await.is_err() {
                break;
            }
        }
    }

    fn cooldown_passed(&self, state: &PoolState, now: SystemTime) -> bool {
        state.last_scale_action.map_or(true, |last| {
            now.duration_since(last).unwrap_or(Duration::ZERO) >= self.config.scaling.cooldown
        })
    }

    fn finish_scaling(&self) {
        let mut state = self.lock();
        if state.status == PoolStatus::Scaling {
            state.status = PoolStatus::Active;
        }
    }

    fn record_usage(&self, connection: &Arc<PooledConnection>, usage: LeaseUsage) {
        if let Some(latency) = usage.mean_latency_ms {
            connection.record_latency_ms(latency);
        }
        if usage.errors > 0 {
            let mut ema = self
                .failure_ema
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *ema = FAILURE_EMA_ALPHA + (1.0 - FAILURE_EMA_ALPHA) * *ema;
        }
    }
}

enum AcquireAction {
    Granted(Arc<PooledConnection>),
    Create,
    Wait(oneshot::Receiver<Arc<PooledConnection>>),
}

/// Removes and returns the best waiter the connection can satisfy
fn take_matching_waiter(
    waiters: &mut Vec<Waiter>,
    connection: &Arc<PooledConnection>,
) -> Option<Waiter> {
    let index = waiters
        .iter()
        .position(|waiter| connection.satisfies(&waiter.requirements))?;
    Some(waiters.remove(index))
}

fn percentile(samples: impl Iterator<Item = f64>, p: f64) -> f64 {
    let mut sorted: Vec<f64> = samples.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connection::{ConnectionMetadata, LoopbackFactory};
    use crate::time_provider::MockTimeProvider;

    fn request(timeout: Duration) -> AcquireRequest {
        AcquireRequest {
            protocol: ProtocolId::try_new("stream".to_string()).unwrap(),
            endpoint: EndpointAddress::try_new("target:9000".to_string()).unwrap(),
            requirements: ConnectionRequirements::default(),
            priority: MessagePriority::Normal,
            timeout,
            requester: "test".to_string(),
        }
    }

    fn make_pool(config: PoolConfig) -> (Arc<ConnectionPool>, Arc<LoopbackFactory>, Arc<MockTimeProvider>) {
        let factory = Arc::new(LoopbackFactory::with_metadata(ConnectionMetadata {
            encrypted: true,
            authenticated: true,
            ..ConnectionMetadata::default()
        }));
        let clock = Arc::new(MockTimeProvider::new());
        let pool = ConnectionPool::new(
            ProtocolId::try_new("stream".to_string()).unwrap(),
            EndpointAddress::try_new("target:9000".to_string()).unwrap(),
            config,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            Arc::clone(&clock) as Arc<dyn TimeProvider>,
        );
        (pool, factory, clock)
    }

    #[tokio::test]
    async fn initialize_warms_to_min() {
        let (pool, _, _) = make_pool(PoolConfig::default());
        pool.initialize().await.unwrap();
        assert_eq!(pool.status(), PoolStatus::Active);
        assert_eq!(pool.metrics().total_connections, 2);
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let (pool, _, _) = make_pool(PoolConfig::default());
        pool.initialize().await.unwrap();

        let lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.busy, 1);

        pool.release(lease.lease_id, None);
        let metrics = pool.metrics();
        assert_eq!(metrics.busy, 0);
        assert_eq!(metrics.idle, 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (pool, _, _) = make_pool(PoolConfig::default());
        pool.initialize().await.unwrap();
        let lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        pool.release(lease.lease_id, None);
        let before = pool.metrics();
        pool.release(lease.lease_id, None);
        let after = pool.metrics();
        assert_eq!(before.idle, after.idle);
        assert_eq!(before.busy, after.busy);
    }

    #[tokio::test]
    async fn busy_connection_has_exactly_one_lease() {
        let (pool, _, _) = make_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        let lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        // Second acquire must wait and time out rather than double-lease.
        let err = pool
            .acquire(&request(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "acquire_timeout");
        pool.release(lease.lease_id, None);
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately_when_saturated() {
        let (pool, _, _) = make_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        let _lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        let err = pool.acquire(&request(Duration::ZERO)).await.unwrap_err();
        assert_eq!(err.kind(), "acquire_timeout");
    }

    #[tokio::test]
    async fn waiter_receives_released_connection() {
        let (pool, _, _) = make_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        let lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire(&request(Duration::from_secs(2))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(lease.lease_id, None);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.connection_id, lease.connection_id);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let (pool, _, clock) = make_pool(PoolConfig {
            min_size: 1,
            max_size: 2,
            lease_ttl: Duration::from_secs(5),
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        let _lease = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();

        clock.advance(Duration::from_secs(10));
        pool.sweep_expired_leases().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.leases_expired, 1);
        // Replacement restores min_size.
        assert!(metrics.total_connections >= 1);
        assert_eq!(metrics.busy, 0);
    }

    #[tokio::test]
    async fn pool_grows_under_sustained_load() {
        let (pool, _, clock) = make_pool(PoolConfig {
            min_size: 2,
            max_size: 10,
            scaling: crate::pool::config::ScalingPolicy {
                trigger_duration: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
                scale_up_increment: 2,
                ..crate::pool::config::ScalingPolicy::default()
            },
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        // Saturate both connections.
        let _l1 = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        let _l2 = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();

        pool.evaluate_scaling().await; // starts the high-utilization window
        clock.advance(Duration::from_secs(61));
        pool.evaluate_scaling().await; // acts after trigger_duration

        assert_eq!(pool.metrics().total_connections, 4);
    }

    #[tokio::test]
    async fn pool_shrinks_to_min_when_idle() {
        let (pool, _, clock) = make_pool(PoolConfig {
            min_size: 2,
            max_size: 10,
            scaling: crate::pool::config::ScalingPolicy {
                trigger_duration: Duration::from_secs(60),
                cooldown: Duration::ZERO,
                scale_down_increment: 4,
                ..crate::pool::config::ScalingPolicy::default()
            },
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        // Grow manually to 6.
        for _ in 0..4 {
            pool.create_connection().await.unwrap();
        }
        assert_eq!(pool.metrics().total_connections, 6);

        pool.evaluate_scaling().await;
        clock.advance(Duration::from_secs(301));
        pool.evaluate_scaling().await;
        let total = pool.metrics().total_connections;
        assert!(total >= 2, "never below min, got {total}");
        assert!(total < 6, "should have shrunk, got {total}");
    }

    #[tokio::test]
    async fn creation_failures_degrade_the_pool() {
        let (pool, factory, _) = make_pool(PoolConfig {
            min_size: 1,
            max_size: 2,
            connection_retry_attempts: 2,
            connection_retry_delay: Duration::from_millis(1),
            ..PoolConfig::default()
        });
        pool.initialize().await.unwrap();
        factory.inject_connect_failure(true);
        let _first = pool.acquire(&request(Duration::from_secs(1))).await.unwrap();
        // Needs a new connection now; creation fails persistently.
        let err = pool
            .acquire(&request(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(pool.status(), PoolStatus::Degraded);
    }
}
