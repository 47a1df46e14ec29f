//! Pooled connections and the transport seam
//!
//! The pool is transport-agnostic: a [`ConnectionFactory`] produces
//! [`Transport`] objects for a `(protocol, endpoint)` pair, and the pool
//! manages their lifecycle. Internal counters are atomics so leasing does not
//! take the pool lock per request.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use super::domain_types::{ConnectionId, ConnectionStatus, PoolId};
use crate::domain_types::{EndpointAddress, ProtocolId, TrustScore};
use crate::error::CommError;

/// A live transport connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one frame and waits for the transport-level ack
    async fn send_frame(&self, frame: &[u8]) -> Result<(), CommError>;

    /// Protocol-specific liveness probe
    async fn probe(&self) -> Result<(), CommError>;

    /// Closes the connection; idempotent
    async fn close(&self);
}

/// Static facts about an established connection, used for requirement matching
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    /// Frames travel encrypted
    pub encrypted: bool,
    /// Peer identity was verified
    pub authenticated: bool,
    /// Endpoint trust score, when known
    pub trust: Option<TrustScore>,
    /// Negotiated bandwidth estimate
    pub bandwidth_mbps: Option<f64>,
    /// Baseline latency measured at setup
    pub latency_ms: Option<f64>,
}

/// A freshly established connection
pub struct NewConnection {
    /// The live transport
    pub transport: Box<dyn Transport>,
    /// Facts for requirement matching
    pub metadata: ConnectionMetadata,
}

/// Establishes transport connections for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Connects to an endpoint over the given protocol
    async fn connect(
        &self,
        protocol: &ProtocolId,
        endpoint: &EndpointAddress,
    ) -> Result<NewConnection, CommError>;
}

const STATUS_CREATING: u8 = 0;
const STATUS_IDLE: u8 = 1;
const STATUS_BUSY: u8 = 2;
const STATUS_VALIDATING: u8 = 3;
const STATUS_FAILED: u8 = 4;
const STATUS_CLOSING: u8 = 5;
const STATUS_CLOSED: u8 = 6;

fn status_to_u8(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Creating => STATUS_CREATING,
        ConnectionStatus::Idle => STATUS_IDLE,
        ConnectionStatus::Busy => STATUS_BUSY,
        ConnectionStatus::Validating => STATUS_VALIDATING,
        ConnectionStatus::Failed => STATUS_FAILED,
        ConnectionStatus::Closing => STATUS_CLOSING,
        ConnectionStatus::Closed => STATUS_CLOSED,
    }
}

fn status_from_u8(raw: u8) -> ConnectionStatus {
    match raw {
        STATUS_IDLE => ConnectionStatus::Idle,
        STATUS_BUSY => ConnectionStatus::Busy,
        STATUS_VALIDATING => ConnectionStatus::Validating,
        STATUS_FAILED => ConnectionStatus::Failed,
        STATUS_CLOSING => ConnectionStatus::Closing,
        STATUS_CLOSED => ConnectionStatus::Closed,
        _ => ConnectionStatus::Creating,
    }
}

/// A connection owned by a pool
pub struct PooledConnection {
    /// Connection identifier
    pub id: ConnectionId,
    /// Owning pool
    pub pool_id: PoolId,
    /// When the connection was established
    pub created_at: SystemTime,
    /// Facts for requirement matching
    pub metadata: ConnectionMetadata,
    transport: Box<dyn Transport>,

    status: AtomicU8,
    usage_count: AtomicU64,
    error_count: AtomicU32,
    consecutive_probe_failures: AtomicU32,
    last_used_millis: AtomicU64,
    latency_ema_micros: AtomicU64,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("usage_count", &self.usage_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Wraps a freshly established transport
    #[must_use]
    pub fn new(pool_id: PoolId, created_at: SystemTime, connection: NewConnection) -> Self {
        Self {
            id: ConnectionId::generate(),
            pool_id,
            created_at,
            metadata: connection.metadata,
            transport: connection.transport,
            status: AtomicU8::new(STATUS_IDLE),
            usage_count: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            consecutive_probe_failures: AtomicU32::new(0),
            last_used_millis: AtomicU64::new(0),
            latency_ema_micros: AtomicU64::new(0),
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        status_from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Sets the status unconditionally
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status_to_u8(status), Ordering::SeqCst);
    }

    /// Atomically transitions between two states
    pub fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.status
            .compare_exchange(
                status_to_u8(from),
                status_to_u8(to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Writes a frame through the transport, recording usage and errors
    ///
    /// # Errors
    /// Propagates the transport error after counting it.
    pub async fn send_frame(&self, frame: &[u8], now_millis: u64) -> Result<(), CommError> {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_millis.store(now_millis, Ordering::Relaxed);
        match self.transport.send_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Runs the transport probe, tracking consecutive failures
    ///
    /// # Errors
    /// Propagates the probe error after counting it.
    pub async fn probe(&self) -> Result<(), CommError> {
        match self.transport.probe().await {
            Ok(()) => {
                self.consecutive_probe_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.consecutive_probe_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Closes the underlying transport
    pub async fn close(&self) {
        self.set_status(ConnectionStatus::Closing);
        self.transport.close().await;
        self.set_status(ConnectionStatus::Closed);
    }

    /// Folds an observed operation latency into the EMA (alpha 0.2)
    pub fn record_latency_ms(&self, latency_ms: f64) {
        let sample_micros = (latency_ms * 1_000.0).max(0.0) as u64;
        let previous = self.latency_ema_micros.load(Ordering::Relaxed);
        let updated = if previous == 0 {
            sample_micros
        } else {
            (sample_micros / 5).saturating_add(previous - previous / 5)
        };
        self.latency_ema_micros.store(updated, Ordering::Relaxed);
    }

    /// EMA latency in milliseconds
    #[must_use]
    pub fn latency_ema_ms(&self) -> f64 {
        self.latency_ema_micros.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    /// Total operations performed
    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    /// Total errors observed
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Consecutive probe failures
    #[must_use]
    pub fn consecutive_probe_failures(&self) -> u32 {
        self.consecutive_probe_failures.load(Ordering::Relaxed)
    }

    /// Whether the connection satisfies the given requirements
    #[must_use]
    pub fn satisfies(&self, requirements: &super::domain_types::ConnectionRequirements) -> bool {
        if requirements.encryption && !self.metadata.encrypted {
            return false;
        }
        if requirements.authentication && !self.metadata.authenticated {
            return false;
        }
        if let Some(min_trust) = requirements.min_trust {
            let trust = self.metadata.trust.map_or(0.0, |t| t.as_f64());
            if trust < min_trust.as_f64() {
                return false;
            }
        }
        if let Some(min_bandwidth) = requirements.min_bandwidth_mbps {
            if self.metadata.bandwidth_mbps.unwrap_or(0.0) < min_bandwidth {
                return false;
            }
        }
        if let Some(max_latency) = requirements.max_latency_ms {
            if self.metadata.latency_ms.unwrap_or(f64::MAX) > max_latency {
                return false;
            }
        }
        true
    }
}

/// In-memory transport for tests and loopback deployments
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    fail_sends: std::sync::atomic::AtomicBool,
}

impl LoopbackTransport {
    /// Makes future sends and probes fail, for fault-injection tests
    pub fn inject_failure(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_frame(&self, _frame: &[u8]) -> Result<(), CommError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CommError::Transport {
                detail: "loopback failure injected".to_string(),
                retryable: true,
            });
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), CommError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CommError::Transport {
                detail: "loopback probe failure injected".to_string(),
                retryable: true,
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Factory producing [`LoopbackTransport`] connections
#[derive(Debug, Default)]
pub struct LoopbackFactory {
    metadata: ConnectionMetadata,
    fail_connects: std::sync::atomic::AtomicBool,
    transports: std::sync::Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackFactory {
    /// Creates a factory whose connections carry the given metadata
    #[must_use]
    pub fn with_metadata(metadata: ConnectionMetadata) -> Self {
        Self {
            metadata,
            fail_connects: std::sync::atomic::AtomicBool::new(false),
            transports: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Makes future connects fail, for fault-injection tests
    pub fn inject_connect_failure(&self, failing: bool) {
        self.fail_connects.store(failing, Ordering::SeqCst);
    }

    /// Handles to every transport handed out, for fault injection
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.transports.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

struct SharedLoopback(Arc<LoopbackTransport>);

#[async_trait]
impl Transport for SharedLoopback {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), CommError> {
        self.0.send_frame(frame).await
    }

    async fn probe(&self) -> Result<(), CommError> {
        self.0.probe().await
    }

    async fn close(&self) {
        self.0.close().await;
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn connect(
        &self,
        _protocol: &ProtocolId,
        endpoint: &EndpointAddress,
    ) -> Result<NewConnection, CommError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(CommError::Transport {
                detail: format!("loopback connect to {endpoint} failed (injected)"),
                retryable: true,
            });
        }
        let transport = Arc::new(LoopbackTransport::default());
        if let Ok(mut transports) = self.transports.lock() {
            transports.push(Arc::clone(&transport));
        }
        Ok(NewConnection {
            transport: Box::new(SharedLoopback(transport)),
            metadata: self.metadata.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::domain_types::ConnectionRequirements;

    fn connection(metadata: ConnectionMetadata) -> PooledConnection {
        PooledConnection::new(
            PoolId::generate(),
            SystemTime::now(),
            NewConnection {
                transport: Box::new(LoopbackTransport::default()),
                metadata,
            },
        )
    }

    #[test]
    fn requirement_matching() {
        let conn = connection(ConnectionMetadata {
            encrypted: true,
            authenticated: false,
            trust: Some(TrustScore::try_new(0.9).unwrap()),
            bandwidth_mbps: Some(100.0),
            latency_ms: Some(5.0),
        });
        assert!(conn.satisfies(&ConnectionRequirements::default()));
        assert!(conn.satisfies(&ConnectionRequirements {
            encryption: true,
            min_trust: Some(TrustScore::try_new(0.8).unwrap()),
            ..ConnectionRequirements::default()
        }));
        assert!(!conn.satisfies(&ConnectionRequirements {
            authentication: true,
            ..ConnectionRequirements::default()
        }));
        assert!(!conn.satisfies(&ConnectionRequirements {
            max_latency_ms: Some(1.0),
            ..ConnectionRequirements::default()
        }));
    }

    #[test]
    fn status_transitions_are_atomic() {
        let conn = connection(ConnectionMetadata::default());
        assert_eq!(conn.status(), ConnectionStatus::Idle);
        assert!(conn.transition(ConnectionStatus::Idle, ConnectionStatus::Busy));
        assert!(!conn.transition(ConnectionStatus::Idle, ConnectionStatus::Busy));
        assert_eq!(conn.status(), ConnectionStatus::Busy);
    }

    #[tokio::test]
    async fn send_errors_are_counted() {
        let transport = LoopbackTransport::default();
        transport.inject_failure(true);
        let conn = PooledConnection::new(
            PoolId::generate(),
            SystemTime::now(),
            NewConnection {
                transport: Box::new(transport),
                metadata: ConnectionMetadata::default(),
            },
        );
        assert!(conn.send_frame(b"x", 0).await.is_err());
        assert_eq!(conn.error_count(), 1);
        assert_eq!(conn.usage_count(), 1);
    }
}
