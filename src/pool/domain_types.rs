//! Domain types for connection pooling

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::bus::domain_types::MessagePriority;
use crate::domain_types::{EndpointAddress, ProtocolId, TrustScore};

/// Unique identifier for a pool
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct PoolId(Uuid);

impl PoolId {
    /// Creates a new random pool ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a pooled connection
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a lease
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct LeaseId(Uuid);

impl LeaseId {
    /// Creates a new random lease ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Being established
    Creating,
    /// Available for leasing
    Idle,
    /// Exactly one active lease holds it
    Busy,
    /// Undergoing a validation probe
    Validating,
    /// Unusable; scheduled for removal
    Failed,
    /// Draining before close
    Closing,
    /// Closed and removed
    Closed,
}

/// Pool lifecycle states; transitions are monotonic through
/// `Initializing -> Active`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Warming to `min_size`
    Initializing,
    /// Serving normally
    Active,
    /// A scaling action is in progress
    Scaling,
    /// Serving but rejecting some requests
    Degraded,
    /// Rejecting all requests
    Failed,
    /// Operator-paused
    Maintenance,
}

/// Requirements a leased connection must satisfy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionRequirements {
    /// Connection must be encrypted
    pub encryption: bool,
    /// Connection must be authenticated
    pub authentication: bool,
    /// Minimum trust score of the endpoint
    pub min_trust: Option<TrustScore>,
    /// Minimum bandwidth in Mbps
    pub min_bandwidth_mbps: Option<f64>,
    /// Maximum acceptable latency in milliseconds
    pub max_latency_ms: Option<f64>,
}

/// A request to lease a connection
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Transport the connection must speak
    pub protocol: ProtocolId,
    /// Endpoint to connect to
    pub endpoint: EndpointAddress,
    /// Requirements on the connection
    pub requirements: ConnectionRequirements,
    /// Priority used to order contending waiters
    pub priority: MessagePriority,
    /// How long to wait for a free connection; zero fails immediately
    pub timeout: Duration,
    /// Who is asking, for the lease record
    pub requester: String,
}

/// Usage reported when a lease is released
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LeaseUsage {
    /// Requests performed under the lease
    pub requests: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Errors observed by the holder
    pub errors: u32,
    /// Mean request latency observed by the holder
    pub mean_latency_ms: Option<f64>,
}

/// A bounded-lifetime grant of exclusive use of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identifier used for release
    pub lease_id: LeaseId,
    /// Leased connection
    pub connection_id: ConnectionId,
    /// Owning pool
    pub pool_id: PoolId,
    /// Who holds the lease
    pub requester: String,
    /// When the lease was granted
    pub issued_at: SystemTime,
    /// When the sweeper may reclaim it
    pub expires_at: SystemTime,
}

/// Point-in-time pool metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Total connections in the map
    pub total_connections: usize,
    /// Idle connections
    pub idle: usize,
    /// Busy connections
    pub busy: usize,
    /// Waiters queued for a connection
    pub waiting: usize,
    /// busy / total
    pub utilization: f64,
    /// EMA failure rate
    pub failure_rate: f64,
    /// P95 of recent operation latencies
    pub p95_latency_ms: f64,
    /// Leases granted over the pool lifetime
    pub leases_granted: u64,
    /// Leases reclaimed after expiry
    pub leases_expired: u64,
}
