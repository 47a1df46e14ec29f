//! Shared domain types for the communication core
//!
//! Strongly-typed domain values used across more than one subsystem, defined
//! with `nutype` to prevent primitive obsession and to validate at the
//! boundary instead of deep inside the hot path.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a governance agent
///
/// Agent ids are operator-assigned names (`"billing-auditor"`, `"quorum-7"`),
/// not generated values; they arrive from configuration and registration calls.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

/// Identifier for an internal platform component reporting heartbeats
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ComponentId(String);

/// Caller-supplied unique identifier for a message
///
/// Uniqueness is enforced for the lifetime of the bus at submission time.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct MessageId(String);

/// Opaque identifier returned by `Send` once a message is durably enqueued
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
pub struct DeliveryId(Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlation identifier linking related messages and events
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct CorrelationId(String);

/// Message type used for routing, subscription matching, and metric buckets
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct MessageType(String);

/// Network endpoint address (`host:port`, socket path, or logical locator)
#[nutype(
    validate(len_char_min = 1, len_char_max = 512),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct EndpointAddress(String);

/// Identifier of a transport protocol profile in the selector registry
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ProtocolId(String);

/// Trust score in `[0, 1]` attached to routes and targets
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.5
)]
pub struct TrustScore(f64);

impl TrustScore {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Reliability ratio in `[0, 1]` (observed success fraction)
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1.0
)]
pub struct Reliability(f64);

impl Reliability {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Load factor in `[0, 1]` (0 = idle, 1 = saturated)
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.0
)]
pub struct LoadFactor(f64);

impl LoadFactor {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Smoothing factor for exponential moving averages, in `(0, 1]`
#[nutype(
    validate(greater = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.2
)]
pub struct EmaAlpha(f64);

impl EmaAlpha {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Channel capacity for bounded queues
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum retry attempts for failed operations
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u8);

impl MaxRetries {
    /// Gets the value as u8
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Retry delay in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Retry backoff multiplication factor
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 5.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2.0
)]
pub struct RetryBackoffFactor(f64);

impl RetryBackoffFactor {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Monotonic count of processed items
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct MessageCount(u64);

impl MessageCount {
    /// A count of zero
    #[must_use]
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// Returns the count incremented by one
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Retry policy attached to a message or a recovery step
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts including the first
    pub max_attempts: MaxRetries,
    /// Delay before the first retry
    pub initial_delay: RetryDelayMs,
    /// Multiplier applied to the delay after each attempt
    pub backoff_factor: RetryBackoffFactor,
    /// Upper bound on the computed delay
    pub max_delay: RetryDelayMs,
}

impl RetryPolicy {
    /// Computes the delay before the given retry attempt (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u8) -> std::time::Duration {
        let base = self.initial_delay.as_u64() as f64;
        let factor = self.backoff_factor.as_f64().powi(i32::from(attempt.saturating_sub(1)));
        let delay = (base * factor).min(self.max_delay.as_u64() as f64);
        std::time::Duration::from_millis(delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MaxRetries::default(),
            initial_delay: RetryDelayMs::default(),
            backoff_factor: RetryBackoffFactor::default(),
            max_delay: RetryDelayMs::try_new(30_000).unwrap_or_default(),
        }
    }
}
