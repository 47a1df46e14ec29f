//! Time abstraction layer for testable time-dependent operations
//!
//! Every component receives an `Arc<dyn TimeProvider>` at construction instead
//! of reading the system clock. Production wires [`RealTimeProvider`]; tests
//! wire [`MockTimeProvider`], which can skip sleeps and advance a virtual
//! clock so TTL, lease-expiry, and cooldown logic can be exercised without
//! real delays.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep as tokio_sleep;

/// Trait for providing time-related functionality
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);

    /// Get the current system time
    #[must_use]
    fn now(&self) -> SystemTime;

    /// Get the current instant for measuring elapsed time
    #[must_use]
    fn instant(&self) -> Instant;

    /// Milliseconds since the UNIX epoch, saturating on clock skew
    #[must_use]
    fn epoch_millis(&self) -> u64 {
        self.now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Convenience constructor returning the trait object production code wants
    #[must_use]
    pub fn shared() -> Arc<dyn TimeProvider> {
        Arc::new(Self)
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Mock time provider for testing
///
/// Sleeps are truncated to at most one millisecond so async tasks still yield,
/// and an explicit virtual offset lets tests fast-forward TTLs and timeouts.
#[derive(Debug, Default)]
pub struct MockTimeProvider {
    offset_millis: AtomicU64,
    skip_delays: bool,
}

impl MockTimeProvider {
    /// Creates a new mock time provider that skips delays
    #[must_use]
    pub fn new() -> Self {
        Self {
            offset_millis: AtomicU64::new(0),
            skip_delays: true,
        }
    }

    /// Creates a mock time provider that uses real delays (for integration tests)
    #[must_use]
    pub fn with_real_delays() -> Self {
        Self {
            offset_millis: AtomicU64::new(0),
            skip_delays: false,
        }
    }

    /// Advances the virtual clock without sleeping
    pub fn advance(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.offset_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if self.skip_delays {
            self.advance(duration);
            if duration > Duration::from_millis(1) {
                tokio_sleep(Duration::from_millis(1)).await;
            }
        } else {
            tokio_sleep(duration).await;
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now() + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}
