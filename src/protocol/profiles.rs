//! Protocol profile registry
//!
//! A profile is a static capability record for one transport: what it can do,
//! what it costs, and how it retries. Measured performance lives beside the
//! static record and is EMA-updated from delivery outcomes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::domain_types::{EmaAlpha, ProtocolId};

/// Backoff strategies for a transport's retry mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay grows by a fixed step
    Linear,
    /// Delay doubles per attempt
    #[default]
    Exponential,
    /// Transport-specific policy supplied by the embedder
    Custom,
}

/// Retry mechanism descriptor advertised by a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMechanism {
    /// Attempts including the first
    pub max_attempts: u8,
    /// Backoff strategy
    pub backoff: BackoffStrategy,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on the delay
    pub max_delay_ms: u64,
    /// Whether jitter is applied
    pub jitter: bool,
}

impl Default for RetryMechanism {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

/// Static capability record for one transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolCharacteristics {
    /// Requires connection establishment before traffic
    pub connection_oriented: bool,
    /// Both directions on one connection
    pub bidirectional: bool,
    /// Supports unbounded streams
    pub streaming: bool,
    /// Multiple logical channels per connection
    pub multiplexing: bool,
    /// Encrypts on the wire without an extra layer
    pub native_encryption: bool,
    /// Per-frame header overhead in bytes
    pub header_overhead_bytes: usize,
    /// Typical connection setup time
    pub setup_time_ms: f64,
    /// Smallest payload the transport is efficient for
    pub ideal_payload_min: usize,
    /// Largest payload the transport is efficient for
    pub ideal_payload_max: usize,
    /// Concurrency ceiling per endpoint
    pub max_concurrent_connections: usize,
    /// Minimum usable bandwidth
    pub min_bandwidth_mbps: f64,
    /// Relative CPU cost per connection
    pub cpu_cost_per_connection: f64,
    /// Memory cost per connection in KiB
    pub memory_kb_per_connection: usize,
}

/// Measured performance, EMA-updated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasuredPerformance {
    /// Success fraction
    pub success_rate: f64,
    /// Round-trip latency in milliseconds
    pub avg_latency_ms: f64,
    /// Sustainable throughput
    pub throughput_mbps: f64,
    /// Samples folded in so far
    pub samples: u64,
}

/// A registered transport profile
pub struct ProtocolProfile {
    /// Registry identifier
    pub id: ProtocolId,
    /// Static capability record
    pub characteristics: ProtocolCharacteristics,
    /// Retry mechanism descriptor
    pub retry: RetryMechanism,
    performance: RwLock<MeasuredPerformance>,
}

impl std::fmt::Debug for ProtocolProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolProfile")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ProtocolProfile {
    /// Creates a profile seeded with optimistic defaults
    #[must_use]
    pub fn new(id: ProtocolId, characteristics: ProtocolCharacteristics, retry: RetryMechanism) -> Self {
        let seed = MeasuredPerformance {
            success_rate: 1.0,
            avg_latency_ms: characteristics.setup_time_ms.max(1.0),
            throughput_mbps: characteristics.min_bandwidth_mbps.max(1.0),
            samples: 0,
        };
        Self {
            id,
            characteristics,
            retry,
            performance: RwLock::new(seed),
        }
    }

    /// Folds one delivery outcome into the measured performance
    pub fn record_outcome(&self, alpha: EmaAlpha, success: bool, latency_ms: f64, payload_bytes: usize) {
        let a = alpha.as_f64();
        let mut perf = self
            .performance
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let success_sample = if success { 1.0 } else { 0.0 };
        perf.success_rate = a * success_sample + (1.0 - a) * perf.success_rate;
        if success {
            perf.avg_latency_ms = a * latency_ms + (1.0 - a) * perf.avg_latency_ms;
            if latency_ms > 0.0 {
                let mbps = (payload_bytes as f64 * 8.0) / (latency_ms / 1_000.0) / 1_000_000.0;
                perf.throughput_mbps = a * mbps + (1.0 - a) * perf.throughput_mbps;
            }
        }
        perf.samples += 1;
    }

    /// Snapshot of the measured performance
    #[must_use]
    pub fn performance(&self) -> MeasuredPerformance {
        self.performance
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Registry of transport profiles
pub struct ProfileRegistry {
    profiles: DashMap<ProtocolId, std::sync::Arc<ProtocolProfile>>,
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.profiles.len())
            .finish()
    }
}

impl ProfileRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
        }
    }

    /// Creates a registry seeded with the four built-in transports
    ///
    /// # Panics
    /// Panics if the built-in protocol ids are malformed (they are not).
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ProtocolProfile::new(
            ProtocolId::try_new("stream".to_string()).unwrap(),
            ProtocolCharacteristics {
                connection_oriented: true,
                bidirectional: true,
                streaming: true,
                multiplexing: false,
                native_encryption: false,
                header_overhead_bytes: 40,
                setup_time_ms: 2.0,
                ideal_payload_min: 1,
                ideal_payload_max: 16 * 1024 * 1024,
                max_concurrent_connections: 10_000,
                min_bandwidth_mbps: 0.1,
                cpu_cost_per_connection: 1.0,
                memory_kb_per_connection: 64,
            },
            RetryMechanism::default(),
        ));
        registry.register(ProtocolProfile::new(
            ProtocolId::try_new("datagram".to_string()).unwrap(),
            ProtocolCharacteristics {
                connection_oriented: false,
                bidirectional: false,
                streaming: false,
                multiplexing: false,
                native_encryption: false,
                header_overhead_bytes: 8,
                setup_time_ms: 0.0,
                ideal_payload_min: 1,
                ideal_payload_max: 60 * 1024,
                max_concurrent_connections: 100_000,
                min_bandwidth_mbps: 0.01,
                cpu_cost_per_connection: 0.1,
                memory_kb_per_connection: 4,
            },
            RetryMechanism {
                max_attempts: 5,
                backoff: BackoffStrategy::Linear,
                initial_delay_ms: 50,
                max_delay_ms: 1_000,
                jitter: true,
            },
        ));
        registry.register(ProtocolProfile::new(
            ProtocolId::try_new("framed".to_string()).unwrap(),
            ProtocolCharacteristics {
                connection_oriented: true,
                bidirectional: true,
                streaming: false,
                multiplexing: true,
                native_encryption: false,
                header_overhead_bytes: 16,
                setup_time_ms: 3.0,
                ideal_payload_min: 64,
                ideal_payload_max: 1024 * 1024,
                max_concurrent_connections: 5_000,
                min_bandwidth_mbps: 0.1,
                cpu_cost_per_connection: 1.5,
                memory_kb_per_connection: 96,
            },
            RetryMechanism::default(),
        ));
        registry.register(ProtocolProfile::new(
            ProtocolId::try_new("encrypted-stream".to_string()).unwrap(),
            ProtocolCharacteristics {
                connection_oriented: true,
                bidirectional: true,
                streaming: true,
                multiplexing: false,
                native_encryption: true,
                header_overhead_bytes: 69,
                setup_time_ms: 12.0,
                ideal_payload_min: 1,
                ideal_payload_max: 16 * 1024 * 1024,
                max_concurrent_connections: 5_000,
                min_bandwidth_mbps: 0.5,
                cpu_cost_per_connection: 3.0,
                memory_kb_per_connection: 160,
            },
            RetryMechanism::default(),
        ));
        registry
    }

    /// Registers (or replaces) a profile
    pub fn register(&self, profile: ProtocolProfile) {
        self.profiles.insert(profile.id.clone(), std::sync::Arc::new(profile));
    }

    /// Looks up a profile by id
    #[must_use]
    pub fn get(&self, id: &ProtocolId) -> Option<std::sync::Arc<ProtocolProfile>> {
        self.profiles.get(id).map(|entry| std::sync::Arc::clone(entry.value()))
    }

    /// All registered profiles
    #[must_use]
    pub fn all(&self) -> Vec<std::sync::Arc<ProtocolProfile>> {
        self.profiles
            .iter()
            .map(|entry| std::sync::Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered profiles
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_the_capability_space() {
        let registry = ProfileRegistry::with_builtins();
        assert_eq!(registry.len(), 4);
        let encrypted = registry
            .get(&ProtocolId::try_new("encrypted-stream".to_string()).unwrap())
            .unwrap();
        assert!(encrypted.characteristics.native_encryption);
        let datagram = registry
            .get(&ProtocolId::try_new("datagram".to_string()).unwrap())
            .unwrap();
        assert!(!datagram.characteristics.connection_oriented);
    }

    #[test]
    fn outcome_recording_moves_the_ema() {
        let registry = ProfileRegistry::with_builtins();
        let stream = registry
            .get(&ProtocolId::try_new("stream".to_string()).unwrap())
            .unwrap();
        let alpha = EmaAlpha::try_new(0.5).unwrap();
        stream.record_outcome(alpha, false, 0.0, 0);
        let perf = stream.performance();
        assert!(perf.success_rate < 1.0);
        assert_eq!(perf.samples, 1);
    }
}
