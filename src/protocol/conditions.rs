//! Network condition sampling
//!
//! The most recent sample plus a bounded ring of history, fed at a fixed
//! cadence by whatever probe the embedder wires through the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::time_provider::TimeProvider;

/// Congestion bands, ordered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    /// No observable queueing
    #[default]
    Low,
    /// Some queueing, throughput unaffected
    Moderate,
    /// Sustained queueing; adaptation triggers fire at this level
    High,
    /// Loss-inducing congestion
    Critical,
}

/// One sample of network conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// When the sample was taken
    pub timestamp: SystemTime,
    /// Available bandwidth estimate
    pub bandwidth_mbps: f64,
    /// Round-trip latency estimate
    pub latency_ms: f64,
    /// Packet loss fraction in `[0, 1]`
    pub packet_loss: f64,
    /// Latency variance
    pub jitter_ms: f64,
    /// Link stability in `[0, 1]`
    pub stability: f64,
    /// Congestion band
    pub congestion: CongestionLevel,
    /// Overall quality in `[0, 1]`
    pub quality: f64,
}

impl NetworkConditions {
    /// A nominal sample for environments with no probe wired
    #[must_use]
    pub fn nominal(timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            bandwidth_mbps: 1_000.0,
            latency_ms: 1.0,
            packet_loss: 0.0,
            jitter_ms: 0.1,
            stability: 1.0,
            congestion: CongestionLevel::Low,
            quality: 1.0,
        }
    }
}

/// Holds the latest sample and a bounded ring of history
pub struct NetworkMonitor {
    current: RwLock<NetworkConditions>,
    history: RwLock<VecDeque<NetworkConditions>>,
    capacity: usize,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("history_capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    /// Creates a monitor seeded with a nominal sample
    #[must_use]
    pub fn new(history_capacity: usize, time: Arc<dyn TimeProvider>) -> Self {
        let seed = NetworkConditions::nominal(time.now());
        Self {
            current: RwLock::new(seed),
            history: RwLock::new(VecDeque::with_capacity(history_capacity)),
            capacity: history_capacity.max(1),
            time,
        }
    }

    /// Records a new sample, evicting the oldest beyond capacity
    pub fn observe(&self, sample: NetworkConditions) {
        {
            let mut history = self
                .history
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }
        *self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = sample;
    }

    /// The most recent sample
    #[must_use]
    pub fn current(&self) -> NetworkConditions {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the history ring, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<NetworkConditions> {
        self.history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Mean latency over the history window, or the current sample's latency
    #[must_use]
    pub fn mean_latency_ms(&self) -> f64 {
        let history = self
            .history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if history.is_empty() {
            return self.current().latency_ms;
        }
        history.iter().map(|s| s.latency_ms).sum::<f64>() / history.len() as f64
    }

    /// Current sample age, for staleness checks
    #[must_use]
    pub fn sample_age(&self) -> std::time::Duration {
        let current = self.current();
        self.time
            .now()
            .duration_since(current.timestamp)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::MockTimeProvider;

    #[test]
    fn history_ring_is_bounded() {
        let monitor = NetworkMonitor::new(3, Arc::new(MockTimeProvider::new()));
        for n in 0..5 {
            let mut sample = NetworkConditions::nominal(SystemTime::now());
            sample.latency_ms = f64::from(n);
            monitor.observe(sample);
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert!((history[0].latency_ms - 2.0).abs() < f64::EPSILON);
        assert!((monitor.current().latency_ms - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn congestion_levels_are_ordered() {
        assert!(CongestionLevel::High > CongestionLevel::Moderate);
        assert!(CongestionLevel::Critical > CongestionLevel::High);
    }
}
