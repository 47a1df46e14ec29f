//! Efficiency Monitor
//!
//! Aggregates cross-cutting delivery and resource signals into EMAs and a
//! normalized efficiency score in `[0, 1]`, publishes snapshots at the
//! analysis interval, and emits adaptation events when the score deviates
//! from baseline by more than the threshold. It never modifies any
//! component; it only signals.

use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::bus::domain_types::{event_types, BusEvent, EventId};
use crate::domain_types::{ComponentId, EmaAlpha, MessageType};
use crate::health::monitor::EventPublisher;
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::time_provider::TimeProvider;

const LATENCY_RING: usize = 512;

/// Efficiency monitor configuration
#[derive(Debug, Clone)]
pub struct EfficiencyConfig {
    /// Snapshot publication cadence
    pub analysis_interval: Duration,
    /// Deviation from baseline that emits an adaptation event
    pub adaptation_threshold: f64,
    /// EMA smoothing
    pub ema_alpha: EmaAlpha,
}

impl Default for EfficiencyConfig {
    fn default() -> Self {
        Self {
            analysis_interval: Duration::from_secs(30),
            adaptation_threshold: 0.15,
            ema_alpha: EmaAlpha::default(),
        }
    }
}

/// Point-in-time efficiency snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct EfficiencySnapshot {
    /// When the snapshot was taken
    pub at: SystemTime,
    /// EMA of the P50 latency
    pub latency_p50_ms: f64,
    /// EMA of the P95 latency
    pub latency_p95_ms: f64,
    /// EMA of the P99 latency
    pub latency_p99_ms: f64,
    /// Deliveries per second over the window
    pub throughput_per_second: f64,
    /// EMA success fraction
    pub reliability: f64,
    /// EMA resource utilization
    pub utilization: f64,
    /// EMA protocol efficiency (payload bytes / total bytes)
    pub protocol_efficiency: f64,
    /// Per-component efficiency scores
    pub component_efficiency: HashMap<ComponentId, f64>,
    /// EMA governance overhead per delivery, in milliseconds
    pub governance_overhead_ms: f64,
    /// Normalized aggregate in `[0, 1]`
    pub score: f64,
}

#[derive(Debug, Default)]
struct Window {
    latencies: VecDeque<f64>,
    deliveries: u64,
    window_started_millis: u64,
    reliability_ema: f64,
    utilization_ema: f64,
    protocol_efficiency_ema: f64,
    governance_overhead_ema: f64,
    components: HashMap<ComponentId, f64>,
    baseline_score: Option<f64>,
    has_samples: bool,
}

/// Collects outcomes and supplies adaptation signals
pub struct EfficiencyMonitor {
    config: EfficiencyConfig,
    window: Mutex<Window>,
    publisher: Arc<dyn EventPublisher>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for EfficiencyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EfficiencyMonitor").finish_non_exhaustive()
    }
}

impl EfficiencyMonitor {
    /// Creates a monitor
    #[must_use]
    pub fn new(
        config: EfficiencyConfig,
        publisher: Arc<dyn EventPublisher>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let started = time.epoch_millis();
        let monitor = Self {
            config,
            window: Mutex::new(Window {
                reliability_ema: 1.0,
                protocol_efficiency_ema: 1.0,
                window_started_millis: started,
                ..Window::default()
            }),
            publisher,
            time,
        };
        Arc::new(monitor)
    }

    /// Records one delivery outcome
    pub fn record_delivery(&self, success: bool, latency_ms: f64, payload_bytes: usize, wire_bytes: usize) {
        let alpha = self.config.ema_alpha.as_f64();
        let mut window = self.lock();
        window.has_samples = true;
        window.deliveries += 1;
        if window.latencies.len() >= LATENCY_RING {
            window.latencies.pop_front();
        }
        if success {
            window.latencies.push_back(latency_ms);
        }
        let success_sample = if success { 1.0 } else { 0.0 };
        window.reliability_ema =
            alpha * success_sample + (1.0 - alpha) * window.reliability_ema;
        if wire_bytes > 0 {
            let efficiency = (payload_bytes as f64 / wire_bytes as f64).clamp(0.0, 1.0);
            window.protocol_efficiency_ema =
                alpha * efficiency + (1.0 - alpha) * window.protocol_efficiency_ema;
        }
    }

    /// Records an observed resource utilization sample in `[0, 1]`
    pub fn record_utilization(&self, utilization: f64) {
        let alpha = self.config.ema_alpha.as_f64();
        let mut window = self.lock();
        window.utilization_ema =
            alpha * utilization.clamp(0.0, 1.0) + (1.0 - alpha) * window.utilization_ema;
    }

    /// Records governance processing overhead for one delivery
    pub fn record_governance_overhead(&self, overhead_ms: f64) {
        let alpha = self.config.ema_alpha.as_f64();
        let mut window = self.lock();
        window.governance_overhead_ema =
            alpha * overhead_ms + (1.0 - alpha) * window.governance_overhead_ema;
    }

    /// Records a component's self-reported efficiency in `[0, 1]`
    pub fn record_component(&self, component: ComponentId, efficiency: f64) {
        let mut window = self.lock();
        window
            .components
            .insert(component, efficiency.clamp(0.0, 1.0));
    }

    /// Builds a snapshot and emits an adaptation event on deviation
    pub fn publish_snapshot(&self) -> EfficiencySnapshot {
        let now = self.time.now();
        let now_millis = self.time.epoch_millis();
        let snapshot = {
            let mut window = self.lock();
            let p50 = percentile(&window.latencies, 0.50);
            let p95 = percentile(&window.latencies, 0.95);
            let p99 = percentile(&window.latencies, 0.99);
            let elapsed_secs =
                ((now_millis.saturating_sub(window.window_started_millis)) as f64 / 1_000.0)
                    .max(1.0);
            let throughput = window.deliveries as f64 / elapsed_secs;
            let score = efficiency_score(
                p95,
                window.reliability_ema,
                throughput,
                window.utilization_ema,
            );

            let snapshot = EfficiencySnapshot {
                at: now,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
                throughput_per_second: throughput,
                reliability: window.reliability_ema,
                utilization: window.utilization_ema,
                protocol_efficiency: window.protocol_efficiency_ema,
                component_efficiency: window.components.clone(),
                governance_overhead_ms: window.governance_overhead_ema,
                score,
            };

            if window.has_samples {
                match window.baseline_score {
                    None => window.baseline_score = Some(score),
                    Some(baseline) => {
                        if (score - baseline).abs() > self.config.adaptation_threshold {
                            drop(window);
                            self.emit_adaptation(baseline, score);
                            let mut window = self.lock();
                            // The new level becomes the baseline after signaling.
                            window.baseline_score = Some(score);
                            return snapshot;
                        }
                    }
                }
            }
            snapshot
        };
        debug!(score = snapshot.score, "efficiency snapshot");
        snapshot
    }

    /// Registers the snapshot job with the scheduler
    pub async fn register_job(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        let monitor = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "efficiency-snapshot".to_string(),
                interval: self.config.analysis_interval,
                max_jitter: Duration::from_millis(500),
                run: Arc::new(move || {
                    let monitor = Arc::clone(&monitor);
                    Box::pin(async move {
                        monitor.publish_snapshot();
                    })
                }),
            })
            .await;
    }

    fn emit_adaptation(&self, baseline: f64, score: f64) {
        info!(baseline, score, "efficiency deviation, signaling adaptation");
        let Ok(event_type) = MessageType::try_new(event_types::ADAPTATION_TRIGGERED.to_string())
        else {
            return;
        };
        let Ok(source) = ComponentId::try_new("efficiency-monitor".to_string()) else {
            return;
        };
        self.publisher.publish(BusEvent {
            id: EventId::generate(),
            event_type,
            source,
            correlation_id: None,
            payload: json!({
                "baseline": baseline,
                "score": score,
            }),
            at: self.time.now(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn percentile(samples: &VecDeque<f64>, p: f64) -> f64 {
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Normalized aggregate of latency, reliability, throughput, and utilization
fn efficiency_score(p95_ms: f64, reliability: f64, throughput: f64, utilization: f64) -> f64 {
    let latency_term = 1.0 / (1.0 + p95_ms / 100.0);
    let throughput_term = (throughput / (throughput + 10.0)).clamp(0.0, 1.0);
    // Utilization near the middle of the band is ideal; saturation is not.
    let utilization_term = 1.0 - (utilization - 0.5).abs();
    (0.3 * latency_term + 0.35 * reliability + 0.15 * throughput_term + 0.2 * utilization_term)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::monitor::NullPublisher;
    use crate::time_provider::MockTimeProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPublisher {
        count: AtomicUsize,
    }

    impl EventPublisher for CountingPublisher {
        fn publish(&self, _event: BusEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_recorded_outcomes() {
        let monitor = EfficiencyMonitor::new(
            EfficiencyConfig::default(),
            Arc::new(NullPublisher),
            Arc::new(MockTimeProvider::new()),
        );
        for _ in 0..9 {
            monitor.record_delivery(true, 10.0, 900, 1000);
        }
        monitor.record_delivery(false, 0.0, 900, 1000);
        monitor.record_utilization(0.5);

        let snapshot = monitor.publish_snapshot();
        assert!(snapshot.reliability < 1.0);
        assert!(snapshot.latency_p95_ms >= 10.0);
        assert!(snapshot.protocol_efficiency < 1.0);
        assert!(snapshot.score > 0.0 && snapshot.score <= 1.0);
    }

    #[tokio::test]
    async fn deviation_emits_adaptation_event() {
        let publisher = Arc::new(CountingPublisher {
            count: AtomicUsize::new(0),
        });
        let monitor = EfficiencyMonitor::new(
            EfficiencyConfig {
                adaptation_threshold: 0.05,
                ema_alpha: EmaAlpha::try_new(0.5).unwrap(),
                ..EfficiencyConfig::default()
            },
            Arc::clone(&publisher) as Arc<dyn EventPublisher>,
            Arc::new(MockTimeProvider::new()),
        );
        // Establish a healthy baseline.
        for _ in 0..20 {
            monitor.record_delivery(true, 5.0, 900, 1000);
        }
        monitor.publish_snapshot();
        assert_eq!(publisher.count.load(Ordering::SeqCst), 0);

        // Degrade hard; the next snapshot should signal.
        for _ in 0..40 {
            monitor.record_delivery(false, 0.0, 900, 1000);
        }
        monitor.publish_snapshot();
        assert_eq!(publisher.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ema_stays_within_sample_bounds() {
        let monitor = EfficiencyMonitor::new(
            EfficiencyConfig::default(),
            Arc::new(NullPublisher),
            Arc::new(MockTimeProvider::new()),
        );
        for latency in [10.0, 20.0, 15.0, 30.0] {
            monitor.record_delivery(true, latency, 100, 120);
        }
        let snapshot = monitor.publish_snapshot();
        assert!(snapshot.latency_p50_ms >= 10.0 && snapshot.latency_p50_ms <= 30.0);
        assert!(snapshot.reliability >= 0.0 && snapshot.reliability <= 1.0);
    }
}
