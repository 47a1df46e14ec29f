//! Health monitor: collection loops, derivation, flap damping
//!
//! One collector owns each agent (single writer); readers get snapshots.
//! Level changes must persist for both a configured duration and a
//! consecutive sample count before they are confirmed, in both directions,
//! to avoid flapping. Confirmed changes publish `health.changed` events.

use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::alerts::AlertManager;
use super::anomaly::AnomalyDetector;
use super::collector::{AgentProbe, AgentSample, MetricAggregator, MetricsBatcher};
use super::domain_types::{
    AgentHealthState, AlertSeverity, ComponentHealth, HealthLevel, MetricsSnapshot,
};
use crate::bus::domain_types::{event_types, BusEvent, EventId};
use crate::domain_types::{AgentId, ComponentId, MessageType};
use crate::error::CommError;
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::storage::{AnomalyRecord, AnomalyStore};
use crate::time_provider::TimeProvider;

/// Something that can publish bus events (the unified bus in production)
pub trait EventPublisher: Send + Sync {
    /// Publishes one event, best-effort
    fn publish(&self, event: BusEvent);
}

impl EventPublisher for crate::bus::bus::UnifiedBus {
    fn publish(&self, event: BusEvent) {
        if let Err(err) = self.publish_event(event) {
            tracing::trace!(error = %err, "health event dropped");
        }
    }
}

/// Publisher that drops everything; for isolated tests
#[derive(Debug, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: BusEvent) {}
}

/// Threshold set applied during derivation
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// CPU percentage considered degraded
    pub cpu_warning: f64,
    /// CPU percentage considered critical
    pub cpu_critical: f64,
    /// Memory percentage considered degraded
    pub memory_warning: f64,
    /// Memory percentage considered critical
    pub memory_critical: f64,
    /// Error rate considered unhealthy
    pub error_rate_unhealthy: f64,
    /// Response time considered degraded
    pub response_time_degraded_ms: f64,
    /// Availability below which the agent is unhealthy
    pub availability_unhealthy: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
            error_rate_unhealthy: 0.25,
            response_time_degraded_ms: 1_000.0,
            availability_unhealthy: 0.9,
        }
    }
}

/// Per-agent monitoring configuration
#[derive(Debug, Clone)]
pub struct AgentMonitorConfig {
    /// Collection cadence
    pub collection_interval: Duration,
    /// Derivation thresholds
    pub thresholds: HealthThresholds,
    /// Criticality weight per component; components below 0.5 can degrade
    /// the agent but never push it past `Degraded`
    pub component_weights: HashMap<String, f64>,
    /// How long a level change must persist before confirmation
    pub damping_duration: Duration,
    /// Consecutive samples a level change must persist
    pub damping_samples: u32,
}

impl Default for AgentMonitorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(30),
            thresholds: HealthThresholds::default(),
            component_weights: HashMap::from([
                ("performance".to_string(), 1.0),
                ("resources".to_string(), 1.0),
                ("governance".to_string(), 0.4),
            ]),
            damping_duration: Duration::from_secs(0),
            damping_samples: 2,
        }
    }
}

/// Pending level change being damped
#[derive(Debug, Clone)]
struct PendingLevel {
    level: HealthLevel,
    since: SystemTime,
    samples: u32,
}

struct ComponentTracker {
    confirmed: HealthLevel,
    confirmed_since: SystemTime,
    pending: Option<PendingLevel>,
}

struct AgentEntry {
    config: AgentMonitorConfig,
    probe: Arc<dyn AgentProbe>,
    aggregator: Mutex<MetricAggregator>,
    trackers: Mutex<HashMap<String, ComponentTracker>>,
    registered_at: SystemTime,
    last_heartbeat: Mutex<SystemTime>,
    last_overall: Mutex<HealthLevel>,
}

/// Owns per-agent health state; the collection loop is the single writer
pub struct HealthMonitor {
    agents: DashMap<AgentId, Arc<AgentEntry>>,
    alerts: Arc<AlertManager>,
    detector: Arc<dyn AnomalyDetector>,
    batcher: Arc<MetricsBatcher>,
    anomaly_store: Arc<dyn AnomalyStore>,
    publisher: Arc<dyn EventPublisher>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor
    #[must_use]
    pub fn new(
        alerts: Arc<AlertManager>,
        detector: Arc<dyn AnomalyDetector>,
        batcher: Arc<MetricsBatcher>,
        anomaly_store: Arc<dyn AnomalyStore>,
        publisher: Arc<dyn EventPublisher>,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            alerts,
            detector,
            batcher,
            anomaly_store,
            publisher,
            time,
        })
    }

    /// Registers an agent for monitoring
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        config: AgentMonitorConfig,
        probe: Arc<dyn AgentProbe>,
    ) {
        let now = self.time.now();
        info!(agent = %agent_id, interval_ms = config.collection_interval.as_millis() as u64, "agent registered for monitoring");
        self.agents.insert(
            agent_id.clone(),
            Arc::new(AgentEntry {
                config,
                probe,
                aggregator: Mutex::new(MetricAggregator::new(agent_id)),
                trackers: Mutex::new(HashMap::new()),
                registered_at: now,
                last_heartbeat: Mutex::new(now),
                last_overall: Mutex::new(HealthLevel::Unknown),
            }),
        );
    }

    /// Removes an agent from monitoring
    pub fn deregister_agent(&self, agent_id: &AgentId) {
        self.agents.remove(agent_id);
    }

    /// The registered agents and their collection intervals
    #[must_use]
    pub fn agent_intervals(&self) -> Vec<(AgentId, Duration)> {
        self.agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().config.collection_interval))
            .collect()
    }

    /// Registers collection jobs for every agent, plus the escalation sweep
    ///
    /// Call again after registering more agents; replaced jobs reuse their
    /// names. The batcher flush timer rides along with the escalation sweep.
    pub async fn register_jobs(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        for (agent_id, interval) in self.agent_intervals() {
            let monitor = Arc::clone(self);
            let agent = agent_id.clone();
            scheduler
                .register(PeriodicJob {
                    name: format!("health-collect-{agent_id}"),
                    interval,
                    max_jitter: Duration::from_millis(500),
                    run: Arc::new(move || {
                        let monitor = Arc::clone(&monitor);
                        let agent = agent.clone();
                        Box::pin(async move {
                            if let Err(err) = monitor.collect_once(&agent).await {
                                warn!(agent = %agent, error = %err, "collection pass failed");
                            }
                        })
                    }),
                })
                .await;
        }

        let monitor = Arc::clone(self);
        scheduler
            .register(PeriodicJob {
                name: "alert-escalations".to_string(),
                interval: Duration::from_secs(30),
                max_jitter: Duration::from_secs(2),
                run: Arc::new(move || {
                    let monitor = Arc::clone(&monitor);
                    Box::pin(async move {
                        monitor.alerts.run_escalations();
                        monitor.batcher.flush().await;
                    })
                }),
            })
            .await;
    }

    /// Runs one collection pass for an agent
    ///
    /// # Errors
    /// `Validation` for unregistered agents.
    pub async fn collect_once(&self, agent_id: &AgentId) -> Result<AgentHealthState, CommError> {
        let entry = self
            .agents
            .get(agent_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CommError::Validation {
                field: "agent_id".to_string(),
                reason: format!("agent {agent_id} is not registered"),
            })?;

        let now = self.time.now();
        let (sample, heartbeat_ok) = match entry.probe.sample().await {
            Ok(sample) => {
                let ok = sample.heartbeat_ok;
                (sample, ok)
            }
            Err(err) => {
                warn!(agent = %agent_id, error = %err, "probe failed");
                (AgentSample::default(), false)
            }
        };

        if heartbeat_ok {
            *entry
                .last_heartbeat
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = now;
        }

        // Anomaly check precedes ingestion so history excludes the sample.
        let (cpu_history, response_history, error_history) = {
            let aggregator = entry
                .aggregator
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                aggregator.cpu_history(),
                aggregator.response_time_history(),
                aggregator.error_rate_history(),
            )
        };
        self.check_anomaly(agent_id, "cpu_usage", sample.cpu_percent, &cpu_history);
        self.check_anomaly(
            agent_id,
            "response_time",
            sample.response_time_ms,
            &response_history,
        );
        self.check_anomaly(agent_id, "error_rate", sample.error_rate, &error_history);

        let snapshot = {
            let mut aggregator = entry
                .aggregator
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            aggregator.ingest(&sample, now)
        };
        self.batcher.submit(snapshot.clone()).await;

        let raw_levels = derive_components(&snapshot, &entry.config.thresholds, heartbeat_ok);
        let state = self.apply_damping(agent_id, &entry, raw_levels, now);

        let previous = {
            let mut last = entry
                .last_overall
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *last, state.overall)
        };
        if previous != state.overall {
            debug!(agent = %agent_id, from = ?previous, to = ?state.overall, "health level changed");
            self.publish_health_changed(agent_id, previous, state.overall);
        }

        Ok(state)
    }

    /// Current derived health for an agent
    ///
    /// # Errors
    /// `Validation` for unregistered agents.
    pub fn get_agent_health(&self, agent_id: &AgentId) -> Result<AgentHealthState, CommError> {
        let entry = self
            .agents
            .get(agent_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CommError::Validation {
                field: "agent_id".to_string(),
                reason: format!("agent {agent_id} is not registered"),
            })?;
        let now = self.time.now();
        let trackers = entry
            .trackers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let components: HashMap<String, ComponentHealth> = trackers
            .iter()
            .map(|(name, tracker)| {
                (
                    name.clone(),
                    ComponentHealth {
                        level: tracker.confirmed,
                        weight: entry
                            .config
                            .component_weights
                            .get(name)
                            .copied()
                            .unwrap_or(1.0),
                        since: tracker.confirmed_since,
                    },
                )
            })
            .collect();
        let last_heartbeat = *entry
            .last_heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(AgentHealthState {
            agent_id: agent_id.clone(),
            overall: overall_level(&components),
            alerts: self
                .alerts
                .active_for(agent_id)
                .into_iter()
                .map(|a| a.alert_id)
                .collect(),
            last_heartbeat,
            uptime: now
                .duration_since(entry.registered_at)
                .unwrap_or(Duration::ZERO),
            components,
        })
    }

    fn check_anomaly(&self, agent_id: &AgentId, metric: &str, sample: f64, history: &[f64]) {
        let verdict = self.detector.score(sample, history);
        if verdict.is_anomaly {
            let severity = if verdict.score > 0.8 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            self.alerts.create_alert(
                agent_id.clone(),
                "anomaly",
                metric,
                severity,
                verdict.expected,
                sample,
                vec!["anomaly".to_string()],
            );
            let record = AnomalyRecord {
                agent_id: agent_id.clone(),
                metric: metric.to_string(),
                score: verdict.score,
                expected: verdict.expected,
                actual: sample,
                at: self.time.now(),
            };
            let store = Arc::clone(&self.anomaly_store);
            tokio::spawn(async move {
                if let Err(err) = store.store_detection(record).await {
                    warn!(error = %err, "failed to persist anomaly detection");
                }
            });
        }
    }

    fn apply_damping(
        &self,
        agent_id: &AgentId,
        entry: &Arc<AgentEntry>,
        raw_levels: HashMap<String, HealthLevel>,
        now: SystemTime,
    ) -> AgentHealthState {
        let mut trackers = entry
            .trackers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for (component, raw) in raw_levels {
            let tracker = trackers.entry(component).or_insert(ComponentTracker {
                confirmed: HealthLevel::Unknown,
                confirmed_since: now,
                pending: None,
            });
            if raw == tracker.confirmed {
                tracker.pending = None;
                continue;
            }
            // First observation confirms immediately.
            if tracker.confirmed == HealthLevel::Unknown {
                tracker.confirmed = raw;
                tracker.confirmed_since = now;
                continue;
            }
            let pending = tracker.pending.get_or_insert(PendingLevel {
                level: raw,
                since: now,
                samples: 0,
            });
            if pending.level != raw {
                *pending = PendingLevel {
                    level: raw,
                    since: now,
                    samples: 0,
                };
            }
            pending.samples += 1;
            let held = now.duration_since(pending.since).unwrap_or(Duration::ZERO);
            if pending.samples >= entry.config.damping_samples
                && held >= entry.config.damping_duration
            {
                tracker.confirmed = raw;
                tracker.confirmed_since = now;
                tracker.pending = None;
            }
        }

        let components: HashMap<String, ComponentHealth> = trackers
            .iter()
            .map(|(name, tracker)| {
                (
                    name.clone(),
                    ComponentHealth {
                        level: tracker.confirmed,
                        weight: entry
                            .config
                            .component_weights
                            .get(name)
                            .copied()
                            .unwrap_or(1.0),
                        since: tracker.confirmed_since,
                    },
                )
            })
            .collect();
        drop(trackers);

        AgentHealthState {
            agent_id: agent_id.clone(),
            overall: overall_level(&components),
            alerts: self
                .alerts
                .active_for(agent_id)
                .into_iter()
                .map(|a| a.alert_id)
                .collect(),
            last_heartbeat: *entry
                .last_heartbeat
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            uptime: now
                .duration_since(entry.registered_at)
                .unwrap_or(Duration::ZERO),
            components,
        }
    }

    fn publish_health_changed(&self, agent_id: &AgentId, from: HealthLevel, to: HealthLevel) {
        let Ok(event_type) = MessageType::try_new(event_types::HEALTH_CHANGED.to_string()) else {
            return;
        };
        let Ok(source) = ComponentId::try_new("health-monitor".to_string()) else {
            return;
        };
        self.publisher.publish(BusEvent {
            id: EventId::generate(),
            event_type,
            source,
            correlation_id: None,
            payload: json!({
                "agent_id": agent_id.to_string(),
                "from": from,
                "to": to,
            }),
            at: self.time.now(),
        });
    }
}

/// Raw component levels from one snapshot, before damping
fn derive_components(
    snapshot: &MetricsSnapshot,
    thresholds: &HealthThresholds,
    heartbeat_ok: bool,
) -> HashMap<String, HealthLevel> {
    let mut levels = HashMap::new();

    let mut resources = HealthLevel::Healthy;
    let cpu = snapshot.resource.cpu.current;
    if cpu >= thresholds.cpu_critical {
        resources = resources.worse_of(HealthLevel::Critical);
    } else if cpu >= thresholds.cpu_warning {
        resources = resources.worse_of(HealthLevel::Degraded);
    }
    let memory = snapshot.resource.memory.current;
    if memory >= thresholds.memory_critical {
        resources = resources.worse_of(HealthLevel::Critical);
    } else if memory >= thresholds.memory_warning {
        resources = resources.worse_of(HealthLevel::Degraded);
    }
    let disk = &snapshot.resource.disk;
    if disk.percentage >= disk.thresholds.emergency {
        resources = resources.worse_of(HealthLevel::Critical);
    } else if disk.percentage >= disk.thresholds.critical {
        resources = resources.worse_of(HealthLevel::Unhealthy);
    } else if disk.percentage >= disk.thresholds.warning {
        resources = resources.worse_of(HealthLevel::Degraded);
    }
    levels.insert("resources".to_string(), resources);

    let mut performance = HealthLevel::Healthy;
    if !heartbeat_ok {
        performance = performance.worse_of(HealthLevel::Unhealthy);
    }
    if snapshot.performance.error_rate.current >= thresholds.error_rate_unhealthy {
        performance = performance.worse_of(HealthLevel::Unhealthy);
    }
    if snapshot.performance.response_time.current >= thresholds.response_time_degraded_ms {
        performance = performance.worse_of(HealthLevel::Degraded);
    }
    if snapshot.performance.availability < thresholds.availability_unhealthy {
        performance = performance.worse_of(HealthLevel::Unhealthy);
    }
    levels.insert("performance".to_string(), performance);

    let mut governance = HealthLevel::Healthy;
    if snapshot.governance.compliance < 0.5 || snapshot.governance.audit_integrity < 0.5 {
        governance = governance.worse_of(HealthLevel::Degraded);
    }
    levels.insert("governance".to_string(), governance);

    levels
}

/// Weighted-worst derivation: low-weight components cap at `Degraded`
fn overall_level(components: &HashMap<String, ComponentHealth>) -> HealthLevel {
    let mut overall = HealthLevel::Unknown;
    for component in components.values() {
        let effective = if component.weight < 0.5 {
            component.level.min(HealthLevel::Degraded)
        } else {
            component.level
        };
        overall = overall.worse_of(effective);
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::alerts::{AlertManagerConfig, LogSink};
    use crate::health::anomaly::StatisticalOutlierDetector;
    use crate::storage::{MemoryStore, MetricsStore};
    use crate::time_provider::MockTimeProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedProbe {
        cpu: Mutex<Vec<f64>>,
        unhealthy: AtomicBool,
    }

    #[async_trait]
    impl AgentProbe for ScriptedProbe {
        async fn sample(&self) -> Result<AgentSample, CommError> {
            let cpu = self
                .cpu
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(20.0);
            Ok(AgentSample {
                cpu_percent: cpu,
                response_time_ms: 10.0,
                error_rate: if self.unhealthy.load(Ordering::SeqCst) {
                    0.5
                } else {
                    0.0
                },
                heartbeat_ok: true,
                ..AgentSample::default()
            })
        }
    }

    fn monitor(clock: Arc<MockTimeProvider>) -> (Arc<HealthMonitor>, Arc<AlertManager>) {
        let alerts = Arc::new(AlertManager::new(
            AlertManagerConfig::default(),
            Arc::new(LogSink),
            Arc::clone(&clock) as Arc<dyn TimeProvider>,
        ));
        let store = Arc::new(MemoryStore::new());
        let monitor = HealthMonitor::new(
            Arc::clone(&alerts),
            Arc::new(StatisticalOutlierDetector::new(0.95, 4)),
            Arc::new(MetricsBatcher::new(
                Arc::clone(&store) as Arc<dyn MetricsStore>,
                1,
            )),
            store as Arc<dyn crate::storage::AnomalyStore>,
            Arc::new(NullPublisher),
            Arc::clone(&clock) as Arc<dyn TimeProvider>,
        );
        (monitor, alerts)
    }

    #[tokio::test]
    async fn healthy_agent_reports_healthy() {
        let clock = Arc::new(MockTimeProvider::new());
        let (monitor, _) = monitor(Arc::clone(&clock));
        let agent = AgentId::try_new("a".to_string()).unwrap();
        monitor.register_agent(
            agent.clone(),
            AgentMonitorConfig::default(),
            Arc::new(ScriptedProbe {
                cpu: Mutex::new(vec![20.0, 21.0, 19.0]),
                unhealthy: AtomicBool::new(false),
            }),
        );
        for _ in 0..3 {
            monitor.collect_once(&agent).await.unwrap();
        }
        let state = monitor.get_agent_health(&agent).unwrap();
        assert_eq!(state.overall, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn sustained_degradation_is_confirmed_after_damping() {
        let clock = Arc::new(MockTimeProvider::new());
        let (monitor, _) = monitor(Arc::clone(&clock));
        let agent = AgentId::try_new("a".to_string()).unwrap();
        let probe = Arc::new(ScriptedProbe {
            cpu: Mutex::new(vec![20.0]),
            unhealthy: AtomicBool::new(false),
        });
        monitor.register_agent(
            agent.clone(),
            AgentMonitorConfig {
                damping_samples: 2,
                ..AgentMonitorConfig::default()
            },
            Arc::clone(&probe) as Arc<dyn AgentProbe>,
        );
        // Establish healthy, then degrade.
        monitor.collect_once(&agent).await.unwrap();
        probe.unhealthy.store(true, Ordering::SeqCst);

        // One bad sample is not enough.
        let state = monitor.collect_once(&agent).await.unwrap();
        assert_eq!(state.overall, HealthLevel::Healthy);
        // The second consecutive bad sample confirms.
        let state = monitor.collect_once(&agent).await.unwrap();
        assert_eq!(state.overall, HealthLevel::Unhealthy);
    }

    #[tokio::test]
    async fn cpu_spike_raises_anomaly_alert() {
        let clock = Arc::new(MockTimeProvider::new());
        let (monitor, alerts) = monitor(Arc::clone(&clock));
        let agent = AgentId::try_new("a".to_string()).unwrap();
        monitor.register_agent(
            agent.clone(),
            AgentMonitorConfig::default(),
            Arc::new(ScriptedProbe {
                cpu: Mutex::new(vec![97.0, 33.0, 31.0, 32.0, 30.0]),
                unhealthy: AtomicBool::new(false),
            }),
        );
        for _ in 0..5 {
            monitor.collect_once(&agent).await.unwrap();
        }
        let active = alerts.active_for(&agent);
        assert!(active
            .iter()
            .any(|alert| alert.metric == "cpu_usage" && alert.alert_type == "anomaly"));
        let cpu_alert = active
            .iter()
            .find(|alert| alert.metric == "cpu_usage")
            .unwrap();
        assert!((cpu_alert.actual - 97.0).abs() < f64::EPSILON);
        assert!((cpu_alert.threshold - 31.5).abs() < 2.0);
        assert!(cpu_alert.severity >= AlertSeverity::Warning);
    }
}
