//! Alert lifecycle management
//!
//! Active alerts are deduplicated by `(agent, type, metric)` within a
//! suppression window. Terminal states are sticky and acknowledgments are
//! never removed. Escalation advances one level each time the
//! acknowledgment timeout passes without an ack; each level may notify
//! additional channels (opaque sinks).

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::domain_types::{
    Acknowledgment, Alert, AlertId, AlertSeverity, AlertStatus, EscalationRecord,
};
use crate::domain_types::AgentId;
use crate::error::CommError;
use crate::time_provider::TimeProvider;

/// One escalation ladder level
#[derive(Debug, Clone)]
pub struct EscalationLevel {
    /// Channels (opaque sink names) notified at this level
    pub channels: Vec<String>,
}

/// Alert manager configuration
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Window within which duplicate alerts are suppressed
    pub suppression_window: Duration,
    /// Time without acknowledgment before escalating one level
    pub acknowledgment_timeout: Duration,
    /// Escalation ladder, level 1 first
    pub escalation_levels: Vec<EscalationLevel>,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::from_secs(300),
            acknowledgment_timeout: Duration::from_secs(900),
            escalation_levels: vec![
                EscalationLevel {
                    channels: vec!["oncall".to_string()],
                },
                EscalationLevel {
                    channels: vec!["oncall".to_string(), "team-lead".to_string()],
                },
            ],
        }
    }
}

/// Opaque notification sink (email, chat, webhook live outside the core)
pub trait NotificationSink: Send + Sync {
    /// Delivers one alert notification to a named channel
    fn notify(&self, channel: &str, alert: &Alert);
}

/// Sink that only logs; the default when no sink is wired
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, channel: &str, alert: &Alert) {
        info!(channel, alert = %alert.alert_id, agent = %alert.agent_id, "alert notification");
    }
}

/// Owns every alert and drives deduplication and escalation
pub struct AlertManager {
    config: AlertManagerConfig,
    alerts: DashMap<AlertId, Alert>,
    // (agent, type, metric) -> (alert id, raised_at) for dedup
    active_index: DashMap<(AgentId, String, String), (AlertId, SystemTime)>,
    sink: Arc<dyn NotificationSink>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("alerts", &self.alerts.len())
            .finish_non_exhaustive()
    }
}

impl AlertManager {
    /// Creates an alert manager
    #[must_use]
    pub fn new(
        config: AlertManagerConfig,
        sink: Arc<dyn NotificationSink>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            alerts: DashMap::new(),
            active_index: DashMap::new(),
            sink,
            time,
        }
    }

    /// Raises an alert, deduplicating within the suppression window
    ///
    /// Returns the existing alert's id when the `(agent, type, metric)` tuple
    /// already has an active alert inside the window.
    pub fn create_alert(
        &self,
        agent_id: AgentId,
        alert_type: &str,
        metric: &str,
        severity: AlertSeverity,
        threshold: f64,
        actual: f64,
        tags: Vec<String>,
    ) -> AlertId {
        let now = self.time.now();
        let key = (agent_id.clone(), alert_type.to_string(), metric.to_string());

        if let Some(entry) = self.active_index.get(&key) {
            let (existing_id, raised_at) = *entry;
            let within_window = now
                .duration_since(raised_at)
                .map(|age| age <= self.config.suppression_window)
                .unwrap_or(true);
            let still_active = self
                .alerts
                .get(&existing_id)
                .is_some_and(|alert| !alert.status.is_terminal());
            if within_window && still_active {
                debug!(alert = %existing_id, agent = %agent_id, "duplicate alert suppressed");
                return existing_id;
            }
        }

        let alert = Alert {
            alert_id: AlertId::generate(),
            agent_id: agent_id.clone(),
            alert_type: alert_type.to_string(),
            metric: metric.to_string(),
            severity,
            threshold,
            actual,
            status: AlertStatus::Active,
            acks: Vec::new(),
            escalations: Vec::new(),
            resolution: None,
            tags,
            raised_at: now,
        };
        let alert_id = alert.alert_id;
        warn!(alert = %alert_id, agent = %agent_id, metric, ?severity, actual, "alert raised");
        self.alerts.insert(alert_id, alert);
        self.active_index.insert(key, (alert_id, now));
        alert_id
    }

    /// Acknowledges an alert; the audit trail only ever grows
    ///
    /// # Errors
    /// `Validation` for unknown alerts or terminal states.
    pub fn acknowledge(
        &self,
        alert_id: AlertId,
        by: &str,
        comment: Option<String>,
    ) -> Result<(), CommError> {
        let mut alert = self.alerts.get_mut(&alert_id).ok_or_else(|| {
            CommError::Validation {
                field: "alert_id".to_string(),
                reason: format!("unknown alert {alert_id}"),
            }
        })?;
        if alert.status.is_terminal() {
            return Err(CommError::Validation {
                field: "status".to_string(),
                reason: "alert is in a terminal state".to_string(),
            });
        }
        alert.acks.push(Acknowledgment {
            by: by.to_string(),
            at: self.time.now(),
            comment,
        });
        alert.status = AlertStatus::Acknowledged;
        info!(alert = %alert_id, by, "alert acknowledged");
        Ok(())
    }

    /// Resolves an alert; terminal and sticky
    ///
    /// # Errors
    /// `Validation` for unknown alerts or a second resolution.
    pub fn resolve(&self, alert_id: AlertId, by: &str, resolution: &str) -> Result<(), CommError> {
        let mut alert = self.alerts.get_mut(&alert_id).ok_or_else(|| {
            CommError::Validation {
                field: "alert_id".to_string(),
                reason: format!("unknown alert {alert_id}"),
            }
        })?;
        if alert.status.is_terminal() {
            return Err(CommError::Validation {
                field: "status".to_string(),
                reason: "alert already terminal".to_string(),
            });
        }
        alert.status = AlertStatus::Resolved;
        alert.resolution = Some(format!("{by}: {resolution}"));
        info!(alert = %alert_id, by, "alert resolved");
        Ok(())
    }

    /// Suppresses an alert; terminal and sticky
    ///
    /// # Errors
    /// `Validation` for unknown alerts or terminal states.
    pub fn suppress(&self, alert_id: AlertId, by: &str) -> Result<(), CommError> {
        let mut alert = self.alerts.get_mut(&alert_id).ok_or_else(|| {
            CommError::Validation {
                field: "alert_id".to_string(),
                reason: format!("unknown alert {alert_id}"),
            }
        })?;
        if alert.status.is_terminal() {
            return Err(CommError::Validation {
                field: "status".to_string(),
                reason: "alert already terminal".to_string(),
            });
        }
        alert.status = AlertStatus::Suppressed;
        info!(alert = %alert_id, by, "alert suppressed");
        Ok(())
    }

    /// Advances escalation for unacknowledged alerts past the ack timeout
    ///
    /// Called periodically; each pass advances an overdue alert by exactly
    /// one level and notifies that level's channels.
    pub fn run_escalations(&self) -> usize {
        let now = self.time.now();
        let mut escalated = 0;
        for mut entry in self.alerts.iter_mut() {
            let alert = entry.value_mut();
            if !matches!(alert.status, AlertStatus::Active | AlertStatus::Escalated) {
                continue;
            }
            let next_level = alert.escalations.len();
            if next_level >= self.config.escalation_levels.len() {
                continue; // ladder exhausted
            }
            let reference = alert
                .escalations
                .last()
                .map_or(alert.raised_at, |record| record.at);
            let overdue = now
                .duration_since(reference)
                .map(|age| age >= self.config.acknowledgment_timeout)
                .unwrap_or(false);
            if !overdue {
                continue;
            }
            let level = &self.config.escalation_levels[next_level];
            let record = EscalationRecord {
                level: u8::try_from(next_level + 1).unwrap_or(u8::MAX),
                at: now,
                channels: level.channels.clone(),
            };
            alert.escalations.push(record);
            alert.status = AlertStatus::Escalated;
            for channel in &level.channels {
                self.sink.notify(channel, alert);
            }
            warn!(alert = %alert.alert_id, level = next_level + 1, "alert escalated");
            escalated += 1;
        }
        escalated
    }

    /// Fetches an alert by id
    #[must_use]
    pub fn get(&self, alert_id: AlertId) -> Option<Alert> {
        self.alerts.get(&alert_id).map(|entry| entry.value().clone())
    }

    /// Non-terminal alerts for an agent
    #[must_use]
    pub fn active_for(&self, agent_id: &AgentId) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|entry| {
                entry.value().agent_id == *agent_id && !entry.value().status.is_terminal()
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Alert counts by status
    #[must_use]
    pub fn counts(&self) -> HashMap<AlertStatus, usize> {
        let mut counts = HashMap::new();
        for entry in &self.alerts {
            *counts.entry(entry.value().status).or_insert(0) += 1;
        }
        counts
    }
}
