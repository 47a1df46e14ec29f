//! Metrics export surface
//!
//! Three formats: a JSON dump of agents, a CSV with a fixed header, and a
//! line-based numeric format suitable for scrape collectors. The CSV is
//! UTF-8 and `\n`-terminated; an embedded comma in any field is rejected
//! rather than quoted, so emitters must transform such values upstream.

use serde::{Deserialize, Serialize};

use crate::domain_types::AgentId;
use crate::error::CommError;
use crate::health::domain_types::{AgentHealthState, HealthLevel, MetricsSnapshot};

/// Fixed CSV header
pub const CSV_HEADER: &str = "agentId,health,uptime,responseTime,errorRate,cpuUsage";

/// One exportable agent row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    /// Agent id
    pub agent_id: AgentId,
    /// Derived health level
    pub health: HealthLevel,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Current response time in milliseconds
    pub response_time_ms: f64,
    /// Current error fraction
    pub error_rate: f64,
    /// Current CPU usage percentage
    pub cpu_usage: f64,
}

impl ExportRecord {
    /// Builds a row from derived health and the latest snapshot
    #[must_use]
    pub fn from_state(state: &AgentHealthState, snapshot: Option<&MetricsSnapshot>) -> Self {
        Self {
            agent_id: state.agent_id.clone(),
            health: state.overall,
            uptime_seconds: state.uptime.as_secs(),
            response_time_ms: snapshot
                .map_or(0.0, |s| s.performance.response_time.current),
            error_rate: snapshot.map_or(0.0, |s| s.performance.error_rate.current),
            cpu_usage: snapshot.map_or(0.0, |s| s.resource.cpu.current),
        }
    }
}

/// JSON dump of agents
///
/// # Errors
/// `Validation` when serialization fails (it does not for these types).
pub fn to_json(records: &[ExportRecord]) -> Result<String, CommError> {
    serde_json::to_string_pretty(records).map_err(|err| CommError::Validation {
        field: "export".to_string(),
        reason: err.to_string(),
    })
}

/// CSV with the fixed header; embedded commas are rejected, not quoted
///
/// # Errors
/// `Validation` naming the offending agent when any field contains a comma.
pub fn to_csv(records: &[ExportRecord]) -> Result<String, CommError> {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for record in records {
        let health = health_label(record.health);
        let fields = [
            record.agent_id.to_string(),
            health.to_string(),
            record.uptime_seconds.to_string(),
            format_number(record.response_time_ms),
            format_number(record.error_rate),
            format_number(record.cpu_usage),
        ];
        for field in &fields {
            if field.contains(',') {
                return Err(CommError::Validation {
                    field: "csv".to_string(),
                    reason: format!(
                        "field for agent {} contains a comma: {field}",
                        record.agent_id
                    ),
                });
            }
        }
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    Ok(out)
}

/// Line-based numeric format for scrape collectors
///
/// One line per metric: `metric_name{label="value"} number`.
#[must_use]
pub fn to_scrape_lines(records: &[ExportRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let agent = record.agent_id.as_ref();
        out.push_str(&format!(
            "agent_health{{agent_id=\"{agent}\"}} {}\n",
            health_gauge(record.health)
        ));
        out.push_str(&format!(
            "agent_uptime_seconds{{agent_id=\"{agent}\"}} {}\n",
            record.uptime_seconds
        ));
        out.push_str(&format!(
            "agent_response_time_ms{{agent_id=\"{agent}\"}} {}\n",
            format_number(record.response_time_ms)
        ));
        out.push_str(&format!(
            "agent_error_rate{{agent_id=\"{agent}\"}} {}\n",
            format_number(record.error_rate)
        ));
        out.push_str(&format!(
            "agent_cpu_usage_percent{{agent_id=\"{agent}\"}} {}\n",
            format_number(record.cpu_usage)
        ));
    }
    out
}

fn health_label(level: HealthLevel) -> &'static str {
    match level {
        HealthLevel::Healthy => "healthy",
        HealthLevel::Degraded => "degraded",
        HealthLevel::Unhealthy => "unhealthy",
        HealthLevel::Critical => "critical",
        HealthLevel::Unknown => "unknown",
    }
}

/// Numeric gauge value per level for scrape collectors
fn health_gauge(level: HealthLevel) -> u8 {
    match level {
        HealthLevel::Healthy => 0,
        HealthLevel::Degraded => 1,
        HealthLevel::Unhealthy => 2,
        HealthLevel::Critical => 3,
        HealthLevel::Unknown => 4,
    }
}

fn format_number(value: f64) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("{value:.0}")
    } else {
        format!("{value:.4}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    fn record(agent: &str, cpu: f64) -> ExportRecord {
        ExportRecord {
            agent_id: AgentId::try_new(agent.to_string()).unwrap(),
            health: HealthLevel::Healthy,
            uptime_seconds: 3600,
            response_time_ms: 12.5,
            error_rate: 0.01,
            cpu_usage: cpu,
        }
    }

    #[test]
    fn csv_has_fixed_header_and_newline_termination() {
        let csv = to_csv(&[record("a", 20.0), record("b", 30.0)]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        assert_eq!(lines.count(), 2);
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn csv_rejects_embedded_commas() {
        let mut bad = record("a", 20.0);
        bad.agent_id = AgentId::try_new("agent,with,commas".to_string()).unwrap();
        let err = to_csv(&[bad]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn scrape_lines_have_label_format() {
        let lines = to_scrape_lines(&[record("node-1", 42.0)]);
        assert!(lines.contains("agent_cpu_usage_percent{agent_id=\"node-1\"} 42"));
        assert!(lines.contains("agent_health{agent_id=\"node-1\"} 0"));
    }

    #[test]
    fn json_round_trips() {
        let json = to_json(&[record("a", 20.0)]).unwrap();
        let parsed: Vec<ExportRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].agent_id.as_ref(), "a");
    }

    #[test]
    fn record_builds_from_state() {
        let state = AgentHealthState {
            agent_id: AgentId::try_new("a".to_string()).unwrap(),
            overall: HealthLevel::Degraded,
            components: HashMap::new(),
            alerts: vec![],
            last_heartbeat: SystemTime::now(),
            uptime: Duration::from_secs(120),
        };
        let record = ExportRecord::from_state(&state, None);
        assert_eq!(record.uptime_seconds, 120);
        assert_eq!(record.health, HealthLevel::Degraded);
    }
}
