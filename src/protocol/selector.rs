//! Protocol selection and adaptation
//!
//! Suitability per profile is a weighted sum of three dimensions (defaults
//! 0.4/0.3/0.3): network-condition fit, message-characteristic fit, and the
//! historical reward EMA for the `(profile, message-type)` bucket. Adaptation
//! triggers re-score a bucket and, when a different profile wins, new
//! messages use it; in-flight messages keep their profile. Adaptations are
//! rate-limited by a per-bucket cooldown.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use super::conditions::{CongestionLevel, NetworkConditions};
use super::profiles::{ProfileRegistry, ProtocolProfile};
use crate::bus::domain_types::Message;
use crate::domain_types::{EmaAlpha, MessageType, ProtocolId};
use crate::error::CommError;
use crate::time_provider::TimeProvider;

/// Conditions that force a profile re-score for a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AdaptationTrigger {
    /// Observed latency over baseline exceeded the degradation factor
    LatencyDegradation {
        /// observed / baseline
        ratio: f64,
    },
    /// Success rate fell below `baseline - adaptation_threshold`
    SuccessRateDrop {
        /// Current EMA success rate
        observed: f64,
        /// Baseline success rate
        baseline: f64,
    },
    /// Congestion at or above `High`
    Congestion {
        /// Current level
        level: CongestionLevel,
    },
    /// Operator forced a re-score
    OperatorForced,
}

/// Expected performance handed to deadline planning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedPerformance {
    /// Expected round-trip latency
    pub latency_ms: f64,
    /// Expected sustainable throughput
    pub throughput_mbps: f64,
    /// Expected success fraction
    pub reliability: f64,
}

/// The outcome of `pick`
#[derive(Debug, Clone)]
pub struct ProtocolSelection {
    /// Winning profile
    pub profile_id: ProtocolId,
    /// Triggers that fired during this pick
    pub triggers: Vec<AdaptationTrigger>,
    /// Expected performance of the winner
    pub expected: ExpectedPerformance,
}

/// Selector configuration
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Weight of network-condition fit
    pub weight_network: f64,
    /// Weight of message-characteristic fit
    pub weight_message: f64,
    /// Weight of historical performance
    pub weight_history: f64,
    /// Latency ratio over baseline that counts as degradation
    pub latency_degradation_factor: f64,
    /// Success-rate drop below baseline that counts as degradation
    pub adaptation_threshold: f64,
    /// Minimum time between adaptations of one bucket
    pub adaptation_cooldown: Duration,
    /// Smoothing for bucket reward EMAs
    pub ema_alpha: EmaAlpha,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weight_network: 0.4,
            weight_message: 0.3,
            weight_history: 0.3,
            latency_degradation_factor: 1.5,
            adaptation_threshold: 0.1,
            adaptation_cooldown: Duration::from_secs(30),
            ema_alpha: EmaAlpha::default(),
        }
    }
}

/// Per `(profile, message-type)` bucket history
#[derive(Debug, Clone)]
struct BucketHistory {
    reward: f64,
    latency_ms: f64,
    success_rate: f64,
    baseline_latency_ms: f64,
    baseline_success: f64,
    samples: u64,
}

impl BucketHistory {
    fn new() -> Self {
        Self {
            reward: 0.5,
            latency_ms: 0.0,
            success_rate: 1.0,
            baseline_latency_ms: 0.0,
            baseline_success: 1.0,
            samples: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketChoice {
    profile: ProtocolId,
    chosen_at: SystemTime,
}

/// Picks a transport profile per message and adapts per bucket
pub struct ProtocolSelector {
    config: SelectorConfig,
    registry: Arc<ProfileRegistry>,
    history: DashMap<(ProtocolId, MessageType), BucketHistory>,
    choices: DashMap<MessageType, BucketChoice>,
    forced: DashMap<MessageType, ()>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for ProtocolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSelector")
            .field("profiles", &self.registry.len())
            .field("buckets", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl ProtocolSelector {
    /// Creates a selector over a profile registry
    #[must_use]
    pub fn new(
        config: SelectorConfig,
        registry: Arc<ProfileRegistry>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            history: DashMap::new(),
            choices: DashMap::new(),
            forced: DashMap::new(),
            time,
        }
    }

    /// Picks a transport profile for the message under current conditions
    ///
    /// # Errors
    /// `Validation` when the registry is empty or every profile scores zero
    /// (e.g. security required but no encrypting transport registered).
    pub fn pick(
        &self,
        message: &Message,
        conditions: &NetworkConditions,
    ) -> Result<ProtocolSelection, CommError> {
        let profiles = self.registry.all();
        if profiles.is_empty() {
            return Err(CommError::Validation {
                field: "protocol_registry".to_string(),
                reason: "no transport profiles registered".to_string(),
            });
        }

        let triggers = self.active_triggers(&message.message_type, conditions);
        let bucket_key = message.message_type.clone();

        // Without an active trigger, a prior adaptation pins the bucket.
        if triggers.is_empty() {
            if let Some(choice) = self.choices.get(&bucket_key) {
                if let Some(profile) = self.registry.get(&choice.profile) {
                    if self.message_fit(message, &profile) > 0.0 {
                        return Ok(ProtocolSelection {
                            profile_id: choice.profile.clone(),
                            triggers,
                            expected: self.expected(&profile),
                        });
                    }
                }
            }
        }

        let winner = self.best_profile(message, conditions, &profiles)?;
        // The cooldown may keep the bucket on its current profile even when
        // a re-score produced a different winner.
        let effective = self.adopt(&bucket_key, &winner.id, !triggers.is_empty());
        self.forced.remove(&bucket_key);

        let chosen = self.registry.get(&effective).unwrap_or(winner);
        Ok(ProtocolSelection {
            profile_id: effective,
            expected: self.expected(&chosen),
            triggers,
        })
    }

    /// Records a delivery outcome into both the profile EMA and the bucket
    pub fn record_outcome(
        &self,
        profile_id: &ProtocolId,
        message_type: &MessageType,
        success: bool,
        latency_ms: f64,
        payload_bytes: usize,
    ) {
        if let Some(profile) = self.registry.get(profile_id) {
            profile.record_outcome(self.config.ema_alpha, success, latency_ms, payload_bytes);
        }
        let alpha = self.config.ema_alpha.as_f64();
        self.history
            .entry((profile_id.clone(), message_type.clone()))
            .and_modify(|bucket| {
                let success_sample = if success { 1.0 } else { 0.0 };
                bucket.success_rate = alpha * success_sample + (1.0 - alpha) * bucket.success_rate;
                if success {
                    bucket.latency_ms = alpha * latency_ms + (1.0 - alpha) * bucket.latency_ms;
                }
                let normalized_latency = 1.0 + bucket.latency_ms / 100.0;
                bucket.reward = bucket.success_rate * (1.0 / normalized_latency);
                bucket.samples += 1;
                // The first window of samples establishes the baseline.
                if bucket.samples <= 10 {
                    bucket.baseline_latency_ms = bucket.latency_ms;
                    bucket.baseline_success = bucket.success_rate;
                }
            })
            .or_insert_with(|| {
                let mut bucket = BucketHistory::new();
                bucket.success_rate = if success { 1.0 } else { 0.0 };
                bucket.latency_ms = latency_ms;
                bucket.baseline_latency_ms = latency_ms;
                bucket.baseline_success = bucket.success_rate;
                bucket.samples = 1;
                bucket
            });
    }

    /// Header overhead of a profile in bytes, for wire-cost accounting
    #[must_use]
    pub fn header_overhead(&self, profile_id: &ProtocolId) -> usize {
        self.registry
            .get(profile_id)
            .map_or(0, |profile| profile.characteristics.header_overhead_bytes)
    }

    /// Forces a re-score of the bucket on its next pick
    pub fn force_adaptation(&self, message_type: MessageType) {
        info!(%message_type, "operator forced protocol adaptation");
        self.forced.insert(message_type, ());
    }

    fn active_triggers(
        &self,
        message_type: &MessageType,
        conditions: &NetworkConditions,
    ) -> Vec<AdaptationTrigger> {
        let mut triggers = Vec::new();

        if self.forced.contains_key(message_type) {
            triggers.push(AdaptationTrigger::OperatorForced);
        }

        if conditions.congestion >= CongestionLevel::High {
            triggers.push(AdaptationTrigger::Congestion {
                level: conditions.congestion,
            });
        }

        if let Some(choice) = self.choices.get(message_type) {
            if let Some(bucket) = self.history.get(&(choice.profile.clone(), message_type.clone())) {
                if bucket.baseline_latency_ms > 0.0 {
                    let ratio = bucket.latency_ms / bucket.baseline_latency_ms;
                    if ratio > self.config.latency_degradation_factor {
                        triggers.push(AdaptationTrigger::LatencyDegradation { ratio });
                    }
                }
                if bucket.success_rate < bucket.baseline_success - self.config.adaptation_threshold
                {
                    triggers.push(AdaptationTrigger::SuccessRateDrop {
                        observed: bucket.success_rate,
                        baseline: bucket.baseline_success,
                    });
                }
            }
        }

        triggers
    }

    fn best_profile(
        &self,
        message: &Message,
        conditions: &NetworkConditions,
        profiles: &[Arc<ProtocolProfile>],
    ) -> Result<Arc<ProtocolProfile>, CommError> {
        let mut best: Option<(f64, Arc<ProtocolProfile>)> = None;
        for profile in profiles {
            let message_fit = self.message_fit(message, profile);
            if message_fit <= 0.0 {
                continue; // hard requirement unsatisfied
            }
            let network_fit = self.network_fit(conditions, profile);
            let history = self.history_score(&profile.id, &message.message_type);
            let suitability = self.config.weight_network * network_fit
                + self.config.weight_message * message_fit
                + self.config.weight_history * history;
            if best.as_ref().map_or(true, |(score, _)| suitability > *score) {
                best = Some((suitability, Arc::clone(profile)));
            }
        }
        best.map(|(_, profile)| profile)
            .ok_or_else(|| CommError::Validation {
                field: "protocol_selection".to_string(),
                reason: "no transport profile satisfies the message requirements".to_string(),
            })
    }

    /// Quality·stability minus a congestion penalty, floored at zero
    fn network_fit(&self, conditions: &NetworkConditions, profile: &ProtocolProfile) -> f64 {
        let congestion_penalty = match conditions.congestion {
            CongestionLevel::Low => 0.0,
            CongestionLevel::Moderate => 0.15,
            CongestionLevel::High => 0.4,
            CongestionLevel::Critical => 0.7,
        };
        let mut fit = (conditions.quality * conditions.stability - congestion_penalty).max(0.0);
        if conditions.bandwidth_mbps < profile.characteristics.min_bandwidth_mbps {
            fit *= 0.2;
        }
        // Lossy links punish connectionless transports harder.
        if !profile.characteristics.connection_oriented && conditions.packet_loss > 0.01 {
            fit *= 1.0 - conditions.packet_loss.min(0.9);
        }
        fit.clamp(0.0, 1.0)
    }

    /// Payload and capability fit; zero means a hard requirement failed
    fn message_fit(&self, message: &Message, profile: &ProtocolProfile) -> f64 {
        let hints = message.hints_or_default();
        let chars = &profile.characteristics;

        let security_needed = hints.security_required
            || message
                .governance
                .as_ref()
                .is_some_and(|g| g.audit_required);
        if security_needed && !chars.native_encryption {
            return 0.0;
        }
        if hints.streaming_required && !chars.streaming {
            return 0.0;
        }

        let mut fit: f64 = 0.5;
        let size = message.payload.len();
        if size >= chars.ideal_payload_min && size <= chars.ideal_payload_max {
            fit += 0.25;
        } else if size > chars.ideal_payload_max {
            let overshoot = size as f64 / chars.ideal_payload_max.max(1) as f64;
            fit -= (overshoot / 10.0).min(0.4);
        }
        if hints.response_required {
            fit += if chars.bidirectional { 0.15 } else { -0.35 };
        }
        if hints.latency_sensitive && chars.setup_time_ms > 5.0 {
            fit -= 0.1;
        }
        fit.clamp(0.0, 1.0)
    }

    /// Historical reward EMA for the bucket, defaulting to 0.5
    fn history_score(&self, profile_id: &ProtocolId, message_type: &MessageType) -> f64 {
        self.history
            .get(&(profile_id.clone(), message_type.clone()))
            .map_or(0.5, |bucket| bucket.reward)
    }

    fn expected(&self, profile: &ProtocolProfile) -> ExpectedPerformance {
        let perf = profile.performance();
        ExpectedPerformance {
            latency_ms: perf.avg_latency_ms,
            throughput_mbps: perf.throughput_mbps,
            reliability: perf.success_rate,
        }
    }

    /// Applies the rate limit and returns the profile the bucket now uses
    fn adopt(&self, bucket: &MessageType, winner: &ProtocolId, triggered: bool) -> ProtocolId {
        let now = self.time.now();
        match self.choices.get_mut(bucket) {
            Some(mut choice) if choice.profile != *winner => {
                // Rate-limit: a triggered switch within cooldown keeps the
                // current profile.
                let elapsed = now
                    .duration_since(choice.chosen_at)
                    .unwrap_or(Duration::ZERO);
                if !triggered || elapsed >= self.config.adaptation_cooldown {
                    debug!(bucket = %bucket, from = %choice.profile, to = %winner, "protocol adaptation");
                    choice.profile = winner.clone();
                    choice.chosen_at = now;
                }
                choice.profile.clone()
            }
            Some(choice) => choice.profile.clone(),
            None => {
                self.choices.insert(
                    bucket.clone(),
                    BucketChoice {
                        profile: winner.clone(),
                        chosen_at: now,
                    },
                );
                winner.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::domain_types::{MessagePriority, PayloadEnvelope, RoutingHints};
    use crate::domain_types::{AgentId, MessageId, RetryPolicy};
    use crate::time_provider::MockTimeProvider;
    use bytes::Bytes;

    fn selector() -> ProtocolSelector {
        ProtocolSelector::new(
            SelectorConfig::default(),
            Arc::new(ProfileRegistry::with_builtins()),
            Arc::new(MockTimeProvider::new()),
        )
    }

    fn message(size: usize, hints: RoutingHints) -> Message {
        Message {
            id: MessageId::try_new(format!("m-{size}")).unwrap(),
            message_type: MessageType::try_new("telemetry".to_string()).unwrap(),
            priority: MessagePriority::Normal,
            source: AgentId::try_new("s".to_string()).unwrap(),
            destinations: vec![],
            payload: PayloadEnvelope::opaque(Bytes::from(vec![0u8; size])),
            hints: Some(hints),
            correlation_id: None,
            deadline: SystemTime::now() + Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            governance: None,
        }
    }

    #[test]
    fn security_requirement_forces_encrypting_transport() {
        let selector = selector();
        let conditions = NetworkConditions::nominal(SystemTime::now());
        let msg = message(
            1024,
            RoutingHints {
                security_required: true,
                ..RoutingHints::default()
            },
        );
        let selection = selector.pick(&msg, &conditions).unwrap();
        assert_eq!(selection.profile_id.as_ref(), "encrypted-stream");
    }

    #[test]
    fn streaming_requirement_excludes_datagram() {
        let selector = selector();
        let conditions = NetworkConditions::nominal(SystemTime::now());
        let msg = message(
            1024 * 1024,
            RoutingHints {
                streaming_required: true,
                ..RoutingHints::default()
            },
        );
        let selection = selector.pick(&msg, &conditions).unwrap();
        assert_ne!(selection.profile_id.as_ref(), "datagram");
    }

    #[test]
    fn congestion_raises_a_trigger() {
        let selector = selector();
        let msg = message(1024, RoutingHints::default());
        let mut conditions = NetworkConditions::nominal(SystemTime::now());
        // Establish a bucket choice first.
        selector.pick(&msg, &conditions).unwrap();
        conditions.congestion = CongestionLevel::High;
        let selection = selector.pick(&msg, &conditions).unwrap();
        assert!(selection
            .triggers
            .iter()
            .any(|t| matches!(t, AdaptationTrigger::Congestion { .. })));
    }

    #[test]
    fn degraded_bucket_switches_after_cooldown() {
        let clock = Arc::new(MockTimeProvider::new());
        let selector = ProtocolSelector::new(
            SelectorConfig {
                adaptation_cooldown: Duration::from_secs(1),
                ..SelectorConfig::default()
            },
            Arc::new(ProfileRegistry::with_builtins()),
            Arc::clone(&clock) as Arc<dyn TimeProvider>,
        );
        let conditions = NetworkConditions::nominal(SystemTime::now());
        let msg = message(1024, RoutingHints::default());

        let first = selector.pick(&msg, &conditions).unwrap();
        // Build a baseline, then degrade the chosen bucket hard.
        for _ in 0..10 {
            selector.record_outcome(&first.profile_id, &msg.message_type, true, 5.0, 1024);
        }
        for _ in 0..30 {
            selector.record_outcome(&first.profile_id, &msg.message_type, false, 500.0, 1024);
        }
        clock.advance(Duration::from_secs(5));
        let second = selector.pick(&msg, &conditions).unwrap();
        assert!(!second.triggers.is_empty());
        assert_ne!(second.profile_id, first.profile_id);
    }

    #[test]
    fn forced_adaptation_fires_once() {
        let selector = selector();
        let conditions = NetworkConditions::nominal(SystemTime::now());
        let msg = message(1024, RoutingHints::default());
        selector.force_adaptation(msg.message_type.clone());
        let selection = selector.pick(&msg, &conditions).unwrap();
        assert!(selection
            .triggers
            .contains(&AdaptationTrigger::OperatorForced));
        let again = selector.pick(&msg, &conditions).unwrap();
        assert!(!again.triggers.contains(&AdaptationTrigger::OperatorForced));
    }
}
