//! Anomaly detection
//!
//! Detectors are black boxes exposing `score(sample, history)`; the core
//! ships a statistical outlier detector and a changepoint detector, plus a
//! weighted ensemble combiner. Sensitivity is time-adaptive: a configurable
//! multiplier applies during business hours.

use std::sync::Arc;

use crate::time_provider::TimeProvider;

/// Verdict produced by a detector
#[derive(Debug, Clone)]
pub struct AnomalyVerdict {
    /// Whether the sample is anomalous
    pub is_anomaly: bool,
    /// Anomaly score in `[0, 1]`
    pub score: f64,
    /// Expected value the sample was compared against
    pub expected: f64,
    /// Human-readable explanation
    pub explanation: String,
}

impl AnomalyVerdict {
    fn normal(expected: f64, explanation: &str) -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            expected,
            explanation: explanation.to_string(),
        }
    }
}

/// A pluggable anomaly detection algorithm
pub trait AnomalyDetector: Send + Sync {
    /// Stable name for configuration and ensemble weighting
    fn name(&self) -> &'static str;

    /// Scores a sample against its history
    fn score(&self, sample: f64, history: &[f64]) -> AnomalyVerdict;
}

/// Z-score outlier detector
///
/// Sensitivity in `[0, 1]` maps inversely to the z threshold: higher
/// sensitivity flags smaller deviations.
pub struct StatisticalOutlierDetector {
    sensitivity: f64,
    min_data_points: usize,
}

impl StatisticalOutlierDetector {
    /// Creates a detector with the given sensitivity and minimum history
    #[must_use]
    pub fn new(sensitivity: f64, min_data_points: usize) -> Self {
        Self {
            sensitivity: sensitivity.clamp(0.0, 1.0),
            min_data_points: min_data_points.max(2),
        }
    }

    fn z_threshold(&self) -> f64 {
        // sensitivity 1.0 -> 2.0, sensitivity 0.0 -> 6.0
        6.0 - 4.0 * self.sensitivity
    }
}

impl AnomalyDetector for StatisticalOutlierDetector {
    fn name(&self) -> &'static str {
        "statistical_outlier"
    }

    fn score(&self, sample: f64, history: &[f64]) -> AnomalyVerdict {
        if history.len() < self.min_data_points {
            return AnomalyVerdict::normal(sample, "insufficient history");
        }
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let variance =
            history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / history.len() as f64;
        let std_dev = variance.sqrt().max(f64::EPSILON);
        let z = (sample - mean).abs() / std_dev;
        let threshold = self.z_threshold();
        let score = (z / (threshold * 2.0)).min(1.0);
        AnomalyVerdict {
            is_anomaly: z > threshold,
            score,
            expected: mean,
            explanation: format!(
                "z-score {z:.2} against mean {mean:.2} (threshold {threshold:.2})"
            ),
        }
    }
}

/// Mean-shift changepoint detector
///
/// Compares the means of the older and newer halves of the window (with the
/// sample appended) relative to the pooled standard deviation.
pub struct ChangepointDetector {
    min_data_points: usize,
    shift_threshold: f64,
}

impl ChangepointDetector {
    /// Creates a detector; `shift_threshold` is in pooled-sigma units
    #[must_use]
    pub fn new(min_data_points: usize, shift_threshold: f64) -> Self {
        Self {
            min_data_points: min_data_points.max(4),
            shift_threshold,
        }
    }
}

impl AnomalyDetector for ChangepointDetector {
    fn name(&self) -> &'static str {
        "changepoint"
    }

    fn score(&self, sample: f64, history: &[f64]) -> AnomalyVerdict {
        if history.len() < self.min_data_points {
            return AnomalyVerdict::normal(sample, "insufficient history");
        }
        let mut series: Vec<f64> = history.to_vec();
        series.push(sample);
        let half = series.len() / 2;
        let older = &series[..half];
        let newer = &series[half..];
        let mean =
            |values: &[f64]| values.iter().sum::<f64>() / values.len().max(1) as f64;
        let older_mean = mean(older);
        let newer_mean = mean(newer);
        let pooled_variance = series
            .iter()
            .map(|v| (v - mean(&series)).powi(2))
            .sum::<f64>()
            / series.len() as f64;
        let pooled_std = pooled_variance.sqrt().max(f64::EPSILON);
        let shift = (newer_mean - older_mean).abs() / pooled_std;
        AnomalyVerdict {
            is_anomaly: shift > self.shift_threshold,
            score: (shift / (self.shift_threshold * 2.0)).min(1.0),
            expected: older_mean,
            explanation: format!(
                "mean shift {shift:.2} sigma between window halves"
            ),
        }
    }
}

/// Weighted ensemble over multiple detectors
///
/// The combined score is the weight-normalized mean; a combined score above
/// 0.5 is anomalous.
pub struct EnsembleDetector {
    members: Vec<(Arc<dyn AnomalyDetector>, f64)>,
    business_hours_multiplier: f64,
    time: Arc<dyn TimeProvider>,
}

impl EnsembleDetector {
    /// Creates an ensemble; weights need not sum to one
    #[must_use]
    pub fn new(
        members: Vec<(Arc<dyn AnomalyDetector>, f64)>,
        business_hours_multiplier: f64,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            members,
            business_hours_multiplier,
            time,
        }
    }

    /// UTC hour of day, for time-adaptive sensitivity
    fn hour_of_day(&self) -> u64 {
        (self.time.epoch_millis() / 1000 / 3600) % 24
    }

    fn time_multiplier(&self) -> f64 {
        let hour = self.hour_of_day();
        if (9..17).contains(&hour) {
            self.business_hours_multiplier
        } else {
            1.0
        }
    }
}

impl AnomalyDetector for EnsembleDetector {
    fn name(&self) -> &'static str {
        "ensemble"
    }

    fn score(&self, sample: f64, history: &[f64]) -> AnomalyVerdict {
        if self.members.is_empty() {
            return AnomalyVerdict::normal(sample, "no detectors configured");
        }
        let mut total_weight = 0.0;
        let mut weighted_score = 0.0;
        let mut expected = sample;
        let mut explanations = Vec::new();
        for (detector, weight) in &self.members {
            let verdict = detector.score(sample, history);
            total_weight += weight;
            weighted_score += verdict.score * weight;
            if verdict.is_anomaly {
                explanations.push(format!("{}: {}", detector.name(), verdict.explanation));
            }
            expected = verdict.expected;
        }
        let combined =
            (weighted_score / total_weight.max(f64::EPSILON)) * self.time_multiplier();
        AnomalyVerdict {
            is_anomaly: combined > 0.5,
            score: combined.min(1.0),
            expected,
            explanation: if explanations.is_empty() {
                "within expected range".to_string()
            } else {
                explanations.join("; ")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::MockTimeProvider;

    #[test]
    fn spike_is_flagged_against_stable_history() {
        let detector = StatisticalOutlierDetector::new(0.95, 4);
        let history = [30.0, 32.0, 31.0, 33.0];
        let verdict = detector.score(97.0, &history);
        assert!(verdict.is_anomaly);
        assert!((verdict.expected - 31.5).abs() < 1.0);
        assert!(verdict.score > 0.5);
    }

    #[test]
    fn normal_sample_passes() {
        let detector = StatisticalOutlierDetector::new(0.95, 4);
        let history = [30.0, 32.0, 31.0, 33.0];
        let verdict = detector.score(32.5, &history);
        assert!(!verdict.is_anomaly);
    }

    #[test]
    fn short_history_is_never_anomalous() {
        let detector = StatisticalOutlierDetector::new(0.95, 4);
        let verdict = detector.score(1_000.0, &[1.0, 2.0]);
        assert!(!verdict.is_anomaly);
    }

    #[test]
    fn changepoint_detects_level_shift() {
        let detector = ChangepointDetector::new(6, 1.0);
        let history = [10.0, 10.5, 9.8, 10.2, 50.0, 51.0, 49.5];
        let verdict = detector.score(50.5, &history);
        assert!(verdict.is_anomaly);
    }

    #[test]
    fn ensemble_combines_weighted_scores() {
        let ensemble = EnsembleDetector::new(
            vec![
                (
                    Arc::new(StatisticalOutlierDetector::new(0.95, 4)) as Arc<dyn AnomalyDetector>,
                    0.7,
                ),
                (
                    Arc::new(ChangepointDetector::new(4, 1.5)) as Arc<dyn AnomalyDetector>,
                    0.3,
                ),
            ],
            1.0,
            Arc::new(MockTimeProvider::new()),
        );
        let history = [30.0, 32.0, 31.0, 33.0];
        let verdict = ensemble.score(97.0, &history);
        assert!(verdict.is_anomaly);
    }
}
