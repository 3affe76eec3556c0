//! Quality aggregation: weighted totals, classification and per-axis pass/fail.
//!
//! The weighted total works on the judge's 0–100 scale. The per-axis
//! remediation check works on the normalized 0–1 scale and is evaluated
//! independently of the total.

use serde::{Deserialize, Serialize};

/// One of the five quality dimensions scored per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Read,
    Sentence,
    Noise,
    Table,
    Figure,
}

impl Axis {
    pub const ALL: [Axis; 5] = [
        Axis::Read,
        Axis::Sentence,
        Axis::Noise,
        Axis::Table,
        Axis::Figure,
    ];

    /// Axes with a binary pass/fail threshold that can trigger remediation.
    pub const BINARY: [Axis; 4] = [Axis::Read, Axis::Sentence, Axis::Noise, Axis::Table];

    /// Short column name used in reports (`S_read`, `S_sent`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Axis::Read => "read",
            Axis::Sentence => "sent",
            Axis::Noise => "noise",
            Axis::Table => "table",
            Axis::Figure => "fig",
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Judge sub-scores on the 0–100 scale. `None` means the axis is structurally
/// absent for the page (e.g. no figures).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub read: Option<f64>,
    pub sent: Option<f64>,
    pub noise: Option<f64>,
    pub table: Option<f64>,
    pub fig: Option<f64>,
}

impl SubScores {
    /// All five axes present.
    pub fn full(read: f64, sent: f64, noise: f64, table: f64, fig: f64) -> Self {
        Self {
            read: Some(read),
            sent: Some(sent),
            noise: Some(noise),
            table: Some(table),
            fig: Some(fig),
        }
    }

    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::Read => self.read,
            Axis::Sentence => self.sent,
            Axis::Noise => self.noise,
            Axis::Table => self.table,
            Axis::Figure => self.fig,
        }
    }

    /// Axis score on the [0, 1] scale.
    pub fn normalized(&self, axis: Axis) -> Option<f64> {
        self.get(axis).map(|s| s / 100.0)
    }
}

/// Weight of each axis in the total. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub read: f64,
    pub sent: f64,
    pub noise: f64,
    pub table: f64,
    pub fig: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            read: 0.25,
            sent: 0.25,
            noise: 0.15,
            table: 0.25,
            fig: 0.10,
        }
    }
}

impl QualityWeights {
    pub fn weight(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Read => self.read,
            Axis::Sentence => self.sent,
            Axis::Noise => self.noise,
            Axis::Table => self.table,
            Axis::Figure => self.fig,
        }
    }

    pub fn sum(&self) -> f64 {
        Axis::ALL.iter().map(|a| self.weight(*a)).sum()
    }
}

/// Total-score classification thresholds (0–100 scale, inclusive lower bounds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub pass: f64,
    pub borderline: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            pass: 85.0,
            borderline: 70.0,
        }
    }
}

/// Per-axis remediation thresholds on the normalized scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisThresholds {
    pub read: f64,
    pub sent: f64,
    pub noise: f64,
    pub table: f64,
}

impl Default for AxisThresholds {
    fn default() -> Self {
        Self {
            read: 0.5,
            sent: 0.5,
            noise: 0.5,
            table: 0.5,
        }
    }
}

impl AxisThresholds {
    /// Threshold for a binary axis; the figure axis has none.
    pub fn threshold(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::Read => Some(self.read),
            Axis::Sentence => Some(self.sent),
            Axis::Noise => Some(self.noise),
            Axis::Table => Some(self.table),
            Axis::Figure => None,
        }
    }
}

/// How an absent sub-score enters the weighted total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAxisPolicy {
    /// Drop the axis and rescale the remaining weights to sum to 1.
    #[default]
    Renormalize,
    /// Score the axis as 100.
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Pass,
    Borderline,
    NeedsImprovement,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Pass => "pass",
            Classification::Borderline => "borderline",
            Classification::NeedsImprovement => "needs_improvement",
        }
    }
}

/// Weighted total and its classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub total: f64,
    pub classification: Classification,
}

/// Pure scoring function over [`SubScores`]. Holds no mutable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityAggregator {
    pub weights: QualityWeights,
    pub thresholds: ScoreThresholds,
    pub axis_thresholds: AxisThresholds,
    pub missing_axis_policy: MissingAxisPolicy,
}

impl QualityAggregator {
    pub fn new(
        weights: QualityWeights,
        thresholds: ScoreThresholds,
        axis_thresholds: AxisThresholds,
        missing_axis_policy: MissingAxisPolicy,
    ) -> Self {
        Self {
            weights,
            thresholds,
            axis_thresholds,
            missing_axis_policy,
        }
    }

    pub fn aggregate(&self, scores: &SubScores) -> Aggregate {
        let total = self.total(scores);
        Aggregate {
            total,
            classification: self.classify(total),
        }
    }

    /// Weighted total on the 0–100 scale.
    pub fn total(&self, scores: &SubScores) -> f64 {
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        for axis in Axis::ALL {
            let w = self.weights.weight(axis);
            let value = match (scores.get(axis), self.missing_axis_policy) {
                (Some(v), _) => v,
                (None, MissingAxisPolicy::Neutral) => 100.0,
                (None, MissingAxisPolicy::Renormalize) => continue,
            };
            sum += w * value;
            weight_sum += w;
        }
        if weight_sum <= 0.0 {
            return 0.0;
        }
        match self.missing_axis_policy {
            MissingAxisPolicy::Renormalize => sum / weight_sum,
            MissingAxisPolicy::Neutral => sum,
        }
    }

    pub fn classify(&self, total: f64) -> Classification {
        if total >= self.thresholds.pass {
            Classification::Pass
        } else if total >= self.thresholds.borderline {
            Classification::Borderline
        } else {
            Classification::NeedsImprovement
        }
    }

    /// Binary axes whose normalized score is below threshold. An absent axis
    /// never fails.
    pub fn failing_axes(&self, scores: &SubScores) -> Vec<Axis> {
        Axis::BINARY
            .into_iter()
            .filter(|axis| self.axis_fails(scores, *axis))
            .collect()
    }

    pub fn axis_fails(&self, scores: &SubScores, axis: Axis) -> bool {
        match (
            scores.normalized(axis),
            self.axis_thresholds.threshold(axis),
        ) {
            (Some(score), Some(threshold)) => score < threshold,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg() -> QualityAggregator {
        QualityAggregator::default()
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((QualityWeights::default().sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_total_matches_hand_computation() {
        let scores = SubScores::full(90.0, 88.0, 95.0, 40.0, 80.0);
        let a = agg().aggregate(&scores);
        assert!((a.total - 76.75).abs() < 1e-9);
        assert_eq!(a.classification, Classification::Borderline);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let scores = SubScores::full(71.3, 64.2, 88.8, 12.5, 99.0);
        let first = agg().aggregate(&scores);
        for _ in 0..10 {
            assert_eq!(agg().aggregate(&scores), first);
        }
    }

    #[test]
    fn classification_boundaries() {
        let a = agg();
        assert_eq!(a.classify(85.0), Classification::Pass);
        assert_eq!(a.classify(84.999), Classification::Borderline);
        assert_eq!(a.classify(70.0), Classification::Borderline);
        assert_eq!(a.classify(69.999), Classification::NeedsImprovement);
    }

    #[test]
    fn thresholds_come_from_configuration() {
        let a = QualityAggregator {
            thresholds: ScoreThresholds {
                pass: 60.0,
                borderline: 40.0,
            },
            ..Default::default()
        };
        assert_eq!(a.classify(60.0), Classification::Pass);
        assert_eq!(a.classify(45.0), Classification::Borderline);
    }

    #[test]
    fn missing_figure_renormalizes() {
        let scores = SubScores {
            fig: None,
            ..SubScores::full(80.0, 80.0, 80.0, 80.0, 0.0)
        };
        let total = agg().total(&scores);
        assert!((total - 80.0).abs() < 1e-9);
    }

    #[test]
    fn missing_figure_neutral_counts_as_full_marks() {
        let a = QualityAggregator {
            missing_axis_policy: MissingAxisPolicy::Neutral,
            ..Default::default()
        };
        let scores = SubScores {
            fig: None,
            ..SubScores::full(80.0, 80.0, 80.0, 80.0, 0.0)
        };
        // 0.9 * 80 + 0.1 * 100
        assert!((a.total(&scores) - 82.0).abs() < 1e-9);
    }

    #[test]
    fn all_axes_missing_scores_zero() {
        let a = agg().aggregate(&SubScores::default());
        assert_eq!(a.total, 0.0);
        assert_eq!(a.classification, Classification::NeedsImprovement);
    }

    #[test]
    fn failing_axes_use_normalized_threshold() {
        let scores = SubScores::full(90.0, 88.0, 95.0, 40.0, 10.0);
        // Figure is never a remediation axis, even at 10.
        assert_eq!(agg().failing_axes(&scores), vec![Axis::Table]);

        let at_threshold = SubScores::full(50.0, 50.0, 50.0, 50.0, 50.0);
        assert!(agg().failing_axes(&at_threshold).is_empty());
    }

    #[test]
    fn axis_check_is_independent_of_total() {
        // A passing total can still carry a failing axis.
        let scores = SubScores::full(100.0, 100.0, 100.0, 45.0, 100.0);
        let a = agg().aggregate(&scores);
        assert!((a.total - 86.25).abs() < 1e-9);
        assert_eq!(a.classification, Classification::Pass);
        assert_eq!(agg().failing_axes(&scores), vec![Axis::Table]);
    }

    #[test]
    fn absent_axis_never_fails() {
        let scores = SubScores {
            table: None,
            ..SubScores::full(90.0, 90.0, 90.0, 0.0, 90.0)
        };
        assert!(agg().failing_axes(&scores).is_empty());
    }
}
