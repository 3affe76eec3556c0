//! Strategy selection: rank (strategy, fallback state) candidates and pick one.
//!
//! `S_total = score_weight * quality / 100 + speed_weight * speed`, where speed
//! is the fastest candidate's time divided by this candidate's time. Only
//! candidates passing every binary axis are ranked unless none do, in which
//! case the best failing candidate wins and is flagged below threshold.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::fallback::{Baseline, FallbackAction};
use crate::quality::{Axis, Classification, QualityAggregator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub score_weight: f64,
    pub speed_weight: f64,
    /// S_total differences below this are ties.
    pub epsilon: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            score_weight: 0.8,
            speed_weight: 0.2,
            epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackState {
    Original,
    Remediated { actions: Vec<FallbackAction> },
}

impl FallbackState {
    pub fn label(&self) -> String {
        match self {
            FallbackState::Original => "original".to_string(),
            FallbackState::Remediated { actions } => {
                let names: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
                format!("remediated({})", names.join("+"))
            }
        }
    }
}

/// One (strategy, fallback state) pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCandidate {
    pub strategy: String,
    pub fallback_state: FallbackState,
    /// Mean weighted total over scored pages (0–100).
    pub quality_score: f64,
    pub classification: Classification,
    /// Mean sub-score per axis over scored pages carrying that axis.
    pub axis_means: BTreeMap<Axis, f64>,
    pub total_cost_usd: f64,
    pub total_time_ms: f64,
    pub scored_pages: usize,
    pub unscored_pages: usize,
    /// Binary axes still failing on at least one page.
    pub failing_axes: Vec<Axis>,
    /// An original candidate whose strategy also has a remediated candidate.
    /// Listed for audit, never ranked.
    pub superseded: bool,
}

impl SelectionCandidate {
    /// Summarise a baseline as a candidate.
    pub fn from_baseline(
        baseline: &Baseline,
        fallback_state: FallbackState,
        aggregator: &QualityAggregator,
        total_cost_usd: f64,
        total_time_ms: f64,
    ) -> Self {
        let scores: Vec<_> = baseline.pages().filter_map(|p| p.score.as_ref()).collect();
        let scored_pages = scores.len();
        let unscored_pages = baseline.pages().count() - scored_pages;

        let quality_score = if scored_pages == 0 {
            0.0
        } else {
            scores.iter().map(|s| s.total).sum::<f64>() / scored_pages as f64
        };

        let mut axis_means = BTreeMap::new();
        for axis in Axis::ALL {
            let values: Vec<f64> = scores.iter().filter_map(|s| s.sub_scores.get(axis)).collect();
            if !values.is_empty() {
                axis_means.insert(axis, values.iter().sum::<f64>() / values.len() as f64);
            }
        }

        let failing_axes = Axis::BINARY
            .into_iter()
            .filter(|a| scores.iter().any(|s| s.failing_axes.contains(a)))
            .collect();

        Self {
            strategy: baseline.strategy.clone(),
            fallback_state,
            quality_score,
            classification: aggregator.classify(quality_score),
            axis_means,
            total_cost_usd,
            total_time_ms,
            scored_pages,
            unscored_pages,
            failing_axes,
            superseded: false,
        }
    }

    /// Display id, e.g. `upstage_ocr` or `upstage_ocr+fallback`.
    pub fn id(&self) -> String {
        match self.fallback_state {
            FallbackState::Original => self.strategy.clone(),
            FallbackState::Remediated { .. } => format!("{}+fallback", self.strategy),
        }
    }

    /// Passes every binary axis on a non-empty set of scored pages.
    pub fn passes(&self) -> bool {
        self.scored_pages > 0 && self.failing_axes.is_empty()
    }
}

/// A candidate with its ranking inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: SelectionCandidate,
    pub normalized_quality: f64,
    pub normalized_speed: f64,
    pub s_total: f64,
    pub eligible: bool,
    /// 1-based rank; `None` for superseded candidates.
    pub rank: Option<usize>,
}

/// The terminal artifact of the strategy pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSelection {
    pub strategy: String,
    pub fallback_state: FallbackState,
    pub candidate: SelectionCandidate,
    pub s_total: f64,
    pub normalized_quality: f64,
    pub normalized_speed: f64,
    /// Every candidate failed an axis; this is the best effort.
    pub below_threshold: bool,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub selection: FinalSelection,
    /// Winner first, then the remaining candidates by S_total.
    pub table: Vec<RankedCandidate>,
}

pub struct StrategySelector {
    config: SelectionConfig,
}

impl StrategySelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Mark original candidates superseded by a remediated sibling.
    pub fn mark_superseded(candidates: &mut [SelectionCandidate]) {
        let remediated: Vec<String> = candidates
            .iter()
            .filter(|c| matches!(c.fallback_state, FallbackState::Remediated { .. }))
            .map(|c| c.strategy.clone())
            .collect();
        for c in candidates.iter_mut() {
            c.superseded =
                c.fallback_state == FallbackState::Original && remediated.contains(&c.strategy);
        }
    }

    pub fn select(&self, candidates: Vec<SelectionCandidate>) -> Result<SelectionOutcome, CoreError> {
        let fastest = candidates
            .iter()
            .filter(|c| !c.superseded && c.total_time_ms > 0.0)
            .map(|c| c.total_time_ms)
            .min_by(f64::total_cmp);

        let mut table: Vec<RankedCandidate> = candidates
            .into_iter()
            .map(|candidate| {
                let normalized_quality = candidate.quality_score / 100.0;
                let normalized_speed = match fastest {
                    Some(f) if candidate.total_time_ms > 0.0 => f / candidate.total_time_ms,
                    _ => 1.0,
                };
                RankedCandidate {
                    s_total: self.config.score_weight * normalized_quality
                        + self.config.speed_weight * normalized_speed,
                    eligible: !candidate.superseded && candidate.passes(),
                    normalized_quality,
                    normalized_speed,
                    candidate,
                    rank: None,
                }
            })
            .collect();

        let active: Vec<usize> = (0..table.len())
            .filter(|i| !table[*i].candidate.superseded)
            .collect();
        if active.is_empty() {
            return Err(CoreError::NoCandidates);
        }

        let eligible: Vec<usize> = active.iter().copied().filter(|i| table[*i].eligible).collect();
        let below_threshold = eligible.is_empty();
        let pool = if !below_threshold {
            eligible.clone()
        } else {
            let scored: Vec<usize> = active
                .iter()
                .copied()
                .filter(|i| table[*i].candidate.scored_pages > 0)
                .collect();
            if scored.is_empty() { active.clone() } else { scored }
        };

        let best = pool
            .iter()
            .map(|i| table[*i].s_total)
            .max_by(f64::total_cmp)
            .unwrap_or(0.0);
        let tied: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|i| best - table[*i].s_total < self.config.epsilon)
            .collect();
        let winner = tied
            .iter()
            .copied()
            .min_by(|a, b| tie_break(&table[*a], &table[*b]))
            .ok_or(CoreError::NoCandidates)?;

        // Ranked order: winner, then the rest by S_total, superseded last.
        let mut order: Vec<usize> = active.iter().copied().filter(|i| *i != winner).collect();
        order.sort_by(|a, b| {
            table[*b]
                .s_total
                .total_cmp(&table[*a].s_total)
                .then_with(|| tie_break(&table[*a], &table[*b]))
        });
        order.insert(0, winner);
        for (rank, idx) in order.iter().enumerate() {
            table[*idx].rank = Some(rank + 1);
        }
        let mut superseded: Vec<usize> = (0..table.len())
            .filter(|i| table[*i].candidate.superseded)
            .collect();
        superseded.sort_by(|a, b| tie_break(&table[*a], &table[*b]));
        order.extend(superseded);

        let won = table[winner].clone();
        let justification = justify(&won, eligible.len(), active.len(), tied.len(), below_threshold);
        tracing::info!(
            winner = %won.candidate.id(),
            s_total = won.s_total,
            below_threshold,
            "strategy selected"
        );

        let mut slots: Vec<Option<RankedCandidate>> = table.into_iter().map(Some).collect();
        let table = order.into_iter().filter_map(|i| slots[i].take()).collect();

        Ok(SelectionOutcome {
            selection: FinalSelection {
                strategy: won.candidate.strategy.clone(),
                fallback_state: won.candidate.fallback_state.clone(),
                s_total: won.s_total,
                normalized_quality: won.normalized_quality,
                normalized_speed: won.normalized_speed,
                candidate: won.candidate,
                below_threshold,
                justification,
            },
            table,
        })
    }
}

/// Lower cost, then lower time, then lexicographically smaller id.
fn tie_break(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    a.candidate
        .total_cost_usd
        .total_cmp(&b.candidate.total_cost_usd)
        .then(a.candidate.total_time_ms.total_cmp(&b.candidate.total_time_ms))
        .then_with(|| a.candidate.strategy.cmp(&b.candidate.strategy))
        .then_with(|| a.candidate.fallback_state.cmp(&b.candidate.fallback_state))
}

fn justify(
    won: &RankedCandidate,
    eligible: usize,
    active: usize,
    tied: usize,
    below_threshold: bool,
) -> String {
    let mut text = format!(
        "{} selected with S_total {:.4} (quality {:.2}/100, speed {:.3}); {} of {} candidates passed every axis",
        won.candidate.id(),
        won.s_total,
        won.candidate.quality_score,
        won.normalized_speed,
        eligible,
        active
    );
    if tied > 1 {
        text.push_str(&format!("; tie among {tied} broken by cost, time, then strategy id"));
    }
    if below_threshold {
        text.push_str("; best effort, below threshold");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(strategy: &str, quality: f64, cost: f64, time: f64, failing: Vec<Axis>) -> SelectionCandidate {
        SelectionCandidate {
            strategy: strategy.to_string(),
            fallback_state: FallbackState::Original,
            quality_score: quality,
            classification: QualityAggregator::default().classify(quality),
            axis_means: BTreeMap::new(),
            total_cost_usd: cost,
            total_time_ms: time,
            scored_pages: 1,
            unscored_pages: 0,
            failing_axes: failing,
            superseded: false,
        }
    }

    fn selector() -> StrategySelector {
        StrategySelector::new(SelectionConfig::default())
    }

    #[test]
    fn passing_candidate_beats_higher_scoring_failures() {
        let out = selector()
            .select(vec![
                candidate("a", 95.0, 0.0, 100.0, vec![Axis::Table]),
                candidate("b", 60.0, 0.0, 500.0, vec![]),
                candidate("c", 90.0, 0.0, 100.0, vec![Axis::Read]),
            ])
            .unwrap();
        assert_eq!(out.selection.strategy, "b");
        assert!(!out.selection.below_threshold);
        assert_eq!(out.table[0].candidate.strategy, "b");
        assert_eq!(out.table.len(), 3);
    }

    #[test]
    fn all_failing_picks_best_effort() {
        let out = selector()
            .select(vec![
                candidate("a", 60.0, 0.0, 100.0, vec![Axis::Table]),
                candidate("b", 80.0, 0.0, 100.0, vec![Axis::Read]),
            ])
            .unwrap();
        assert_eq!(out.selection.strategy, "b");
        assert!(out.selection.below_threshold);
        assert!(out.selection.justification.contains("best effort"));
    }

    #[test]
    fn tie_prefers_lower_cost_then_time_then_id() {
        // Same S_total: equal quality, both the fastest.
        let out = selector()
            .select(vec![
                candidate("b", 80.0, 0.01, 100.0, vec![]),
                candidate("a", 80.0, 0.02, 100.0, vec![]),
            ])
            .unwrap();
        assert_eq!(out.selection.strategy, "b");

        let out = selector()
            .select(vec![
                candidate("zeta", 80.0, 0.0, 0.0, vec![]),
                candidate("alpha", 80.0, 0.0, 0.0, vec![]),
            ])
            .unwrap();
        assert_eq!(out.selection.strategy, "alpha");
    }

    #[test]
    fn equal_cost_tie_goes_to_the_faster_candidate() {
        // "a" trades 12.5 quality points for half the speed: both S_total 0.84.
        let out = selector()
            .select(vec![
                candidate("a", 92.5, 0.01, 200.0, vec![]),
                candidate("b", 80.0, 0.01, 100.0, vec![]),
            ])
            .unwrap();
        assert!((out.table[0].s_total - out.table[1].s_total).abs() < 1e-6);
        assert_eq!(out.selection.strategy, "b");
    }

    #[test]
    fn differences_below_epsilon_are_ties() {
        // 1e-6 quality points is 8e-9 of S_total.
        let out = selector()
            .select(vec![
                candidate("a", 80.000001, 0.02, 0.0, vec![]),
                candidate("b", 80.0, 0.01, 0.0, vec![]),
            ])
            .unwrap();
        assert_eq!(out.selection.strategy, "b");
        assert!(out.selection.justification.contains("tie among 2"));
    }

    #[test]
    fn speed_is_relative_to_fastest() {
        let out = selector()
            .select(vec![
                candidate("fast", 70.0, 0.0, 100.0, vec![]),
                candidate("slow", 70.0, 0.0, 400.0, vec![]),
            ])
            .unwrap();
        let slow = out.table.iter().find(|r| r.candidate.strategy == "slow").unwrap();
        assert!((slow.normalized_speed - 0.25).abs() < 1e-12);
        assert!((slow.s_total - (0.8 * 0.7 + 0.2 * 0.25)).abs() < 1e-12);
        assert_eq!(out.selection.strategy, "fast");
        assert!((out.selection.normalized_speed - 1.0).abs() < 1e-12);
    }

    #[test]
    fn superseded_candidates_are_listed_but_not_ranked() {
        let mut original = candidate("a", 99.0, 0.0, 100.0, vec![]);
        original.superseded = true;
        let mut remediated = candidate("a", 70.0, 0.0, 100.0, vec![]);
        remediated.fallback_state = FallbackState::Remediated {
            actions: vec![FallbackAction::TableEnhancement],
        };
        let b = candidate("b", 72.0, 0.0, 100.0, vec![]);

        let out = selector().select(vec![original, remediated, b]).unwrap();
        assert_eq!(out.selection.strategy, "b");
        assert_eq!(out.table.len(), 3);
        let last = out.table.last().unwrap();
        assert!(last.candidate.superseded);
        assert_eq!(last.rank, None);
    }

    #[test]
    fn mark_superseded_flags_only_originals_with_remediation() {
        let mut remediated = candidate("a", 70.0, 0.0, 100.0, vec![]);
        remediated.fallback_state = FallbackState::Remediated {
            actions: vec![FallbackAction::CustomSplit],
        };
        let mut candidates = vec![
            candidate("a", 60.0, 0.0, 100.0, vec![]),
            remediated,
            candidate("b", 60.0, 0.0, 100.0, vec![]),
        ];
        StrategySelector::mark_superseded(&mut candidates);
        assert!(candidates[0].superseded);
        assert!(!candidates[1].superseded);
        assert!(!candidates[2].superseded);
    }

    #[test]
    fn no_candidates_is_an_error() {
        assert!(matches!(
            selector().select(Vec::new()),
            Err(CoreError::NoCandidates)
        ));
    }

    #[test]
    fn selection_is_deterministic_under_input_order() {
        let make = || {
            vec![
                candidate("c", 80.0, 0.0, 100.0, vec![]),
                candidate("a", 80.0, 0.0, 100.0, vec![]),
                candidate("b", 80.0, 0.0, 100.0, vec![]),
            ]
        };
        let first = selector().select(make()).unwrap();
        let mut reversed = make();
        reversed.reverse();
        let second = selector().select(reversed).unwrap();
        assert_eq!(first.selection.strategy, "a");
        assert_eq!(first.selection, second.selection);
        let ids: Vec<_> = second.table.iter().map(|r| r.candidate.strategy.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
