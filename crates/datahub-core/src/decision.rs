//! Action candidates, scoring, and the feedback-driven policy weight.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DecisionConfig;
use crate::factor::BucketContribution;
use crate::forecast::ForecastModel;
use crate::gold::TradeField;
use crate::{clamp, YearMonth};

pub const DEFAULT_POLICY_WEIGHT: f64 = 1.0;
pub const POLICY_WEIGHT_MIN: f64 = 0.5;
pub const POLICY_WEIGHT_MAX: f64 = 2.0;
const POLICY_WEIGHT_BASE: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCandidate {
    pub action_name: String,
    pub action_owner: String,
    pub target_metric: String,
    pub reason: String,
    pub impact: f64,
    pub urgency: f64,
    pub confidence: f64,
    pub effort: f64,
    pub evidence: Value,
}

impl ActionCandidate {
    #[must_use]
    pub fn base_score(&self) -> f64 {
        self.impact * 4.0 + self.urgency * 3.0 + self.confidence * 20.0 - self.effort * 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedAction {
    pub rank: usize,
    #[serde(flatten)]
    pub candidate: ActionCandidate,
    pub base_score: f64,
    pub policy_weight: f64,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastSignal {
    pub dataset_id: String,
    pub field: TradeField,
    pub model: ForecastModel,
    pub backtest_mape: Option<f64>,
    pub implied_drop: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorSignal {
    pub dataset_id: String,
    pub metric: String,
    pub month: YearMonth,
    pub previous_total: f64,
    pub worst: BucketContribution,
}

/// Signals collected from the quality, forecast, and factor stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DecisionInputs {
    pub quality_errors: usize,
    pub quality_error_checks: Vec<String>,
    pub forecasts: Vec<ForecastSignal>,
    pub factors: Vec<FactorSignal>,
}

/// Turns stage signals into unweighted action candidates.
#[must_use]
pub fn build_candidates(inputs: &DecisionInputs, config: &DecisionConfig) -> Vec<ActionCandidate> {
    let mut candidates = Vec::new();

    if inputs.quality_errors > 0 {
        #[allow(clippy::cast_precision_loss)]
        let impact = clamp(5.0 + inputs.quality_errors as f64, 1.0, 10.0);
        candidates.push(ActionCandidate {
            action_name: "fix_data_quality".to_string(),
            action_owner: "data_engineering".to_string(),
            target_metric: "data_quality".to_string(),
            reason: format!("{} quality check(s) at ERROR", inputs.quality_errors),
            impact,
            urgency: 9.0,
            confidence: 0.9,
            effort: 3.0,
            evidence: json!({ "checks": inputs.quality_error_checks }),
        });
    }

    for signal in &inputs.forecasts {
        let Some(drop) = signal.implied_drop else {
            continue;
        };
        let (threshold, impact_scale, urgency_high, urgency_low, effort) = match signal.field {
            TradeField::TxnAmount => (config.amount_drop_threshold, 40.0, 8.0, 6.0, 5.0),
            TradeField::TxnCount => (config.count_drop_threshold, 50.0, 7.0, 5.0, 4.0),
            TradeField::BenefitAmount | TradeField::FeeIncome => continue,
        };
        if drop < threshold {
            continue;
        }

        let urgency = if drop >= threshold * 2.0 {
            urgency_high
        } else {
            urgency_low
        };
        let confidence = clamp(1.0 - signal.backtest_mape.unwrap_or(0.5), 0.1, 1.0);

        candidates.push(ActionCandidate {
            action_name: format!("recover_{}:{}", signal.field.as_str(), signal.dataset_id),
            action_owner: "growth_ops".to_string(),
            target_metric: signal.field.as_str().to_string(),
            reason: format!(
                "{} forecast ({}) implies a {:.1}% drop",
                signal.field.as_str(),
                signal.model.as_str(),
                drop * 100.0
            ),
            impact: clamp(drop * impact_scale, 1.0, 10.0),
            urgency,
            confidence,
            effort,
            evidence: json!({
                "dataset_id": signal.dataset_id,
                "implied_drop": drop,
                "threshold": threshold,
                "backtest_mape": signal.backtest_mape,
            }),
        });
    }

    for signal in &inputs.factors {
        if signal.worst.delta >= 0.0 {
            continue;
        }
        let share = if signal.previous_total == 0.0 {
            1.0
        } else {
            signal.worst.delta.abs() / signal.previous_total.abs()
        };
        candidates.push(ActionCandidate {
            action_name: format!("investigate_segment:{}:{}", signal.metric, signal.dataset_id),
            action_owner: "regional_ops".to_string(),
            target_metric: signal.metric.clone(),
            reason: format!(
                "bucket {} moved {} by {:.2} in {}",
                signal.worst.bucket, signal.metric, signal.worst.delta, signal.month
            ),
            impact: clamp(share * 40.0, 1.0, 10.0),
            urgency: 6.0,
            confidence: 0.7,
            effort: 4.0,
            evidence: json!({
                "dataset_id": signal.dataset_id,
                "month": signal.month,
                "bucket": signal.worst.bucket,
                "delta": signal.worst.delta,
                "contribution_ratio": signal.worst.contribution_ratio,
            }),
        });
    }

    if candidates.is_empty() {
        candidates.push(ActionCandidate {
            action_name: "keep_monitoring".to_string(),
            action_owner: "analytics".to_string(),
            target_metric: "all".to_string(),
            reason: "no quality, forecast, or factor signal crossed its threshold".to_string(),
            impact: 1.0,
            urgency: 1.0,
            confidence: 0.5,
            effort: 1.0,
            evidence: json!({}),
        });
    }

    candidates
}

/// Applies learned weights and sorts by weighted score, highest first.
/// Actions without a learned weight use 1.0.
#[must_use]
pub fn rank_actions(
    candidates: Vec<ActionCandidate>,
    weights: &BTreeMap<String, f64>,
) -> Vec<RankedAction> {
    let mut ranked: Vec<RankedAction> = candidates
        .into_iter()
        .map(|candidate| {
            let base_score = candidate.base_score();
            let policy_weight = weights
                .get(&candidate.action_name)
                .copied()
                .unwrap_or(DEFAULT_POLICY_WEIGHT);
            RankedAction {
                rank: 0,
                candidate,
                base_score,
                policy_weight,
                weighted_score: base_score * policy_weight,
            }
        })
        .collect();

    ranked.sort_by(|lhs, rhs| {
        rhs.weighted_score
            .partial_cmp(&lhs.weighted_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.candidate.action_name.cmp(&rhs.candidate.action_name))
    });

    for (index, item) in ranked.iter_mut().enumerate() {
        item.rank = index + 1;
    }

    ranked
}

/// Outcome fields of one feedback ledger row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackOutcome {
    pub executed: bool,
    pub baseline_value: Option<f64>,
    pub actual_value: Option<f64>,
    pub roi_score: Option<f64>,
}

impl FeedbackOutcome {
    /// `None` for rows that were never executed and so carry no outcome.
    #[must_use]
    pub fn is_success(&self) -> Option<bool> {
        if !self.executed {
            return None;
        }
        let positive_roi = self.roi_score.is_some_and(|roi| roi > 0.0);
        let met_baseline = match (self.actual_value, self.baseline_value) {
            (Some(actual), Some(baseline)) => actual >= baseline,
            _ => false,
        };
        Some(positive_roi || met_baseline)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyTally {
    pub success_cnt: u32,
    pub fail_cnt: u32,
}

impl PolicyTally {
    pub fn record(&mut self, outcome: &FeedbackOutcome) {
        match outcome.is_success() {
            Some(true) => self.success_cnt += 1,
            Some(false) => self.fail_cnt += 1,
            None => {}
        }
    }

    #[must_use]
    pub fn weight(&self) -> f64 {
        policy_weight(self.success_cnt, self.fail_cnt)
    }
}

/// `clamp(0.8 + success / (success + fail), 0.5, 2.0)`, or 1.0 with no
/// recorded outcomes. Every outcome counts equally regardless of age.
#[must_use]
pub fn policy_weight(success_cnt: u32, fail_cnt: u32) -> f64 {
    let total = success_cnt + fail_cnt;
    if total == 0 {
        return DEFAULT_POLICY_WEIGHT;
    }
    let success_rate = f64::from(success_cnt) / f64::from(total);
    clamp(
        POLICY_WEIGHT_BASE + success_rate,
        POLICY_WEIGHT_MIN,
        POLICY_WEIGHT_MAX,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn forecast_signal(field: TradeField, drop: f64) -> ForecastSignal {
        ForecastSignal {
            dataset_id: "table1".to_string(),
            field,
            model: ForecastModel::Linear,
            backtest_mape: Some(0.05),
            implied_drop: Some(drop),
        }
    }

    #[test]
    fn score_formula_matches_weights() {
        let candidate = ActionCandidate {
            action_name: "a".to_string(),
            action_owner: "o".to_string(),
            target_metric: "m".to_string(),
            reason: String::new(),
            impact: 5.0,
            urgency: 4.0,
            confidence: 0.5,
            effort: 3.0,
            evidence: json!({}),
        };
        assert!((candidate.base_score() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn policy_weight_defaults_and_caps() {
        assert!((policy_weight(0, 0) - 1.0).abs() < f64::EPSILON);
        assert!((policy_weight(10, 0) - 1.8).abs() < 1e-12);
        assert!((policy_weight(0, 10) - 0.8).abs() < 1e-12);
        assert!((policy_weight(1, 1) - 1.3).abs() < 1e-12);
    }

    #[test]
    fn feedback_success_uses_roi_or_baseline() {
        let roi_only = FeedbackOutcome {
            executed: true,
            roi_score: Some(0.2),
            ..FeedbackOutcome::default()
        };
        assert_eq!(roi_only.is_success(), Some(true));

        let met_baseline = FeedbackOutcome {
            executed: true,
            baseline_value: Some(100.0),
            actual_value: Some(100.0),
            roi_score: Some(-1.0),
        };
        assert_eq!(met_baseline.is_success(), Some(true));

        let missed = FeedbackOutcome {
            executed: true,
            baseline_value: Some(100.0),
            actual_value: Some(90.0),
            roi_score: None,
        };
        assert_eq!(missed.is_success(), Some(false));

        let skipped = FeedbackOutcome::default();
        assert_eq!(skipped.is_success(), None);
    }

    #[test]
    fn forecast_drop_thresholds_gate_candidates() {
        let config = DecisionConfig::default();
        let inputs = DecisionInputs {
            forecasts: vec![
                forecast_signal(TradeField::TxnAmount, 0.10),
                forecast_signal(TradeField::TxnCount, 0.079),
            ],
            ..DecisionInputs::default()
        };

        let names: Vec<String> = build_candidates(&inputs, &config)
            .into_iter()
            .map(|item| item.action_name)
            .collect();
        assert_eq!(names, vec!["recover_txn_amount:table1"]);
    }

    #[test]
    fn no_signal_yields_keep_monitoring() {
        let candidates = build_candidates(&DecisionInputs::default(), &DecisionConfig::default());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].action_name, "keep_monitoring");
    }

    #[test]
    fn learned_weight_can_reorder_actions() {
        let inputs = DecisionInputs {
            quality_errors: 1,
            quality_error_checks: vec!["gold_empty".to_string()],
            forecasts: vec![forecast_signal(TradeField::TxnAmount, 0.25)],
            factors: Vec::new(),
        };
        let candidates = build_candidates(&inputs, &DecisionConfig::default());

        let unweighted = rank_actions(candidates.clone(), &BTreeMap::new());
        assert_eq!(unweighted[0].candidate.action_name, "fix_data_quality");
        assert_eq!(unweighted[0].rank, 1);

        let mut weights = BTreeMap::new();
        weights.insert("fix_data_quality".to_string(), 0.5);
        weights.insert("recover_txn_amount:table1".to_string(), 1.8);
        let weighted = rank_actions(candidates, &weights);
        assert_eq!(weighted[0].candidate.action_name, "recover_txn_amount:table1");
        assert!((weighted[0].policy_weight - 1.8).abs() < 1e-12);
    }

    #[test]
    fn declining_bucket_becomes_candidate() {
        let inputs = DecisionInputs {
            factors: vec![FactorSignal {
                dataset_id: "table1".to_string(),
                metric: "txn_amount".to_string(),
                month: YearMonth { year: 2026, month: 3 },
                previous_total: 1000.0,
                worst: BucketContribution {
                    bucket: "gd|kiosk".to_string(),
                    previous: 400.0,
                    current: 300.0,
                    delta: -100.0,
                    contribution_ratio: 1.0,
                },
            }],
            ..DecisionInputs::default()
        };
        let candidates = build_candidates(&inputs, &DecisionConfig::default());
        assert_eq!(candidates[0].action_name, "investigate_segment:txn_amount:table1");
        assert!((candidates[0].impact - 4.0).abs() < 1e-9);
    }

    #[test]
    fn segment_actions_are_distinct_per_dataset() {
        let signal = |dataset_id: &str| FactorSignal {
            dataset_id: dataset_id.to_string(),
            metric: "txn_amount".to_string(),
            month: YearMonth { year: 2026, month: 3 },
            previous_total: 500.0,
            worst: BucketContribution {
                bucket: "zj|stall".to_string(),
                previous: 200.0,
                current: 150.0,
                delta: -50.0,
                contribution_ratio: 1.0,
            },
        };
        let inputs = DecisionInputs {
            factors: vec![signal("table1"), signal("table2")],
            ..DecisionInputs::default()
        };

        let candidates = build_candidates(&inputs, &DecisionConfig::default());
        let names: Vec<&str> = candidates.iter().map(|item| item.action_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["investigate_segment:txn_amount:table1", "investigate_segment:txn_amount:table2"]
        );

        let mut weights = BTreeMap::new();
        weights.insert("investigate_segment:txn_amount:table2".to_string(), 0.5);
        let ranked = rank_actions(candidates, &weights);
        assert_eq!(ranked[0].candidate.action_name, "investigate_segment:txn_amount:table1");
        assert!((ranked[0].policy_weight - 1.0).abs() < 1e-12);
        assert!((ranked[1].policy_weight - 0.5).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_policy_weight_stays_in_bounds(success in 0u32..10_000, fail in 0u32..10_000) {
            let weight = policy_weight(success, fail);
            prop_assert!((POLICY_WEIGHT_MIN..=POLICY_WEIGHT_MAX).contains(&weight));
        }
    }
}
