use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use datahub_core::{
    build_candidates, forecast, rank_actions, DecisionInputs, FactorSignal, FeedbackOutcome,
    ForecastSignal, PolicyTally, RankedAction, Severity, TradeField, YearMonth,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{insert_audit, AuditStatus};
use crate::{bool_to_sql, collect_rows, new_run_id, require_tables, timestamp_now, SqliteDataHub};

const FORECAST_FIELDS: [TradeField; 2] = [TradeField::TxnAmount, TradeField::TxnCount];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionReport {
    pub run_id: String,
    pub inputs: DecisionInputs,
    pub actions: Vec<RankedAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeedbackInput {
    pub action_name: String,
    #[serde(default)]
    pub action_owner: Option<String>,
    pub executed: bool,
    #[serde(default)]
    pub exec_month: Option<YearMonth>,
    #[serde(default)]
    pub target_metric: Option<String>,
    #[serde(default)]
    pub baseline_value: Option<f64>,
    #[serde(default)]
    pub actual_value: Option<f64>,
    #[serde(default)]
    pub roi_score: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionPolicy {
    pub action_name: String,
    pub weight: f64,
    pub success_cnt: u32,
    pub fail_cnt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyReport {
    pub run_id: String,
    pub feedback_rows: usize,
    pub policies: Vec<ActionPolicy>,
}

impl SqliteDataHub {
    /// Collects the current quality snapshot, a fresh forecast per gold
    /// dataset, and a factor decomposition of each dataset's latest month.
    pub fn decision_inputs(&self) -> Result<DecisionInputs> {
        let quality_error_checks: Vec<String> = self
            .quality_issues()?
            .into_iter()
            .filter(|issue| issue.severity == Severity::Error)
            .map(|issue| issue.check_name)
            .collect();

        let horizon = self.config.forecast.horizon_months.max(1);
        let mut forecasts = Vec::new();
        let mut factors = Vec::new();

        for dataset_id in self.gold_datasets()? {
            for field in FORECAST_FIELDS {
                let series = self.monthly_trade_series(&dataset_id, field)?;
                if series.is_empty() {
                    continue;
                }
                let result = forecast(&series, horizon, &self.config.forecast)
                    .map_err(crate::core_error)?;
                forecasts.push(ForecastSignal {
                    dataset_id: dataset_id.clone(),
                    field,
                    model: result.model,
                    backtest_mape: result.backtest_mape,
                    implied_drop: result.implied_drop(),
                });
            }

            let Some(month) = self.latest_gold_month(&dataset_id)? else {
                continue;
            };
            let metrics = self.config.factor.metrics.clone();
            let (breakdowns, _) = self.factor_breakdowns(&dataset_id, &metrics, month)?;
            for breakdown in breakdowns {
                if let Some(worst) = breakdown.worst_contributor() {
                    factors.push(FactorSignal {
                        dataset_id: dataset_id.clone(),
                        metric: breakdown.metric.clone(),
                        month,
                        previous_total: breakdown.previous_total,
                        worst: worst.clone(),
                    });
                }
            }
        }

        debug!(
            quality_errors = quality_error_checks.len(),
            forecasts = forecasts.len(),
            factors = factors.len(),
            "decision inputs assembled"
        );

        Ok(DecisionInputs {
            quality_errors: quality_error_checks.len(),
            quality_error_checks,
            forecasts,
            factors,
        })
    }

    pub fn decide(&mut self) -> Result<DecisionReport> {
        require_tables(
            &self.conn,
            "decision",
            &["data_quality_issues", "gold_trade_core", "action_policy"],
        )?;
        let inputs = self.decision_inputs()?;
        self.decide_with(inputs)
    }

    /// Scores candidates built from `inputs` against the learned weights.
    pub fn decide_with(&mut self, inputs: DecisionInputs) -> Result<DecisionReport> {
        let candidates = build_candidates(&inputs, &self.config.decision);
        let weights = self.policy_weights()?;
        let actions = rank_actions(candidates, &weights);

        let run_id = new_run_id();
        insert_audit(
            &self.conn,
            &run_id,
            "decision",
            AuditStatus::Success,
            &json!({
                "candidates": actions.len(),
                "top_action": actions.first().map(|item| item.candidate.action_name.clone()),
            }),
        )?;
        info!(run_id = %run_id, actions = actions.len(), "decision ranking complete");

        Ok(DecisionReport {
            run_id,
            inputs,
            actions,
        })
    }

    pub fn record_feedback(&mut self, input: &FeedbackInput) -> Result<i64> {
        require_tables(&self.conn, "feedback", &["decision_feedback"])?;
        if input.action_name.trim().is_empty() {
            return Err(anyhow!("feedback action_name MUST be non-empty"));
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start feedback transaction")?;
        tx.execute(
            "INSERT INTO decision_feedback(
                action_name, action_owner, executed, exec_month, target_metric,
                baseline_value, actual_value, roi_score, note, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                input.action_name.trim(),
                input.action_owner,
                bool_to_sql(input.executed),
                input.exec_month.map(|month| month.to_string()),
                input.target_metric,
                input.baseline_value,
                input.actual_value,
                input.roi_score,
                input.note,
                timestamp_now()?,
            ],
        )
        .context("failed to append decision feedback")?;
        let feedback_id = tx.last_insert_rowid();

        insert_audit(
            &tx,
            &new_run_id(),
            "feedback",
            AuditStatus::Success,
            &json!({"feedback_id": feedback_id, "action_name": input.action_name.trim()}),
        )?;
        tx.commit().context("failed to commit feedback transaction")?;

        Ok(feedback_id)
    }

    /// Recomputes every action's weight from the full feedback ledger.
    pub fn learn_policy(&mut self) -> Result<PolicyReport> {
        require_tables(&self.conn, "policy learner", &["decision_feedback", "action_policy"])?;

        let ledger: Vec<(String, FeedbackOutcome)> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT action_name, executed, baseline_value, actual_value, roi_score
                     FROM decision_feedback
                     ORDER BY id ASC",
                )
                .context("failed to prepare feedback ledger query")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    FeedbackOutcome {
                        executed: row.get::<_, i64>(1)? == 1,
                        baseline_value: row.get(2)?,
                        actual_value: row.get(3)?,
                        roi_score: row.get(4)?,
                    },
                ))
            })?;
            collect_rows(rows)?
        };

        let mut tallies: BTreeMap<String, PolicyTally> = BTreeMap::new();
        for (action_name, outcome) in &ledger {
            tallies.entry(action_name.clone()).or_default().record(outcome);
        }

        let policies: Vec<ActionPolicy> = tallies
            .into_iter()
            .map(|(action_name, tally)| ActionPolicy {
                action_name,
                weight: tally.weight(),
                success_cnt: tally.success_cnt,
                fail_cnt: tally.fail_cnt,
            })
            .collect();

        let run_id = new_run_id();
        let updated_at = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start policy transaction")?;
        for policy in &policies {
            tx.execute(
                "INSERT INTO action_policy(action_name, weight, success_cnt, fail_cnt, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(action_name) DO UPDATE SET
                   weight = excluded.weight,
                   success_cnt = excluded.success_cnt,
                   fail_cnt = excluded.fail_cnt,
                   updated_at = excluded.updated_at",
                params![
                    policy.action_name,
                    policy.weight,
                    policy.success_cnt,
                    policy.fail_cnt,
                    updated_at
                ],
            )
            .context("failed to upsert action policy")?;
        }
        insert_audit(
            &tx,
            &run_id,
            "policy",
            AuditStatus::Success,
            &json!({"feedback_rows": ledger.len(), "policies": policies.len()}),
        )?;
        tx.commit().context("failed to commit policy transaction")?;

        info!(run_id = %run_id, policies = policies.len(), "action policy updated");

        Ok(PolicyReport {
            run_id,
            feedback_rows: ledger.len(),
            policies,
        })
    }

    pub fn policy_weights(&self) -> Result<BTreeMap<String, f64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT action_name, weight FROM action_policy ORDER BY action_name")
            .context("failed to prepare policy weight query")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }
}
