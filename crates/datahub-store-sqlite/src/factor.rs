use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use datahub_core::{bucket_key, decompose_metric, metric_scale, MetricBreakdown, YearMonth};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{insert_audit, AuditStatus};
use crate::{collect_rows, new_run_id, payload_from_sql, payload_text, require_tables, SqliteDataHub};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorReport {
    pub run_id: String,
    pub dataset_id: String,
    pub month: YearMonth,
    pub previous_month: YearMonth,
    pub dimensions: Vec<String>,
    pub breakdowns: Vec<MetricBreakdown>,
}

struct SilverFact {
    month: String,
    metric: String,
    value: f64,
    payload: serde_json::Value,
}

impl SqliteDataHub {
    /// Attributes the change in each metric between `month` and the month
    /// before it to buckets of the configured payload dimensions.
    pub fn decompose_factors(
        &mut self,
        dataset_id: &str,
        metrics: &[String],
        month: YearMonth,
    ) -> Result<FactorReport> {
        let (breakdowns, source_rows) = self.factor_breakdowns(dataset_id, metrics, month)?;

        let run_id = new_run_id();
        insert_audit(
            &self.conn,
            &run_id,
            "factor",
            AuditStatus::Success,
            &json!({
                "dataset_id": dataset_id,
                "month": month,
                "metrics": metrics,
                "source_rows": source_rows,
            }),
        )?;
        info!(run_id = %run_id, dataset_id, month = %month, "factor decomposition complete");

        Ok(FactorReport {
            run_id,
            dataset_id: dataset_id.to_string(),
            month,
            previous_month: month.previous(),
            dimensions: self.config.factor.dimensions.clone(),
            breakdowns,
        })
    }

    /// Unaudited decomposition shared by the factor stage and the decision
    /// engine. Also returns the number of silver rows read.
    pub(crate) fn factor_breakdowns(
        &self,
        dataset_id: &str,
        metrics: &[String],
        month: YearMonth,
    ) -> Result<(Vec<MetricBreakdown>, usize)> {
        require_tables(&self.conn, "factor decomposition", &["silver_events"])?;
        if metrics.is_empty() {
            return Err(anyhow!("factor decomposition needs at least one metric"));
        }

        let previous_month = month.previous();
        let dimensions = &self.config.factor.dimensions;
        let top_n = self.config.factor.top_n;

        let facts: Vec<SilverFact> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT substr(event_date, 1, 7), metric, value, payload_json
                     FROM silver_events
                     WHERE is_valid = 1
                       AND dataset_id = ?1
                       AND value IS NOT NULL
                       AND substr(event_date, 1, 7) IN (?2, ?3)
                     ORDER BY id ASC",
                )
                .context("failed to prepare factor source query")?;
            let rows = stmt.query_map(
                params![dataset_id, month.to_string(), previous_month.to_string()],
                |row| {
                    Ok(SilverFact {
                        month: row.get(0)?,
                        metric: row.get(1)?,
                        value: row.get(2)?,
                        payload: payload_from_sql(row.get(3)?),
                    })
                },
            )?;
            collect_rows(rows)?
        };

        let current_label = month.to_string();
        let mut breakdowns = Vec::with_capacity(metrics.len());
        for requested in metrics {
            let mut previous: BTreeMap<String, f64> = BTreeMap::new();
            let mut current: BTreeMap<String, f64> = BTreeMap::new();

            for fact in &facts {
                let Some(scale) = metric_scale(requested, &fact.metric) else {
                    continue;
                };
                let values: Vec<Option<String>> = dimensions
                    .iter()
                    .map(|dimension| payload_text(&fact.payload, dimension))
                    .collect();
                let target = if fact.month == current_label {
                    &mut current
                } else {
                    &mut previous
                };
                *target.entry(bucket_key(&values)).or_insert(0.0) += fact.value * scale;
            }

            breakdowns.push(decompose_metric(requested, &previous, &current, top_n));
        }

        Ok((breakdowns, facts.len()))
    }
}
