use std::collections::BTreeMap;

use anyhow::{Context, Result};
use datahub_core::{trade_metric_names, MonthlyValue, TradeCoreTotals, TradeField, YearMonth};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{insert_audit, AuditStatus};
use crate::{collect_rows, new_run_id, require_tables, to_sql_error, SqliteDataHub};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoldReport {
    pub run_id: String,
    pub built_at: Option<String>,
    pub daily_rows: usize,
    pub trade_core_rows: usize,
}

impl GoldReport {
    #[must_use]
    pub fn gold_rows(&self) -> usize {
        self.daily_rows + self.trade_core_rows
    }
}

impl SqliteDataHub {
    /// Rebuilds both gold tables from valid silver rows in one transaction.
    /// `built_at` is the silver watermark, so rerunning over unchanged
    /// silver reproduces identical rows.
    pub fn rebuild_gold(&mut self) -> Result<GoldReport> {
        require_tables(
            &self.conn,
            "gold rebuild",
            &["silver_events", "gold_daily_metric", "gold_trade_core"],
        )?;

        let run_id = new_run_id();
        let tx = self
            .conn
            .transaction()
            .context("failed to start gold transaction")?;

        let built_at: Option<String> = tx
            .query_row(
                "SELECT MAX(cleaned_at) FROM silver_events WHERE is_valid = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read silver watermark")?
            .flatten();

        tx.execute("DELETE FROM gold_daily_metric", [])
            .context("failed to clear gold_daily_metric")?;
        tx.execute("DELETE FROM gold_trade_core", [])
            .context("failed to clear gold_trade_core")?;

        let daily_rows = tx
            .execute(
                "INSERT INTO gold_daily_metric(
                    event_date, dataset_id, metric, records, entities, total_value, avg_value, built_at
                 )
                 SELECT event_date, dataset_id, metric,
                        COUNT(*), COUNT(DISTINCT entity_id), SUM(value), AVG(value), ?1
                 FROM silver_events
                 WHERE is_valid = 1
                   AND event_date IS NOT NULL
                   AND metric IS NOT NULL
                   AND value IS NOT NULL
                 GROUP BY event_date, dataset_id, metric
                 ORDER BY event_date, dataset_id, metric",
                params![built_at.as_deref().unwrap_or_default()],
            )
            .context("failed to rebuild gold_daily_metric")?;

        let trade_metrics = trade_metric_names();
        let placeholders = vec!["?"; trade_metrics.len()].join(", ");
        let summed: Vec<(String, String, String, f64)> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT event_date, dataset_id, metric, total_value
                     FROM gold_daily_metric
                     WHERE metric IN ({placeholders})
                     ORDER BY event_date, dataset_id, metric"
                ))
                .context("failed to prepare trade-core source query")?;
            let rows = stmt.query_map(params_from_iter(trade_metrics.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            collect_rows(rows)?
        };

        let mut trade_core: BTreeMap<(String, String), TradeCoreTotals> = BTreeMap::new();
        for (event_date, dataset_id, metric, total_value) in summed {
            trade_core
                .entry((event_date, dataset_id))
                .or_default()
                .add(&metric, total_value);
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO gold_trade_core(
                        event_date, dataset_id, txn_count, txn_amount, benefit_amount, fee_income, built_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("failed to prepare gold_trade_core insert")?;
            for ((event_date, dataset_id), totals) in &trade_core {
                stmt.execute(params![
                    event_date,
                    dataset_id,
                    totals.txn_count,
                    totals.txn_amount,
                    totals.benefit_amount,
                    totals.fee_income,
                    built_at.as_deref().unwrap_or_default(),
                ])
                .context("failed to insert gold_trade_core row")?;
            }
        }

        let report = GoldReport {
            run_id: run_id.clone(),
            built_at,
            daily_rows,
            trade_core_rows: trade_core.len(),
        };

        insert_audit(
            &tx,
            &run_id,
            "gold",
            AuditStatus::Success,
            &json!({
                "built_at": report.built_at,
                "daily_rows": report.daily_rows,
                "trade_core_rows": report.trade_core_rows,
            }),
        )?;

        tx.commit().context("failed to commit gold transaction")?;

        info!(
            run_id = %report.run_id,
            daily_rows = report.daily_rows,
            trade_core_rows = report.trade_core_rows,
            "gold rebuilt"
        );

        Ok(report)
    }

    /// Monthly sums of one trade-core field, oldest month first.
    pub fn monthly_trade_series(
        &self,
        dataset_id: &str,
        field: TradeField,
    ) -> Result<Vec<MonthlyValue>> {
        require_tables(&self.conn, "trade series", &["gold_trade_core"])?;

        // field names come from a closed enum, never from input
        let column = field.as_str();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT substr(event_date, 1, 7) AS month, SUM({column})
                 FROM gold_trade_core
                 WHERE dataset_id = ?1
                 GROUP BY month
                 ORDER BY month ASC"
            ))
            .context("failed to prepare trade series query")?;

        let rows = stmt.query_map(params![dataset_id], |row| {
            let raw: String = row.get(0)?;
            let month = raw.parse::<YearMonth>().map_err(to_sql_error)?;
            Ok(MonthlyValue {
                month,
                value: row.get(1)?,
            })
        })?;

        collect_rows(rows)
    }

    /// Datasets present in `gold_trade_core`, sorted.
    pub fn gold_datasets(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT dataset_id FROM gold_trade_core ORDER BY dataset_id")
            .context("failed to prepare gold dataset query")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        collect_rows(rows)
    }

    pub fn latest_gold_month(&self, dataset_id: &str) -> Result<Option<YearMonth>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(substr(event_date, 1, 7)) FROM gold_trade_core WHERE dataset_id = ?1",
                params![dataset_id],
                |row| row.get(0),
            )
            .context("failed to read latest gold month")?;

        raw.map(|value| value.parse::<YearMonth>())
            .transpose()
            .map_err(crate::core_error)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::test_support::{count, fixture_hub, invalid_silver, must, silver};

    type GoldSnapshot = Vec<(String, String, String, i64, i64, f64, f64, String)>;

    fn snapshot(hub: &SqliteDataHub) -> GoldSnapshot {
        let mut stmt = match hub.connection().prepare(
            "SELECT event_date, dataset_id, metric, records, entities, total_value, avg_value, built_at
             FROM gold_daily_metric ORDER BY event_date, dataset_id, metric",
        ) {
            Ok(value) => value,
            Err(err) => panic!("snapshot prepare failed: {err}"),
        };
        let rows = match stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        }) {
            Ok(value) => value,
            Err(err) => panic!("snapshot query failed: {err}"),
        };
        must(collect_rows(rows))
    }

    type TradeSnapshot = Vec<(String, String, f64, f64, f64, f64, String)>;

    fn trade_snapshot(hub: &SqliteDataHub) -> TradeSnapshot {
        let mut stmt = match hub.connection().prepare(
            "SELECT event_date, dataset_id, txn_count, txn_amount, benefit_amount, fee_income, built_at
             FROM gold_trade_core ORDER BY event_date, dataset_id",
        ) {
            Ok(value) => value,
            Err(err) => panic!("trade snapshot prepare failed: {err}"),
        };
        let rows = match stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        }) {
            Ok(value) => value,
            Err(err) => panic!("trade snapshot query failed: {err}"),
        };
        must(collect_rows(rows))
    }

    #[test]
    fn daily_metrics_group_valid_rows() {
        let mut hub = fixture_hub();
        must(hub.insert_silver_events(&[
            silver("table1", "2026-01-01", "m1", "txn_amount", 10.0, json!({})),
            silver("table1", "2026-01-01", "m2", "txn_amount", 30.0, json!({})),
            silver("table1", "2026-01-01", "m1", "txn_count", 2.0, json!({})),
            invalid_silver("m3"),
        ]));

        let report = must(hub.rebuild_gold());
        assert_eq!(report.daily_rows, 2);
        assert_eq!(report.trade_core_rows, 1);

        let rows = snapshot(&hub);
        let amount = &rows[0];
        assert_eq!(amount.2, "txn_amount");
        assert_eq!(amount.3, 2);
        assert_eq!(amount.4, 2);
        assert_eq!(amount.5, 40.0);
        assert_eq!(amount.6, 20.0);
    }

    #[test]
    fn trade_core_converts_cents_and_merges_aliases() {
        let mut hub = fixture_hub();
        must(hub.insert_silver_events(&[
            silver("table1", "2026-01-01", "m1", "txn_amount", 10.0, json!({})),
            silver("table1", "2026-01-01", "m2", "txn_amount_cent", 500.0, json!({})),
            silver("table1", "2026-01-01", "m1", "order_count", 3.0, json!({})),
            silver("table1", "2026-01-01", "m2", "txn_count", 1.0, json!({})),
            silver("table3", "2026-01-01", "m1", "active_merchants", 9.0, json!({})),
        ]));
        must(hub.rebuild_gold());

        let (txn_amount, txn_count): (f64, f64) = match hub.connection().query_row(
            "SELECT txn_amount, txn_count FROM gold_trade_core WHERE dataset_id = 'table1'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(value) => value,
            Err(err) => panic!("trade core query failed: {err}"),
        };
        assert!((txn_amount - 15.0).abs() < 1e-9);
        assert!((txn_count - 4.0).abs() < 1e-9);
        // table3 has no trade metrics and gets no trade-core row
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM gold_trade_core"), 1);
    }

    #[test]
    fn rebuild_is_a_full_refresh() {
        let mut hub = fixture_hub();
        must(hub.insert_silver_events(&[
            silver("table1", "2026-01-01", "m1", "txn_amount", 10.0, json!({})),
            silver("table1", "2026-01-01", "m1", "txn_count", 2.0, json!({})),
            silver("table2", "2026-01-02", "m2", "fee_income", 1.5, json!({})),
        ]));
        let first = must(hub.rebuild_gold());
        let before = snapshot(&hub);
        let trade_before = trade_snapshot(&hub);
        assert_eq!(trade_before.len(), 2);

        let second = must(hub.rebuild_gold());
        assert_eq!(snapshot(&hub), before);
        assert_eq!(trade_snapshot(&hub), trade_before);
        assert_eq!(first.built_at, second.built_at);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM pipeline_audit WHERE stage = 'gold'"), 2);
    }

    #[test]
    fn monthly_series_sums_days_into_months() {
        let mut hub = fixture_hub();
        must(hub.insert_silver_events(&[
            silver("table1", "2026-01-01", "m1", "txn_amount", 10.0, json!({})),
            silver("table1", "2026-01-20", "m1", "txn_amount", 5.0, json!({})),
            silver("table1", "2026-02-03", "m1", "txn_amount", 7.0, json!({})),
        ]));
        must(hub.rebuild_gold());

        let series = must(hub.monthly_trade_series("table1", TradeField::TxnAmount));
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].month.to_string(), "2026-01");
        assert_eq!(series[0].value, 15.0);
        assert_eq!(
            must(hub.latest_gold_month("table1")).map(|month| month.to_string()),
            Some("2026-02".to_string())
        );
        assert_eq!(must(hub.latest_gold_month("table9")), None);
        assert_eq!(must(hub.gold_datasets()), vec!["table1"]);
    }

    fn arb_rows() -> impl Strategy<Value = Vec<(u8, u8, u8, i32)>> {
        prop::collection::vec((1u8..4, 0u8..3, 0u8..3, -50i32..500), 1..40)
    }

    proptest! {
        #[test]
        fn prop_gold_is_independent_of_silver_insert_order(rows in arb_rows()) {
            let metrics = ["txn_amount", "txn_count", "fee_income_cent"];
            let inputs: Vec<_> = rows
                .iter()
                .enumerate()
                .map(|(index, (day, entity, metric, value))| {
                    silver(
                        "table1",
                        &format!("2026-01-0{day}"),
                        &format!("m{entity}-{index}"),
                        metrics[usize::from(*metric)],
                        f64::from(*value),
                        json!({}),
                    )
                })
                .collect();

            let mut forward = fixture_hub();
            must(forward.insert_silver_events(&inputs));
            must(forward.rebuild_gold());

            let mut reversed_inputs = inputs.clone();
            reversed_inputs.reverse();
            let mut backward = fixture_hub();
            must(backward.insert_silver_events(&reversed_inputs));
            must(backward.rebuild_gold());

            let lhs: Vec<_> = snapshot(&forward).into_iter().map(|row| (row.0, row.2, row.3, row.4)).collect();
            let rhs: Vec<_> = snapshot(&backward).into_iter().map(|row| (row.0, row.2, row.3, row.4)).collect();
            prop_assert_eq!(lhs, rhs);

            let lhs_totals: Vec<f64> = snapshot(&forward).into_iter().map(|row| row.5).collect();
            let rhs_totals: Vec<f64> = snapshot(&backward).into_iter().map(|row| row.5).collect();
            prop_assert_eq!(lhs_totals, rhs_totals);
        }
    }
}
