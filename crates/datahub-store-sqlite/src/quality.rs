use anyhow::{anyhow, Context, Result};
use datahub_core::{
    evaluate_quality, DatasetCoverage, QualityCounts, QualityIssue, QualitySnapshot, Severity,
    TradeConsistency,
};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::audit::{insert_audit, AuditStatus};
use crate::{collect_rows, new_run_id, require_tables, timestamp_now, SqliteDataHub};

pub type QualityReport = QualitySnapshot;

const QUALITY_TABLES: [&str; 5] = [
    "bronze_events",
    "silver_events",
    "gold_daily_metric",
    "gold_trade_core",
    "data_quality_issues",
];

impl SqliteDataHub {
    /// Runs every check and replaces the stored issue snapshot. Findings
    /// are recorded, never returned as errors.
    pub fn check_quality(&mut self) -> Result<QualityReport> {
        require_tables(&self.conn, "quality check", &QUALITY_TABLES)?;

        let counts = QualityCounts {
            bronze_rows: scalar_count(&self.conn, "SELECT COUNT(*) FROM bronze_events")?,
            silver_rows: scalar_count(&self.conn, "SELECT COUNT(*) FROM silver_events")?,
            silver_invalid_rows: scalar_count(
                &self.conn,
                "SELECT COUNT(*) FROM silver_events WHERE is_valid = 0",
            )?,
            gold_rows: scalar_count(&self.conn, "SELECT COUNT(*) FROM gold_daily_metric")?,
        };

        let mut coverage = Vec::new();
        for dataset_id in self.config.expected_datasets() {
            let valid_rows = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM silver_events WHERE is_valid = 1 AND dataset_id = ?1",
                    params![dataset_id],
                    |row| row.get(0),
                )
                .context("failed to count dataset coverage")?;
            coverage.push(DatasetCoverage {
                dataset_id,
                valid_rows,
            });
        }

        let consistency: Vec<TradeConsistency> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT dataset_id, SUM(txn_amount), SUM(txn_count)
                     FROM gold_trade_core
                     GROUP BY dataset_id
                     ORDER BY dataset_id",
                )
                .context("failed to prepare trade consistency query")?;
            let rows = stmt.query_map([], |row| {
                Ok(TradeConsistency {
                    dataset_id: row.get(0)?,
                    txn_amount: row.get(1)?,
                    txn_count: row.get(2)?,
                })
            })?;
            collect_rows(rows)?
        };

        let threshold = self.config.quality.invalid_error_ratio;
        let issues = evaluate_quality(&counts, &coverage, &consistency, threshold);
        let checked_at = timestamp_now()?;
        let run_id = new_run_id();

        let tx = self
            .conn
            .transaction()
            .context("failed to start quality transaction")?;
        tx.execute("DELETE FROM data_quality_issues", [])
            .context("failed to clear data_quality_issues")?;
        for issue in &issues {
            tx.execute(
                "INSERT INTO data_quality_issues(check_name, severity, details, checked_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    issue.check_name,
                    issue.severity.as_str(),
                    serde_json::to_string(&issue.details)
                        .context("failed to serialize issue details")?,
                    checked_at,
                ],
            )
            .context("failed to insert quality issue")?;
        }

        let report = QualitySnapshot {
            counts,
            invalid_ratio: counts.invalid_ratio(),
            issues,
            checked_at,
        };

        insert_audit(
            &tx,
            &run_id,
            "quality",
            AuditStatus::Success,
            &json!({
                "counts": report.counts,
                "invalid_ratio": report.invalid_ratio,
                "issues": report.issues.len(),
                "errors": report.error_count(),
            }),
        )?;
        tx.commit().context("failed to commit quality transaction")?;

        if report.error_count() > 0 {
            warn!(errors = report.error_count(), "quality gate found ERROR issues");
        }
        info!(
            run_id = %run_id,
            issues = report.issues.len(),
            invalid_ratio = report.invalid_ratio,
            "quality check complete"
        );

        Ok(report)
    }

    /// The issue list written by the most recent quality check.
    pub fn quality_issues(&self) -> Result<Vec<QualityIssue>> {
        require_tables(&self.conn, "quality issues", &["data_quality_issues"])?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT check_name, severity, details
                 FROM data_quality_issues
                 ORDER BY id ASC",
            )
            .context("failed to prepare quality issue query")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut issues = Vec::new();
        for (check_name, severity_raw, details_raw) in collect_rows(rows)? {
            let severity = Severity::parse(&severity_raw)
                .ok_or_else(|| anyhow!("invalid stored severity: {severity_raw}"))?;
            let details: Value = serde_json::from_str(&details_raw)
                .with_context(|| format!("invalid details JSON for {check_name}"))?;
            issues.push(QualityIssue {
                check_name,
                severity,
                details,
            });
        }
        Ok(issues)
    }
}

fn scalar_count(conn: &Connection, sql: &str) -> Result<i64> {
    conn.query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))
}
