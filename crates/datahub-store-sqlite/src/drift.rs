use anyhow::{anyhow, Context, Result};
use datahub_core::{detect_drift, DriftFinding, Severity, TradeField};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{insert_audit, AuditStatus};
use crate::{new_run_id, require_tables, timestamp_now, SqliteDataHub};

const DRIFT_FIELDS: [TradeField; 2] = [TradeField::TxnAmount, TradeField::TxnCount];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftReport {
    pub run_id: String,
    pub dataset_id: String,
    pub warn_ratio: f64,
    pub error_ratio: f64,
    pub events: Vec<DriftFinding>,
}

impl SqliteDataHub {
    /// Compares consecutive monthly `txn_amount` and `txn_count` totals and
    /// appends one drift event per crossing. Every run appends, so the
    /// table is a history of what each run saw.
    pub fn monitor_drift(
        &mut self,
        dataset_id: &str,
        warn_ratio: f64,
        error_ratio: f64,
    ) -> Result<DriftReport> {
        require_tables(&self.conn, "drift monitor", &["gold_trade_core", "drift_events"])?;

        if !(0.0..=1.0).contains(&warn_ratio) || !(0.0..=1.0).contains(&error_ratio) {
            return Err(anyhow!("drift ratios MUST be in [0.0, 1.0]"));
        }
        if warn_ratio > error_ratio {
            return Err(anyhow!("warn_ratio cannot exceed error_ratio"));
        }

        let mut events = Vec::new();
        for field in DRIFT_FIELDS {
            let series = self.monthly_trade_series(dataset_id, field)?;
            events.extend(detect_drift(
                dataset_id,
                field.as_str(),
                &series,
                warn_ratio,
                error_ratio,
            ));
        }

        let run_id = new_run_id();
        let detected_at = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start drift transaction")?;
        for event in &events {
            tx.execute(
                "INSERT INTO drift_events(
                    dataset_id, metric, current_month, previous_month,
                    drift_ratio, severity, details, detected_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.dataset_id,
                    event.metric,
                    event.current_month.to_string(),
                    event.previous_month.to_string(),
                    event.drift_ratio,
                    event.severity.as_str(),
                    json!({
                        "previous_value": event.previous_value,
                        "current_value": event.current_value,
                        "warn_ratio": warn_ratio,
                        "error_ratio": error_ratio,
                        "run_id": run_id,
                    })
                    .to_string(),
                    detected_at,
                ],
            )
            .context("failed to append drift event")?;
        }

        let errors = events
            .iter()
            .filter(|event| event.severity == Severity::Error)
            .count();
        insert_audit(
            &tx,
            &run_id,
            "drift",
            AuditStatus::Success,
            &json!({
                "dataset_id": dataset_id,
                "events": events.len(),
                "errors": errors,
            }),
        )?;
        tx.commit().context("failed to commit drift transaction")?;

        if errors > 0 {
            warn!(dataset_id, errors, "drift monitor raised ERROR events");
        }
        info!(run_id = %run_id, dataset_id, events = events.len(), "drift monitor complete");

        Ok(DriftReport {
            run_id,
            dataset_id: dataset_id.to_string(),
            warn_ratio,
            error_ratio,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, fixture_hub, must, seed_trade_core};

    #[test]
    fn boundary_ratios_map_to_severities() {
        let mut hub = fixture_hub();
        seed_trade_core(&hub, "2026-01-01", 100.0, 50.0);
        seed_trade_core(&hub, "2026-02-01", 120.0, 50.0);
        seed_trade_core(&hub, "2026-03-01", 78.0, 50.0);

        let report = must(hub.monitor_drift("table1", 0.20, 0.35));
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].severity, Severity::Warn);
        assert_eq!(report.events[0].current_month.to_string(), "2026-02");
        assert_eq!(report.events[1].severity, Severity::Error);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM drift_events"), 2);
    }

    #[test]
    fn reruns_append_history() {
        let mut hub = fixture_hub();
        seed_trade_core(&hub, "2026-01-01", 100.0, 10.0);
        seed_trade_core(&hub, "2026-02-01", 100.0, 20.0);

        must(hub.monitor_drift("table1", 0.20, 0.35));
        must(hub.monitor_drift("table1", 0.20, 0.35));
        assert_eq!(
            count(&hub, "SELECT COUNT(*) FROM drift_events WHERE metric = 'txn_count'"),
            2
        );
    }

    #[test]
    fn zero_previous_month_is_skipped() {
        let mut hub = fixture_hub();
        seed_trade_core(&hub, "2026-01-01", 0.0, 0.0);
        seed_trade_core(&hub, "2026-02-01", 500.0, 5.0);
        let report = must(hub.monitor_drift("table1", 0.20, 0.35));
        assert!(report.events.is_empty());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut hub = fixture_hub();
        assert!(hub.monitor_drift("table1", 0.5, 0.2).is_err());
    }
}
