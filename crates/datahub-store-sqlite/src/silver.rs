use anyhow::{anyhow, Context, Result};
use datahub_core::UNKNOWN_DATASET;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description, Date};
use tracing::info;

use crate::audit::{insert_audit, AuditStatus};
use crate::{bool_to_sql, new_run_id, require_tables, timestamp_now, SqliteDataHub};

/// One cleaned row handed over by the external cleaning stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SilverEventInput {
    #[serde(default)]
    pub bronze_id: Option<i64>,
    #[serde(default = "unknown_dataset")]
    pub dataset_id: String,
    #[serde(default)]
    pub event_date: Option<String>,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    pub is_valid: bool,
    #[serde(default)]
    pub issue: Option<String>,
}

fn unknown_dataset() -> String {
    UNKNOWN_DATASET.to_string()
}

fn empty_payload() -> Value {
    json!({})
}

/// Calendar date in `YYYY-MM-DD` form; impossible days are rejected.
fn parse_event_date(value: &str) -> Result<Date> {
    let format = format_description::parse("[year]-[month]-[day]")
        .context("failed to build event_date format")?;
    Ok(Date::parse(value, &format)?)
}

impl SilverEventInput {
    /// `event_date` falls back to the date part of `event_time`.
    fn resolved_event_date(&self) -> Option<String> {
        self.event_date
            .clone()
            .or_else(|| self.event_time.as_ref().and_then(|time| time.get(..10).map(str::to_string)))
    }

    /// Valid rows must carry everything aggregation groups on.
    fn validate(&self, index: usize) -> Result<()> {
        if !self.is_valid {
            return Ok(());
        }
        let event_date = self
            .resolved_event_date()
            .ok_or_else(|| anyhow!("silver row {index}: valid rows need event_date or event_time"))?;
        parse_event_date(&event_date)
            .map_err(|err| anyhow!("silver row {index}: invalid event_date {event_date:?}: {err}"))?;
        if self.metric.as_deref().map_or(true, |metric| metric.trim().is_empty()) {
            return Err(anyhow!("silver row {index}: valid rows need a metric"));
        }
        match self.value {
            Some(value) if value.is_finite() => Ok(()),
            _ => Err(anyhow!("silver row {index}: valid rows need a finite value")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SilverReport {
    pub run_id: String,
    pub submitted: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

impl SqliteDataHub {
    /// Contract writer for the cleaning stage. Rows already present under
    /// the silver uniqueness key are ignored, so resubmitting a batch is
    /// harmless. The whole batch is rejected if any valid row is incomplete.
    pub fn insert_silver_events(&mut self, events: &[SilverEventInput]) -> Result<SilverReport> {
        require_tables(&self.conn, "silver load", &["silver_events"])?;

        for (index, event) in events.iter().enumerate() {
            event.validate(index)?;
        }

        let run_id = new_run_id();
        let cleaned_at = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start silver transaction")?;

        let mut inserted = 0_usize;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO silver_events(
                        bronze_id, dataset_id, event_date, event_time, entity_id,
                        metric, value, payload_json, is_valid, issue, cleaned_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("failed to prepare silver insert")?;

            for event in events {
                let payload =
                    serde_json::to_string(&event.payload).context("failed to serialize payload")?;
                inserted += stmt
                    .execute(rusqlite::params![
                        event.bronze_id,
                        event.dataset_id,
                        event.resolved_event_date(),
                        event.event_time,
                        event.entity_id,
                        event.metric,
                        event.value,
                        payload,
                        bool_to_sql(event.is_valid),
                        event.issue,
                        cleaned_at,
                    ])
                    .context("failed to insert silver row")?;
            }
        }

        let report = SilverReport {
            run_id: run_id.clone(),
            submitted: events.len(),
            inserted,
            duplicates: events.len() - inserted,
        };

        insert_audit(
            &tx,
            &run_id,
            "silver",
            AuditStatus::Success,
            &json!({
                "submitted": report.submitted,
                "inserted": report.inserted,
                "duplicates": report.duplicates,
            }),
        )?;

        tx.commit().context("failed to commit silver transaction")?;

        info!(
            run_id = %report.run_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "silver rows loaded"
        );

        Ok(report)
    }
}
