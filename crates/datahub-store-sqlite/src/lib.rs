#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use datahub_core::{format_rfc3339, now_utc, DataHubError, PipelineConfig};
use rusqlite::{params, Connection, OptionalExtension};

mod aggregate;
mod audit;
mod decision;
mod drift;
mod experiment;
mod factor;
mod forecast;
mod ingest;
mod quality;
mod schema;
mod silver;

pub use aggregate::GoldReport;
pub use audit::{AuditRecord, AuditStatus};
pub use decision::{ActionPolicy, DecisionReport, FeedbackInput, PolicyReport};
pub use drift::DriftReport;
pub use experiment::{Experiment, ExperimentEvaluation, ExperimentInput, SnapshotReport};
pub use factor::FactorReport;
pub use forecast::ForecastReport;
pub use ingest::IngestReport;
pub use quality::QualityReport;
pub use schema::MigrationReport;
pub use silver::{SilverEventInput, SilverReport};

/// SQLite-backed medallion store. Every pipeline stage is a method on this
/// type and reads its thresholds from the [`PipelineConfig`] given at open.
pub struct SqliteDataHub {
    conn: Connection,
    config: PipelineConfig,
}

impl SqliteDataHub {
    pub fn open(path: &Path, config: PipelineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid pipeline configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn timestamp_now() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn new_run_id() -> String {
    ulid::Ulid::new().to_string()
}

fn core_error(err: DataHubError) -> anyhow::Error {
    anyhow!(err.to_string())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

/// Stages read tables they do not own; a missing one means the schema was
/// never initialized and the stage cannot produce a meaningful answer.
fn require_tables(conn: &Connection, stage: &str, tables: &[&str]) -> Result<()> {
    for table in tables {
        if !table_exists(conn, table)? {
            return Err(anyhow!(
                "{stage} requires table {table}; run `datahub init` first"
            ));
        }
    }
    Ok(())
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    Ok(available)
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: DataHubError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Reads a payload column, treating unparsable text as an empty object.
fn payload_from_sql(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
}

/// Text form of a payload attribute, used for factor buckets and
/// experiment unit keys.
fn payload_text(payload: &serde_json::Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{count, fixture_hub, must};
    use super::*;

    #[test]
    fn invalid_config_is_rejected_at_open() {
        let mut config = PipelineConfig::default();
        config.ingest.batch_size = 0;
        let result = SqliteDataHub::open(Path::new(":memory:"), config);
        let err = match result {
            Ok(_) => panic!("open should reject a zero batch size"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn stages_fail_fast_without_schema() {
        let mut hub = must(SqliteDataHub::open(
            Path::new(":memory:"),
            PipelineConfig::default(),
        ));
        let err = match hub.check_quality() {
            Ok(_) => panic!("quality check should fail on an empty database"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("requires table"));
        assert_eq!(count(&fixture_hub(), "SELECT COUNT(*) FROM bronze_events"), 0);
    }

    #[test]
    fn payload_text_renders_scalars() {
        let payload = serde_json::json!({"province": "gd", "tier": 2, "none": null});
        assert_eq!(payload_text(&payload, "province").as_deref(), Some("gd"));
        assert_eq!(payload_text(&payload, "tier").as_deref(), Some("2"));
        assert_eq!(payload_text(&payload, "none"), None);
        assert_eq!(payload_text(&payload, "missing"), None);
        assert_eq!(payload_from_sql(Some("{oops".to_string())), serde_json::json!({}));
    }
}
