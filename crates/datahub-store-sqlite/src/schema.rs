use anyhow::{Context, Result};
use datahub_core::{infer_dataset_from_filename, UNKNOWN_DATASET};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{collect_rows, table_columns, timestamp_now, SqliteDataHub};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_TABLES_V1: &str = r"
CREATE TABLE IF NOT EXISTS bronze_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  dataset_id TEXT NOT NULL DEFAULT 'unknown',
  source_file TEXT NOT NULL,
  source_type TEXT NOT NULL,
  raw_event_time TEXT,
  raw_entity_id TEXT,
  raw_metric TEXT,
  raw_value TEXT,
  raw_payload_json TEXT NOT NULL DEFAULT '{}',
  ingested_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_bronze_events_no_delete
BEFORE DELETE ON bronze_events
BEGIN
  SELECT RAISE(FAIL, 'bronze_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_bronze_events_run
  ON bronze_events(run_id);

CREATE TABLE IF NOT EXISTS ingest_registry (
  source_file TEXT NOT NULL UNIQUE,
  file_size INTEGER NOT NULL,
  mtime INTEGER NOT NULL,
  last_run_id TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS silver_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  bronze_id INTEGER,
  dataset_id TEXT NOT NULL DEFAULT 'unknown',
  event_date TEXT,
  event_time TEXT,
  entity_id TEXT,
  metric TEXT,
  value REAL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  is_valid INTEGER NOT NULL CHECK (is_valid IN (0, 1)),
  issue TEXT,
  cleaned_at TEXT NOT NULL,
  UNIQUE(event_time, entity_id, metric, value, dataset_id)
);

CREATE INDEX IF NOT EXISTS idx_silver_events_bronze
  ON silver_events(bronze_id);

CREATE TABLE IF NOT EXISTS gold_daily_metric (
  event_date TEXT NOT NULL,
  dataset_id TEXT NOT NULL,
  metric TEXT NOT NULL,
  records INTEGER NOT NULL,
  entities INTEGER NOT NULL,
  total_value REAL NOT NULL,
  avg_value REAL NOT NULL,
  built_at TEXT NOT NULL,
  UNIQUE(event_date, dataset_id, metric)
);

CREATE TABLE IF NOT EXISTS gold_trade_core (
  event_date TEXT NOT NULL,
  dataset_id TEXT NOT NULL,
  txn_count REAL NOT NULL DEFAULT 0,
  txn_amount REAL NOT NULL DEFAULT 0,
  benefit_amount REAL NOT NULL DEFAULT 0,
  fee_income REAL NOT NULL DEFAULT 0,
  built_at TEXT NOT NULL,
  UNIQUE(event_date, dataset_id)
);

CREATE TABLE IF NOT EXISTS data_quality_issues (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  check_name TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('WARN', 'ERROR')),
  details TEXT NOT NULL,
  checked_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS drift_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  dataset_id TEXT NOT NULL,
  metric TEXT NOT NULL,
  current_month TEXT NOT NULL,
  previous_month TEXT NOT NULL,
  drift_ratio REAL NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('WARN', 'ERROR')),
  details TEXT NOT NULL,
  detected_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_drift_events_no_update
BEFORE UPDATE ON drift_events
BEGIN
  SELECT RAISE(FAIL, 'drift_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_drift_events_no_delete
BEFORE DELETE ON drift_events
BEGIN
  SELECT RAISE(FAIL, 'drift_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_drift_events_dataset_month
  ON drift_events(dataset_id, current_month);

CREATE TABLE IF NOT EXISTS experiments (
  experiment_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  dataset_id TEXT NOT NULL,
  metric TEXT NOT NULL,
  start_month TEXT NOT NULL,
  unit_field TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS experiment_units (
  experiment_id TEXT NOT NULL,
  unit_key TEXT NOT NULL,
  group_label TEXT NOT NULL CHECK (group_label IN ('treated', 'control')),
  assigned_at TEXT NOT NULL,
  UNIQUE(experiment_id, unit_key),
  FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
);

CREATE TABLE IF NOT EXISTS experiment_observations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id TEXT NOT NULL,
  unit_key TEXT NOT NULL,
  group_label TEXT NOT NULL CHECK (group_label IN ('treated', 'control')),
  obs_month TEXT NOT NULL,
  metric TEXT NOT NULL,
  value REAL NOT NULL,
  snapshot_run_id TEXT,
  observed_at TEXT NOT NULL,
  UNIQUE(experiment_id, unit_key, obs_month, metric),
  FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
);

CREATE TABLE IF NOT EXISTS decision_feedback (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  action_name TEXT NOT NULL,
  action_owner TEXT,
  executed INTEGER NOT NULL CHECK (executed IN (0, 1)),
  exec_month TEXT,
  target_metric TEXT,
  baseline_value REAL,
  actual_value REAL,
  roi_score REAL,
  note TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_decision_feedback_no_update
BEFORE UPDATE ON decision_feedback
BEGIN
  SELECT RAISE(FAIL, 'decision_feedback is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_decision_feedback_no_delete
BEFORE DELETE ON decision_feedback
BEGIN
  SELECT RAISE(FAIL, 'decision_feedback is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_decision_feedback_action
  ON decision_feedback(action_name, id);

CREATE TABLE IF NOT EXISTS action_policy (
  action_name TEXT PRIMARY KEY,
  weight REAL NOT NULL CHECK (weight BETWEEN 0.5 AND 2.0),
  success_cnt INTEGER NOT NULL CHECK (success_cnt >= 0),
  fail_cnt INTEGER NOT NULL CHECK (fail_cnt >= 0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  stage TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('success', 'failed', 'skipped')),
  details TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_pipeline_audit_no_update
BEFORE UPDATE ON pipeline_audit
BEGIN
  SELECT RAISE(FAIL, 'pipeline_audit is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_pipeline_audit_no_delete
BEFORE DELETE ON pipeline_audit
BEGIN
  SELECT RAISE(FAIL, 'pipeline_audit is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_pipeline_audit_stage
  ON pipeline_audit(stage, id);
";

// Applied after the dataset_id column migration so legacy tables have the
// column before anything indexes it.
const SCHEMA_DATASET_INDEXES_V1: &str = r"
CREATE INDEX IF NOT EXISTS idx_bronze_events_dataset
  ON bronze_events(dataset_id);
CREATE INDEX IF NOT EXISTS idx_silver_events_dataset_date
  ON silver_events(dataset_id, event_date);
CREATE INDEX IF NOT EXISTS idx_silver_events_valid_metric
  ON silver_events(is_valid, metric);
CREATE INDEX IF NOT EXISTS idx_gold_trade_core_dataset
  ON gold_trade_core(dataset_id, event_date);
";

const DATASET_COLUMN_TABLES: [&str; 2] = ["bronze_events", "silver_events"];

const UNKNOWN_DATASET_FILTER: &str = "(dataset_id IS NULL OR dataset_id IN ('', 'unknown'))";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub schema_version: i64,
    pub columns_added: Vec<String>,
    pub bronze_backfilled: usize,
    pub silver_backfilled: usize,
}

impl SqliteDataHub {
    /// Creates or upgrades the schema and backfills unknown dataset ids.
    /// Safe to run on every start.
    pub fn initialize(&mut self) -> Result<MigrationReport> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_TABLES_V1)
            .context("failed to apply datahub schema")?;

        let columns_added = add_dataset_columns(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_DATASET_INDEXES_V1)
            .context("failed to create dataset indexes")?;

        let (bronze_backfilled, silver_backfilled) = self.backfill_dataset_ids()?;

        let now = timestamp_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to register datahub schema migration")?;

        let report = MigrationReport {
            schema_version: SCHEMA_VERSION,
            columns_added,
            bronze_backfilled,
            silver_backfilled,
        };

        info!(
            schema_version = report.schema_version,
            columns_added = report.columns_added.len(),
            bronze_backfilled = report.bronze_backfilled,
            silver_backfilled = report.silver_backfilled,
            "schema initialized"
        );

        Ok(report)
    }

    /// Filename patterns resolve bronze rows first; silver inherits through
    /// `bronze_id`; metric membership catches whatever is left in both.
    fn backfill_dataset_ids(&mut self) -> Result<(usize, usize)> {
        let rules = self.config.datasets.clone();
        let tx = self
            .conn
            .transaction()
            .context("failed to start dataset backfill transaction")?;

        let mut bronze_backfilled = 0_usize;
        let mut silver_backfilled = 0_usize;

        let unresolved: Vec<(i64, String)> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT id, source_file FROM bronze_events WHERE {UNKNOWN_DATASET_FILTER}"
                ))
                .context("failed to query bronze rows without dataset")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            collect_rows(rows)?
        };

        for (id, source_file) in unresolved {
            if let Some(dataset_id) = infer_dataset_from_filename(&source_file, &rules) {
                bronze_backfilled += tx
                    .execute(
                        "UPDATE bronze_events SET dataset_id = ?1 WHERE id = ?2",
                        params![dataset_id, id],
                    )
                    .context("failed to backfill bronze dataset from filename")?;
            }
        }

        silver_backfilled += tx
            .execute(
                &format!(
                    "UPDATE silver_events
                     SET dataset_id = (
                       SELECT b.dataset_id FROM bronze_events b WHERE b.id = silver_events.bronze_id
                     )
                     WHERE {UNKNOWN_DATASET_FILTER}
                       AND EXISTS (
                         SELECT 1 FROM bronze_events b
                         WHERE b.id = silver_events.bronze_id
                           AND b.dataset_id NOT IN ('', '{UNKNOWN_DATASET}')
                       )"
                ),
                [],
            )
            .context("failed to backfill silver dataset from bronze")?;

        for rule in &rules {
            for metric in &rule.metrics {
                bronze_backfilled += tx
                    .execute(
                        &format!(
                            "UPDATE bronze_events SET dataset_id = ?1
                             WHERE {UNKNOWN_DATASET_FILTER} AND raw_metric = ?2"
                        ),
                        params![rule.dataset_id, metric],
                    )
                    .context("failed to backfill bronze dataset from metric")?;
                silver_backfilled += tx
                    .execute(
                        &format!(
                            "UPDATE silver_events SET dataset_id = ?1
                             WHERE {UNKNOWN_DATASET_FILTER} AND metric = ?2"
                        ),
                        params![rule.dataset_id, metric],
                    )
                    .context("failed to backfill silver dataset from metric")?;
            }
        }

        tx.commit()
            .context("failed to commit dataset backfill transaction")?;

        Ok((bronze_backfilled, silver_backfilled))
    }
}

fn add_dataset_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut added = Vec::new();
    for table in DATASET_COLUMN_TABLES {
        let columns = table_columns(conn, table)?;
        if columns.iter().any(|column| column == "dataset_id") {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN dataset_id TEXT NOT NULL DEFAULT '{UNKNOWN_DATASET}'"
        ))
        .with_context(|| format!("failed to add dataset_id to {table}"))?;
        added.push(format!("{table}.dataset_id"));
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use datahub_core::PipelineConfig;

    use super::*;
    use crate::table_exists;
    use crate::test_support::{count, fixture_hub, must};

    const LEGACY_SCHEMA: &str = r"
        CREATE TABLE bronze_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL,
          source_file TEXT NOT NULL,
          source_type TEXT NOT NULL,
          raw_event_time TEXT,
          raw_entity_id TEXT,
          raw_metric TEXT,
          raw_value TEXT,
          raw_payload_json TEXT NOT NULL DEFAULT '{}',
          ingested_at TEXT NOT NULL
        );
        CREATE TABLE silver_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          bronze_id INTEGER,
          event_date TEXT,
          event_time TEXT,
          entity_id TEXT,
          metric TEXT,
          value REAL,
          payload_json TEXT NOT NULL DEFAULT '{}',
          is_valid INTEGER NOT NULL,
          issue TEXT,
          cleaned_at TEXT NOT NULL
        );
        INSERT INTO bronze_events(run_id, source_file, source_type, raw_metric, ingested_at)
          VALUES ('r1', '/data/Table1_2026_01.csv', 'csv', 'txn_amount', '2026-01-02T00:00:00Z');
        INSERT INTO bronze_events(run_id, source_file, source_type, raw_metric, ingested_at)
          VALUES ('r1', '/data/misc.jsonl', 'jsonl', 'fee_income_cent', '2026-01-02T00:00:00Z');
        INSERT INTO bronze_events(run_id, source_file, source_type, raw_metric, ingested_at)
          VALUES ('r1', '/data/misc.jsonl', 'jsonl', 'mystery', '2026-01-02T00:00:00Z');
        INSERT INTO silver_events(bronze_id, event_date, metric, value, is_valid, cleaned_at)
          VALUES (1, '2026-01-01', 'txn_amount', 10.0, 1, '2026-01-02T00:00:00Z');
        INSERT INTO silver_events(bronze_id, event_date, metric, value, is_valid, cleaned_at)
          VALUES (NULL, '2026-01-01', 'active_merchants', 3.0, 1, '2026-01-02T00:00:00Z');
    ";

    fn dataset_of(hub: &SqliteDataHub, table: &str, id: i64) -> String {
        match hub.connection().query_row(
            &format!("SELECT dataset_id FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read {table}.dataset_id: {err}"),
        }
    }

    #[test]
    fn schema_contract_contains_tables_and_triggers() {
        let hub = fixture_hub();
        for table in [
            "bronze_events",
            "ingest_registry",
            "silver_events",
            "gold_daily_metric",
            "gold_trade_core",
            "data_quality_issues",
            "drift_events",
            "experiments",
            "experiment_units",
            "experiment_observations",
            "decision_feedback",
            "action_policy",
            "pipeline_audit",
            "schema_migrations",
        ] {
            assert!(must(table_exists(hub.connection(), table)), "missing {table}");
        }

        let trigger_count = count(
            &hub,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'trg_%'",
        );
        assert_eq!(trigger_count, 7);
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut hub = fixture_hub();
        let second = must(hub.initialize());
        assert!(second.columns_added.is_empty());
        assert_eq!(second.bronze_backfilled, 0);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM schema_migrations"), 1);
    }

    #[test]
    fn legacy_database_gains_dataset_columns_and_backfills() {
        let mut hub = must(SqliteDataHub::open(
            Path::new(":memory:"),
            PipelineConfig::default(),
        ));
        if let Err(err) = hub.connection().execute_batch(LEGACY_SCHEMA) {
            panic!("failed to seed legacy schema: {err}");
        }

        let report = must(hub.initialize());
        assert_eq!(
            report.columns_added,
            vec!["bronze_events.dataset_id", "silver_events.dataset_id"]
        );
        // filename for row 1, metric membership for row 2; row 3 stays unknown
        assert_eq!(report.bronze_backfilled, 2);
        // inherited from bronze row 1, then metric membership
        assert_eq!(report.silver_backfilled, 2);

        assert_eq!(dataset_of(&hub, "bronze_events", 1), "table1");
        assert_eq!(dataset_of(&hub, "bronze_events", 2), "table2");
        assert_eq!(dataset_of(&hub, "bronze_events", 3), UNKNOWN_DATASET);
        assert_eq!(dataset_of(&hub, "silver_events", 1), "table1");
        assert_eq!(dataset_of(&hub, "silver_events", 2), "table3");

        let index_count = count(
            &hub,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_silver_events_dataset_date'",
        );
        assert_eq!(index_count, 1);
    }

    #[test]
    fn bronze_rows_cannot_be_deleted() {
        let hub = fixture_hub();
        let insert = hub.connection().execute(
            "INSERT INTO bronze_events(run_id, dataset_id, source_file, source_type, ingested_at)
             VALUES ('r', 'table1', 'a.csv', 'csv', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(insert.is_ok());
        let delete = hub.connection().execute("DELETE FROM bronze_events", []);
        assert!(delete.is_err());
    }

    #[test]
    fn history_tables_reject_updates() {
        let hub = fixture_hub();
        let seeded = hub.connection().execute_batch(
            "INSERT INTO drift_events(dataset_id, metric, current_month, previous_month, drift_ratio, severity, details, detected_at)
               VALUES ('table1', 'txn_amount', '2026-02', '2026-01', 0.4, 'ERROR', '{}', '2026-03-01T00:00:00Z');
             INSERT INTO decision_feedback(action_name, executed, recorded_at)
               VALUES ('keep_monitoring', 1, '2026-03-01T00:00:00Z');
             INSERT INTO pipeline_audit(run_id, stage, status, details, created_at)
               VALUES ('r', 'gold', 'success', '{}', '2026-03-01T00:00:00Z');",
        );
        assert!(seeded.is_ok());

        for sql in [
            "UPDATE drift_events SET severity = 'WARN'",
            "DELETE FROM drift_events",
            "UPDATE decision_feedback SET executed = 0",
            "DELETE FROM decision_feedback",
            "UPDATE pipeline_audit SET status = 'failed'",
            "DELETE FROM pipeline_audit",
        ] {
            let result = hub.connection().execute(sql, []);
            let err = match result {
                Ok(_) => panic!("statement should be rejected: {sql}"),
                Err(err) => err,
            };
            assert!(err.to_string().contains("append-only"), "{sql}: {err}");
        }
    }
}
