use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{collect_rows, new_run_id, timestamp_now, SqliteDataHub};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
    Skipped,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: i64,
    pub run_id: String,
    pub stage: String,
    pub status: AuditStatus,
    pub details: Value,
    pub created_at: String,
}

impl SqliteDataHub {
    pub fn record_audit(
        &self,
        run_id: &str,
        stage: &str,
        status: AuditStatus,
        details: &Value,
    ) -> Result<()> {
        insert_audit(&self.conn, run_id, stage, status, details)
    }

    /// Writes a `failed` record for a stage that returned an error and
    /// returns the run id it was filed under.
    pub fn record_stage_failure(&self, stage: &str, message: &str) -> Result<String> {
        let run_id = new_run_id();
        insert_audit(
            &self.conn,
            &run_id,
            stage,
            AuditStatus::Failed,
            &serde_json::json!({ "error": message }),
        )?;
        Ok(run_id)
    }

    /// Most recent records first.
    pub fn audit_trail(&self, stage: Option<&str>, limit: usize) -> Result<Vec<AuditRecord>> {
        let limit = i64::try_from(limit).context("audit limit is too large")?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, stage, status, details, created_at
                 FROM pipeline_audit
                 WHERE ?1 IS NULL OR stage = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )
            .context("failed to prepare audit trail query")?;

        let rows = stmt.query_map(params![stage, limit], |row| {
            let status_raw: String = row.get(3)?;
            let details_raw: String = row.get(4)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                status_raw,
                details_raw,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for (id, run_id, stage, status_raw, details_raw, created_at) in collect_rows(rows)? {
            let status = AuditStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("invalid audit status in row {id}: {status_raw}"))?;
            let details: Value = serde_json::from_str(&details_raw)
                .with_context(|| format!("invalid audit details JSON in row {id}"))?;
            records.push(AuditRecord {
                id,
                run_id,
                stage,
                status,
                details,
                created_at,
            });
        }

        Ok(records)
    }
}

/// Takes a plain connection so stages can write their audit row inside the
/// same transaction as their results.
pub(crate) fn insert_audit(
    conn: &Connection,
    run_id: &str,
    stage: &str,
    status: AuditStatus,
    details: &Value,
) -> Result<()> {
    let details = serde_json::to_string(details).context("failed to serialize audit details")?;
    conn.execute(
        "INSERT INTO pipeline_audit(run_id, stage, status, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, stage, status.as_str(), details, timestamp_now()?],
    )
    .with_context(|| format!("failed to write {stage} audit record"))?;
    Ok(())
}
