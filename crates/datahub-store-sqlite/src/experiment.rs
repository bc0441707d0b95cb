use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use datahub_core::{evaluate_did, metric_scale, DidEstimate, ExperimentGroup, Observation, YearMonth};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{insert_audit, AuditStatus};
use crate::{
    collect_rows, new_run_id, payload_from_sql, payload_text, require_tables, timestamp_now,
    to_sql_error, SqliteDataHub,
};

const ENTITY_UNIT_FIELD: &str = "entity_id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentInput {
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub name: String,
    pub dataset_id: String,
    pub metric: String,
    pub start_month: YearMonth,
    #[serde(default = "default_unit_field")]
    pub unit_field: String,
}

fn default_unit_field() -> String {
    ENTITY_UNIT_FIELD.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub dataset_id: String,
    pub metric: String,
    pub start_month: YearMonth,
    pub unit_field: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotReport {
    pub run_id: String,
    pub experiment_id: String,
    pub units: usize,
    pub observations_written: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentEvaluation {
    pub run_id: String,
    pub experiment: Experiment,
    pub treated_units: usize,
    pub control_units: usize,
    pub estimate: DidEstimate,
}

impl SqliteDataHub {
    pub fn create_experiment(&mut self, input: &ExperimentInput) -> Result<Experiment> {
        require_tables(&self.conn, "experiment", &["experiments"])?;

        for (name, value) in [
            ("name", &input.name),
            ("dataset_id", &input.dataset_id),
            ("metric", &input.metric),
            ("unit_field", &input.unit_field),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("experiment {name} MUST be non-empty"));
            }
        }

        let experiment = Experiment {
            experiment_id: input
                .experiment_id
                .clone()
                .unwrap_or_else(new_run_id),
            name: input.name.trim().to_string(),
            dataset_id: input.dataset_id.trim().to_string(),
            metric: input.metric.trim().to_string(),
            start_month: input.start_month,
            unit_field: input.unit_field.trim().to_string(),
            created_at: timestamp_now()?,
        };

        self.conn
            .execute(
                "INSERT INTO experiments(experiment_id, name, dataset_id, metric, start_month, unit_field, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    experiment.experiment_id,
                    experiment.name,
                    experiment.dataset_id,
                    experiment.metric,
                    experiment.start_month.to_string(),
                    experiment.unit_field,
                    experiment.created_at,
                ],
            )
            .with_context(|| format!("failed to create experiment {}", experiment.experiment_id))?;

        info!(experiment_id = %experiment.experiment_id, "experiment created");
        Ok(experiment)
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Result<Option<Experiment>> {
        self.conn
            .query_row(
                "SELECT experiment_id, name, dataset_id, metric, start_month, unit_field, created_at
                 FROM experiments
                 WHERE experiment_id = ?1",
                params![experiment_id],
                |row| {
                    let start_raw: String = row.get(4)?;
                    Ok(Experiment {
                        experiment_id: row.get(0)?,
                        name: row.get(1)?,
                        dataset_id: row.get(2)?,
                        metric: row.get(3)?,
                        start_month: start_raw.parse().map_err(to_sql_error)?,
                        unit_field: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("failed to load experiment")
    }

    /// Assigning a unit to the group it already has is a no-op; moving it
    /// to the other group is rejected because its observations would flip.
    pub fn assign_unit(
        &mut self,
        experiment_id: &str,
        unit_key: &str,
        group: ExperimentGroup,
    ) -> Result<()> {
        self.require_experiment(experiment_id)?;
        let unit_key = unit_key.trim();
        if unit_key.is_empty() {
            return Err(anyhow!("unit_key MUST be non-empty"));
        }

        if let Some(existing) = self.unit_group(experiment_id, unit_key)? {
            if existing == group {
                return Ok(());
            }
            return Err(anyhow!(
                "unit {unit_key} is already assigned to {} in experiment {experiment_id}",
                existing.as_str()
            ));
        }

        self.conn
            .execute(
                "INSERT INTO experiment_units(experiment_id, unit_key, group_label, assigned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![experiment_id, unit_key, group.as_str(), timestamp_now()?],
            )
            .context("failed to assign experiment unit")?;
        Ok(())
    }

    /// Sums the experiment metric per unit and month from valid silver rows
    /// and upserts one observation per `(unit, month)`. Re-running replaces
    /// values instead of stacking duplicates.
    pub fn snapshot_experiment(&mut self, experiment_id: &str) -> Result<SnapshotReport> {
        require_tables(&self.conn, "experiment snapshot", &["silver_events"])?;
        let experiment = self.require_experiment(experiment_id)?;
        let units = self.experiment_units(experiment_id)?;

        let rows: Vec<(String, Option<String>, Option<String>, String, f64)> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT substr(event_date, 1, 7), entity_id, payload_json, metric, value
                     FROM silver_events
                     WHERE is_valid = 1
                       AND dataset_id = ?1
                       AND event_date IS NOT NULL
                       AND metric IS NOT NULL
                       AND value IS NOT NULL
                     ORDER BY id ASC",
                )
                .context("failed to prepare experiment snapshot query")?;
            let mapped = stmt.query_map(params![experiment.dataset_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            collect_rows(mapped)?
        };

        let mut sums: BTreeMap<(String, String), f64> = BTreeMap::new();
        for (month, entity_id, payload_raw, metric, value) in rows {
            let Some(scale) = metric_scale(&experiment.metric, &metric) else {
                continue;
            };
            let unit_key = if experiment.unit_field == ENTITY_UNIT_FIELD {
                entity_id
            } else {
                payload_text(&payload_from_sql(payload_raw), &experiment.unit_field)
            };
            let Some(unit_key) = unit_key else {
                continue;
            };
            if units.contains_key(&unit_key) {
                *sums.entry((unit_key, month)).or_insert(0.0) += value * scale;
            }
        }

        let run_id = new_run_id();
        let observed_at = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start experiment snapshot transaction")?;
        for ((unit_key, month), value) in &sums {
            let Some(group) = units.get(unit_key) else {
                continue;
            };
            upsert_observation(
                &tx,
                experiment_id,
                unit_key,
                *group,
                month,
                &experiment.metric,
                *value,
                Some(&run_id),
                &observed_at,
            )?;
        }
        insert_audit(
            &tx,
            &run_id,
            "experiment_snapshot",
            AuditStatus::Success,
            &json!({
                "experiment_id": experiment_id,
                "units": units.len(),
                "observations": sums.len(),
            }),
        )?;
        tx.commit()
            .context("failed to commit experiment snapshot transaction")?;

        info!(run_id = %run_id, experiment_id, observations = sums.len(), "experiment snapshot complete");

        Ok(SnapshotReport {
            run_id,
            experiment_id: experiment_id.to_string(),
            units: units.len(),
            observations_written: sums.len(),
        })
    }

    /// Records an externally measured value for an assigned unit.
    pub fn record_observation(
        &mut self,
        experiment_id: &str,
        unit_key: &str,
        month: YearMonth,
        value: f64,
    ) -> Result<()> {
        let experiment = self.require_experiment(experiment_id)?;
        if !value.is_finite() {
            return Err(anyhow!("observation value MUST be finite"));
        }
        let group = self
            .unit_group(experiment_id, unit_key)?
            .ok_or_else(|| anyhow!("unit {unit_key} is not assigned in experiment {experiment_id}"))?;

        upsert_observation(
            &self.conn,
            experiment_id,
            unit_key,
            group,
            &month.to_string(),
            &experiment.metric,
            value,
            None,
            &timestamp_now()?,
        )
    }

    pub fn experiment_observations(&self, experiment_id: &str) -> Result<Vec<Observation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT unit_key, group_label, obs_month, value
                 FROM experiment_observations
                 WHERE experiment_id = ?1
                 ORDER BY obs_month ASC, unit_key ASC",
            )
            .context("failed to prepare observation query")?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            let group_raw: String = row.get(1)?;
            let month_raw: String = row.get(2)?;
            Ok((row.get::<_, String>(0)?, group_raw, month_raw, row.get::<_, f64>(3)?))
        })?;

        let mut observations = Vec::new();
        for (unit_key, group_raw, month_raw, value) in collect_rows(rows)? {
            let group = ExperimentGroup::parse(&group_raw)
                .ok_or_else(|| anyhow!("invalid stored group label: {group_raw}"))?;
            let month = month_raw.parse().map_err(crate::core_error)?;
            observations.push(Observation {
                unit_key,
                group,
                month,
                value,
            });
        }
        Ok(observations)
    }

    pub fn evaluate_experiment(&mut self, experiment_id: &str) -> Result<ExperimentEvaluation> {
        let experiment = self.require_experiment(experiment_id)?;
        let units = self.experiment_units(experiment_id)?;
        let observations = self.experiment_observations(experiment_id)?;

        if observations.is_empty() {
            warn!(experiment_id, "experiment has no observations; estimate is all zeros");
        }

        let estimate = evaluate_did(&observations, experiment.start_month);
        let treated_units = units
            .values()
            .filter(|group| **group == ExperimentGroup::Treated)
            .count();

        let run_id = new_run_id();
        insert_audit(
            &self.conn,
            &run_id,
            "causal",
            AuditStatus::Success,
            &json!({
                "experiment_id": experiment_id,
                "observations": estimate.observations,
                "did": estimate.did,
                "lift_pct": estimate.lift_pct,
            }),
        )?;
        info!(run_id = %run_id, experiment_id, did = estimate.did, lift_pct = estimate.lift_pct, "experiment evaluated");

        Ok(ExperimentEvaluation {
            run_id,
            treated_units,
            control_units: units.len() - treated_units,
            experiment,
            estimate,
        })
    }

    fn require_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        require_tables(
            &self.conn,
            "experiment",
            &["experiments", "experiment_units", "experiment_observations"],
        )?;
        self.get_experiment(experiment_id)?
            .ok_or_else(|| anyhow!("unknown experiment: {experiment_id}"))
    }

    fn unit_group(&self, experiment_id: &str, unit_key: &str) -> Result<Option<ExperimentGroup>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT group_label FROM experiment_units WHERE experiment_id = ?1 AND unit_key = ?2",
                params![experiment_id, unit_key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load unit assignment")?;

        raw.map(|label| {
            ExperimentGroup::parse(&label).ok_or_else(|| anyhow!("invalid stored group label: {label}"))
        })
        .transpose()
    }

    fn experiment_units(&self, experiment_id: &str) -> Result<BTreeMap<String, ExperimentGroup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT unit_key, group_label FROM experiment_units
                 WHERE experiment_id = ?1
                 ORDER BY unit_key ASC",
            )
            .context("failed to prepare unit query")?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut units = BTreeMap::new();
        for (unit_key, label) in collect_rows(rows)? {
            let group = ExperimentGroup::parse(&label)
                .ok_or_else(|| anyhow!("invalid stored group label: {label}"))?;
            units.insert(unit_key, group);
        }
        Ok(units)
    }
}

#[allow(clippy::too_many_arguments)]
fn upsert_observation(
    conn: &rusqlite::Connection,
    experiment_id: &str,
    unit_key: &str,
    group: ExperimentGroup,
    obs_month: &str,
    metric: &str,
    value: f64,
    snapshot_run_id: Option<&str>,
    observed_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO experiment_observations(
            experiment_id, unit_key, group_label, obs_month, metric, value, snapshot_run_id, observed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(experiment_id, unit_key, obs_month, metric) DO UPDATE SET
           group_label = excluded.group_label,
           value = excluded.value,
           snapshot_run_id = excluded.snapshot_run_id,
           observed_at = excluded.observed_at",
        params![
            experiment_id,
            unit_key,
            group.as_str(),
            obs_month,
            metric,
            value,
            snapshot_run_id,
            observed_at
        ],
    )
    .context("failed to upsert experiment observation")?;
    Ok(())
}
