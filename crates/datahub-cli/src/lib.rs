//! Command surface for the DataHub pipeline.
//!
//! Callers that embed the pipeline should go through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_pipeline_with_db`] for a single [`PipelineCommand`] against a DB path.
//! - [`run_pipeline`] for execution against an open [`SqliteDataHub`].
//!
//! Every stage prints its report as pretty JSON on stdout. Stages that
//! produce an artifact also write it to `<log_dir>/<stage>_latest.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use datahub_core::{ExperimentGroup, PipelineConfig, TradeField, YearMonth};
use datahub_store_sqlite::{
    DriftReport, ExperimentInput, FeedbackInput, SilverEventInput, SqliteDataHub,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "datahub")]
#[command(about = "DataHub analytics pipeline CLI")]
pub struct Cli {
    #[arg(long, default_value = "./datahub.sqlite3")]
    db: PathBuf,

    /// TOML pipeline configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: PipelineCommand,
}

#[derive(Debug, Subcommand)]
pub enum PipelineCommand {
    /// Create or upgrade the schema and backfill dataset ids.
    Init,
    Ingest(IngestArgs),
    /// Load cleaned rows (JSON array or JSONL) into silver_events.
    Silver(SilverArgs),
    /// Rebuild the gold tables from valid silver rows.
    Aggregate,
    Quality,
    Drift(DriftArgs),
    Factor(FactorArgs),
    Forecast(ForecastArgs),
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    Decide,
    Feedback(FeedbackArgs),
    /// Recompute action weights from the feedback ledger.
    Learn,
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    import_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct SilverArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct DriftArgs {
    /// Dataset to monitor; every gold dataset when omitted.
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    warn_ratio: Option<f64>,
    #[arg(long)]
    error_ratio: Option<f64>,
}

#[derive(Debug, Args)]
pub struct FactorArgs {
    #[arg(long)]
    dataset: String,
    /// Month to explain; the latest gold month when omitted.
    #[arg(long)]
    month: Option<YearMonth>,
    #[arg(long = "metric")]
    metrics: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    #[arg(long)]
    dataset: String,
    #[arg(long, default_value = "txn_amount", value_parser = parse_trade_field)]
    field: TradeField,
    #[arg(long)]
    horizon: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    Create(ExperimentCreateArgs),
    Assign(ExperimentAssignArgs),
    Snapshot(ExperimentIdArgs),
    Observe(ExperimentObserveArgs),
    Show(ExperimentIdArgs),
    Evaluate(ExperimentIdArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentCreateArgs {
    #[arg(long)]
    experiment_id: Option<String>,
    #[arg(long)]
    name: String,
    #[arg(long)]
    dataset: String,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    start_month: YearMonth,
    #[arg(long, default_value = "entity_id")]
    unit_field: String,
}

#[derive(Debug, Args)]
pub struct ExperimentAssignArgs {
    #[arg(long)]
    experiment_id: String,
    #[arg(long)]
    group: GroupArg,
    #[arg(long = "unit", required = true)]
    units: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExperimentIdArgs {
    #[arg(long)]
    experiment_id: String,
}

#[derive(Debug, Args)]
pub struct ExperimentObserveArgs {
    #[arg(long)]
    experiment_id: String,
    #[arg(long)]
    unit: String,
    #[arg(long)]
    month: YearMonth,
    #[arg(long)]
    value: f64,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    #[arg(long)]
    action_name: String,
    #[arg(long)]
    action_owner: Option<String>,
    #[arg(long)]
    executed: bool,
    #[arg(long)]
    exec_month: Option<YearMonth>,
    #[arg(long)]
    target_metric: Option<String>,
    #[arg(long)]
    baseline_value: Option<f64>,
    #[arg(long)]
    actual_value: Option<f64>,
    #[arg(long)]
    roi_score: Option<f64>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long)]
    stage: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GroupArg {
    Treated,
    Control,
}

impl PipelineCommand {
    /// Audit stage a failure of this command is filed under.
    fn audit_stage(&self) -> Option<&'static str> {
        match self {
            Self::Init | Self::Audit(_) => None,
            Self::Ingest(_) => Some("ingest"),
            Self::Silver(_) => Some("silver"),
            Self::Aggregate => Some("gold"),
            Self::Quality => Some("quality"),
            Self::Drift(_) => Some("drift"),
            Self::Factor(_) => Some("factor"),
            Self::Forecast(_) => Some("forecast"),
            Self::Experiment { command } => match command.as_ref() {
                ExperimentCommand::Snapshot(_) => Some("experiment_snapshot"),
                ExperimentCommand::Evaluate(_) => Some("causal"),
                _ => Some("experiment"),
            },
            Self::Decide => Some("decision"),
            Self::Feedback(_) => Some("feedback"),
            Self::Learn => Some("policy"),
        }
    }
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the configuration cannot be loaded, the store
/// cannot be opened, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_pipeline_with_db(&cli.db, config, &cli.log_dir, cli.command)
}

/// Opens the `SQLite` database at `db_path` and executes one command.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_pipeline_with_db(
    db_path: &Path,
    config: PipelineConfig,
    log_dir: &Path,
    command: PipelineCommand,
) -> Result<()> {
    let mut hub = SqliteDataHub::open(db_path, config)?;
    run_pipeline(command, &mut hub, log_dir)
}

/// Executes one command against an open store. The schema is brought up
/// to date first, and a failed stage leaves a `failed` audit record.
///
/// # Errors
/// Returns an error when migration, the stage itself, or artifact output
/// fails.
pub fn run_pipeline(
    command: PipelineCommand,
    hub: &mut SqliteDataHub,
    log_dir: &Path,
) -> Result<()> {
    let migration = hub.initialize()?;
    if matches!(command, PipelineCommand::Init) {
        return emit(log_dir, None, &migration);
    }

    let stage = command.audit_stage();
    let result = run_stage(command, hub, log_dir);
    if let (Err(err), Some(stage)) = (&result, stage) {
        if let Err(audit_err) = hub.record_stage_failure(stage, &format!("{err:#}")) {
            warn!(stage, error = %audit_err, "failed to record stage failure");
        }
    }
    result
}

fn run_stage(command: PipelineCommand, hub: &mut SqliteDataHub, log_dir: &Path) -> Result<()> {
    match command {
        PipelineCommand::Init => Err(anyhow!(
            "internal dispatch error: init is handled before stage dispatch"
        )),
        PipelineCommand::Ingest(args) => {
            let report = hub.ingest(&args.import_dir)?;
            emit(log_dir, Some("ingest"), &report)
        }
        PipelineCommand::Silver(args) => {
            let events = read_silver_events(&args.input)?;
            let report = hub.insert_silver_events(&events)?;
            emit(log_dir, Some("silver"), &report)
        }
        PipelineCommand::Aggregate => {
            let report = hub.rebuild_gold()?;
            emit(log_dir, Some("gold"), &report)
        }
        PipelineCommand::Quality => {
            let report = hub.check_quality()?;
            emit(log_dir, Some("quality"), &report)
        }
        PipelineCommand::Drift(args) => run_drift(&args, hub, log_dir),
        PipelineCommand::Factor(args) => {
            let month = match args.month {
                Some(month) => month,
                None => hub.latest_gold_month(&args.dataset)?.ok_or_else(|| {
                    anyhow!("no gold months for dataset {}; pass --month", args.dataset)
                })?,
            };
            let metrics = if args.metrics.is_empty() {
                hub.config().factor.metrics.clone()
            } else {
                args.metrics
            };
            let report = hub.decompose_factors(&args.dataset, &metrics, month)?;
            emit(log_dir, Some("factor"), &report)
        }
        PipelineCommand::Forecast(args) => {
            let report = hub.forecast_trade(&args.dataset, args.field, args.horizon)?;
            emit(log_dir, Some("forecast"), &report)
        }
        PipelineCommand::Experiment { command } => run_experiment(*command, hub, log_dir),
        PipelineCommand::Decide => {
            let report = hub.decide()?;
            emit(log_dir, Some("decision"), &report)
        }
        PipelineCommand::Feedback(args) => {
            let input = FeedbackInput {
                action_name: args.action_name,
                action_owner: args.action_owner,
                executed: args.executed,
                exec_month: args.exec_month,
                target_metric: args.target_metric,
                baseline_value: args.baseline_value,
                actual_value: args.actual_value,
                roi_score: args.roi_score,
                note: args.note,
            };
            let feedback_id = hub.record_feedback(&input)?;
            emit(
                log_dir,
                None,
                &json!({ "feedback_id": feedback_id, "feedback": input }),
            )
        }
        PipelineCommand::Learn => {
            let report = hub.learn_policy()?;
            emit(log_dir, Some("policy"), &report)
        }
        PipelineCommand::Audit(args) => {
            let records = hub.audit_trail(args.stage.as_deref(), args.limit)?;
            emit(log_dir, None, &records)
        }
    }
}

fn run_drift(args: &DriftArgs, hub: &mut SqliteDataHub, log_dir: &Path) -> Result<()> {
    let warn_ratio = args.warn_ratio.unwrap_or(hub.config().drift.warn_ratio);
    let error_ratio = args.error_ratio.unwrap_or(hub.config().drift.error_ratio);
    let datasets = match &args.dataset {
        Some(dataset) => vec![dataset.clone()],
        None => hub.gold_datasets()?,
    };

    let reports = datasets
        .iter()
        .map(|dataset| hub.monitor_drift(dataset, warn_ratio, error_ratio))
        .collect::<Result<Vec<DriftReport>>>()?;
    emit(log_dir, Some("drift"), &reports)
}

fn run_experiment(
    command: ExperimentCommand,
    hub: &mut SqliteDataHub,
    log_dir: &Path,
) -> Result<()> {
    match command {
        ExperimentCommand::Create(args) => {
            let experiment = hub.create_experiment(&ExperimentInput {
                experiment_id: args.experiment_id,
                name: args.name,
                dataset_id: args.dataset,
                metric: args.metric,
                start_month: args.start_month,
                unit_field: args.unit_field,
            })?;
            emit(log_dir, None, &experiment)
        }
        ExperimentCommand::Assign(args) => {
            let group = map_group(args.group);
            for unit in &args.units {
                hub.assign_unit(&args.experiment_id, unit, group)?;
            }
            emit(
                log_dir,
                None,
                &json!({
                    "experiment_id": args.experiment_id,
                    "group": group.as_str(),
                    "units": args.units,
                }),
            )
        }
        ExperimentCommand::Snapshot(args) => {
            let report = hub.snapshot_experiment(&args.experiment_id)?;
            emit(log_dir, None, &report)
        }
        ExperimentCommand::Observe(args) => {
            hub.record_observation(&args.experiment_id, &args.unit, args.month, args.value)?;
            emit(
                log_dir,
                None,
                &json!({
                    "experiment_id": args.experiment_id,
                    "unit_key": args.unit,
                    "month": args.month,
                    "value": args.value,
                }),
            )
        }
        ExperimentCommand::Show(args) => {
            let Some(experiment) = hub.get_experiment(&args.experiment_id)? else {
                return Err(anyhow!("experiment not found: {}", args.experiment_id));
            };
            let observations = hub.experiment_observations(&args.experiment_id)?;
            emit(
                log_dir,
                None,
                &json!({ "experiment": experiment, "observations": observations }),
            )
        }
        ExperimentCommand::Evaluate(args) => {
            let evaluation = hub.evaluate_experiment(&args.experiment_id)?;
            emit(log_dir, Some("causal"), &evaluation)
        }
    }
}

/// Reads the optional TOML configuration and validates it.
///
/// # Errors
/// Returns an error when the file cannot be read, is not valid TOML for
/// [`PipelineConfig`], or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: PipelineConfig = toml::from_str(&raw)
        .with_context(|| format!("invalid pipeline config {}", path.display()))?;
    config
        .validate()
        .map_err(|err| anyhow!("invalid pipeline config {}: {err}", path.display()))?;
    Ok(config)
}

/// Accepts a JSON array of rows, or one JSON object per line.
fn read_silver_events(path: &Path) -> Result<Vec<SilverEventInput>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read silver input {}", path.display()))?;

    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(&raw)
            .with_context(|| format!("invalid silver JSON array in {}", path.display()));
    }

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("invalid silver row at {}:{}", path.display(), index + 1)
            })
        })
        .collect()
}

fn emit<T: Serialize>(log_dir: &Path, artifact: Option<&str>, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    if let Some(stage) = artifact {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let path = log_dir.join(format!("{stage}_latest.json"));
        fs::write(&path, &rendered)
            .with_context(|| format!("failed writing artifact to {}", path.display()))?;
        info!(stage, path = %path.display(), "artifact written");
    }
    println!("{rendered}");
    Ok(())
}

fn parse_trade_field(raw: &str) -> Result<TradeField, String> {
    TradeField::parse(raw).ok_or_else(|| {
        format!("unknown trade field {raw}; expected txn_count, txn_amount, benefit_amount or fee_income")
    })
}

fn map_group(value: GroupArg) -> ExperimentGroup {
    match value {
        GroupArg::Treated => ExperimentGroup::Treated,
        GroupArg::Control => ExperimentGroup::Control,
    }
}
