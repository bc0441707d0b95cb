use serde::{Deserialize, Serialize};

use crate::DataHubError;

/// Runtime configuration handed to every pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub quality: QualityConfig,
    pub drift: DriftConfig,
    pub factor: FactorConfig,
    pub forecast: ForecastConfig,
    pub decision: DecisionConfig,
    pub datasets: Vec<DatasetRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    pub invalid_error_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriftConfig {
    pub warn_ratio: f64,
    pub error_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FactorConfig {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForecastConfig {
    pub horizon_months: usize,
    pub min_train: usize,
    pub std_window: usize,
    pub z_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub amount_drop_threshold: f64,
    pub count_drop_threshold: f64,
}

/// Maps a dataset id to the filename fragments and metric names that
/// identify its rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetRule {
    pub dataset_id: String,
    #[serde(default)]
    pub filename_patterns: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            quality: QualityConfig::default(),
            drift: DriftConfig::default(),
            factor: FactorConfig::default(),
            forecast: ForecastConfig::default(),
            decision: DecisionConfig::default(),
            datasets: default_dataset_rules(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            extensions: vec!["csv".to_string(), "jsonl".to_string()],
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            invalid_error_ratio: 0.05,
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            warn_ratio: 0.20,
            error_ratio: 0.35,
        }
    }
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            dimensions: vec!["province".to_string(), "micro_type".to_string()],
            metrics: vec!["txn_amount".to_string(), "txn_count".to_string()],
            top_n: 5,
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_months: 3,
            min_train: 4,
            std_window: 6,
            z_score: 1.64,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            amount_drop_threshold: 0.10,
            count_drop_threshold: 0.08,
        }
    }
}

fn default_dataset_rules() -> Vec<DatasetRule> {
    let rule = |dataset_id: &str, metrics: &[&str]| DatasetRule {
        dataset_id: dataset_id.to_string(),
        filename_patterns: vec![dataset_id.to_string()],
        metrics: metrics.iter().map(|item| (*item).to_string()).collect(),
    };

    vec![
        rule(
            "table1",
            &["txn_count", "txn_amount", "txn_amount_cent", "order_count"],
        ),
        rule(
            "table2",
            &[
                "benefit_amount",
                "benefit_amount_cent",
                "fee_income",
                "fee_income_cent",
            ],
        ),
        rule("table3", &["active_merchants", "new_merchants"]),
    ]
}

impl PipelineConfig {
    /// Validates numeric bounds and threshold ordering.
    ///
    /// # Errors
    /// Returns [`DataHubError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), DataHubError> {
        if self.ingest.batch_size == 0 {
            return Err(DataHubError::Configuration(
                "ingest.batch_size MUST be >= 1".to_string(),
            ));
        }

        if self.ingest.extensions.is_empty() {
            return Err(DataHubError::Configuration(
                "ingest.extensions MUST list at least one extension".to_string(),
            ));
        }

        for (name, value) in [
            ("quality.invalid_error_ratio", self.quality.invalid_error_ratio),
            ("drift.warn_ratio", self.drift.warn_ratio),
            ("drift.error_ratio", self.drift.error_ratio),
            (
                "decision.amount_drop_threshold",
                self.decision.amount_drop_threshold,
            ),
            (
                "decision.count_drop_threshold",
                self.decision.count_drop_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DataHubError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.drift.warn_ratio > self.drift.error_ratio {
            return Err(DataHubError::Configuration(
                "drift.warn_ratio cannot exceed drift.error_ratio".to_string(),
            ));
        }

        if self.factor.top_n == 0 {
            return Err(DataHubError::Configuration(
                "factor.top_n MUST be >= 1".to_string(),
            ));
        }

        if self.factor.dimensions.is_empty() {
            return Err(DataHubError::Configuration(
                "factor.dimensions MUST name at least one payload field".to_string(),
            ));
        }

        if self.forecast.min_train == 0 || self.forecast.std_window == 0 {
            return Err(DataHubError::Configuration(
                "forecast.min_train and forecast.std_window MUST be >= 1".to_string(),
            ));
        }

        if self.forecast.z_score <= 0.0 {
            return Err(DataHubError::Configuration(
                "forecast.z_score MUST be positive".to_string(),
            ));
        }

        for rule in &self.datasets {
            if rule.dataset_id.trim().is_empty() {
                return Err(DataHubError::Configuration(
                    "datasets[].dataset_id MUST be provided".to_string(),
                ));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn expected_datasets(&self) -> Vec<String> {
        self.datasets
            .iter()
            .map(|rule| rule.dataset_id.clone())
            .collect()
    }
}
