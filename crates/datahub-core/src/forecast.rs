//! Backtested model selection over short monthly series.

use serde::{Deserialize, Serialize};

use crate::config::ForecastConfig;
use crate::drift::MonthlyValue;
use crate::{DataHubError, YearMonth};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    Naive,
    MovingAverage3,
    Linear,
}

impl ForecastModel {
    /// Candidate order doubles as the tie-break: the first model with the
    /// lowest MAPE wins.
    pub const CANDIDATES: [Self; 3] = [Self::Naive, Self::MovingAverage3, Self::Linear];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::MovingAverage3 => "ma3",
            Self::Linear => "linear",
        }
    }

    /// One-step-ahead prediction from `history`. Returns 0.0 for an empty
    /// history.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn predict(self, history: &[f64]) -> f64 {
        let Some(last) = history.last() else {
            return 0.0;
        };

        match self {
            Self::Naive => *last,
            Self::MovingAverage3 => {
                let window = &history[history.len().saturating_sub(3)..];
                window.iter().sum::<f64>() / window.len() as f64
            }
            Self::Linear => {
                let (slope, intercept) = linear_fit(history);
                slope * history.len() as f64 + intercept
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelScore {
    pub model: ForecastModel,
    pub mape: Option<f64>,
    pub backtest_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub month: YearMonth,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastResult {
    pub model: ForecastModel,
    pub backtest_mape: Option<f64>,
    pub candidates: Vec<ModelScore>,
    pub last_actual: MonthlyValue,
    pub std_dev: f64,
    pub predictions: Vec<ForecastPoint>,
}

impl ForecastResult {
    /// Relative drop from the last actual to the first prediction; positive
    /// when the forecast falls. `None` when the last actual is zero.
    #[must_use]
    pub fn implied_drop(&self) -> Option<f64> {
        let first = self.predictions.first()?;
        if self.last_actual.value == 0.0 {
            return None;
        }
        Some((self.last_actual.value - first.value) / self.last_actual.value.abs())
    }
}

/// Selects a model by rolling one-step backtest and projects
/// `horizon_months` ahead.
///
/// The interval is `pred ± z·std` where std is the population deviation of
/// the trailing `std_window` actuals, not of model residuals.
///
/// # Errors
/// Returns [`DataHubError::Validation`] for an empty series.
pub fn forecast(
    series: &[MonthlyValue],
    horizon_months: usize,
    config: &ForecastConfig,
) -> Result<ForecastResult, DataHubError> {
    let mut ordered = series.to_vec();
    ordered.sort_by_key(|point| point.month);

    let Some(last_actual) = ordered.last().copied() else {
        return Err(DataHubError::Validation(
            "forecast requires at least one observation".to_string(),
        ));
    };

    let values: Vec<f64> = ordered.iter().map(|point| point.value).collect();

    let candidates: Vec<ModelScore> = ForecastModel::CANDIDATES
        .iter()
        .map(|model| backtest(*model, &values, config.min_train))
        .collect();

    let mut best = &candidates[0];
    for candidate in &candidates[1..] {
        if mape_rank(candidate.mape) < mape_rank(best.mape) {
            best = candidate;
        }
    }
    let model = best.model;
    let backtest_mape = best.mape;

    let std_dev = trailing_std(&values, config.std_window);
    let band = config.z_score * std_dev;

    let mut extended = values;
    let mut month = last_actual.month;
    let mut predictions = Vec::with_capacity(horizon_months);
    for _ in 0..horizon_months {
        let value = model.predict(&extended);
        month = month.next();
        predictions.push(ForecastPoint {
            month,
            value,
            lower: value - band,
            upper: value + band,
        });
        extended.push(value);
    }

    Ok(ForecastResult {
        model,
        backtest_mape,
        candidates,
        last_actual,
        std_dev,
        predictions,
    })
}

fn backtest(model: ForecastModel, values: &[f64], min_train: usize) -> ModelScore {
    let mut errors = Vec::new();
    for index in min_train.max(1)..values.len() {
        let actual = values[index];
        if actual == 0.0 {
            continue;
        }
        let predicted = model.predict(&values[..index]);
        errors.push((predicted - actual).abs() / actual.abs());
    }

    #[allow(clippy::cast_precision_loss)]
    let mape = (!errors.is_empty()).then(|| errors.iter().sum::<f64>() / errors.len() as f64);

    ModelScore {
        model,
        mape,
        backtest_points: errors.len(),
    }
}

fn mape_rank(mape: Option<f64>) -> f64 {
    mape.unwrap_or(f64::INFINITY)
}

#[allow(clippy::cast_precision_loss)]
fn linear_fit(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (index, value) in values.iter().enumerate() {
        let dx = index as f64 - mean_x;
        numerator += dx * (value - mean_y);
        denominator += dx * dx;
    }

    let slope = if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    };
    (slope, mean_y - slope * mean_x)
}

#[allow(clippy::cast_precision_loss)]
fn trailing_std(values: &[f64], window: usize) -> f64 {
    let tail = &values[values.len().saturating_sub(window)..];
    if tail.len() < 2 {
        return 0.0;
    }
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    let variance = tail.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / tail.len() as f64;
    variance.sqrt()
}
