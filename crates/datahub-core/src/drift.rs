use serde::{Deserialize, Serialize};

use crate::{Severity, YearMonth};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MonthlyValue {
    pub month: YearMonth,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftFinding {
    pub dataset_id: String,
    pub metric: String,
    pub current_month: YearMonth,
    pub previous_month: YearMonth,
    pub previous_value: f64,
    pub current_value: f64,
    pub drift_ratio: f64,
    pub severity: Severity,
}

/// `|curr - prev| / |prev|`, undefined when `prev == 0`.
#[must_use]
pub fn drift_ratio(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    Some((current - previous).abs() / previous.abs())
}

/// Both boundaries are inclusive.
#[must_use]
pub fn classify_drift(ratio: f64, warn_ratio: f64, error_ratio: f64) -> Option<Severity> {
    if ratio >= error_ratio {
        Some(Severity::Error)
    } else if ratio >= warn_ratio {
        Some(Severity::Warn)
    } else {
        None
    }
}

/// Compares each adjacent pair of months in `series` (sorted by month
/// first) and returns the pairs whose ratio crosses a threshold.
#[must_use]
pub fn detect_drift(
    dataset_id: &str,
    metric: &str,
    series: &[MonthlyValue],
    warn_ratio: f64,
    error_ratio: f64,
) -> Vec<DriftFinding> {
    let mut ordered = series.to_vec();
    ordered.sort_by_key(|point| point.month);

    ordered
        .windows(2)
        .filter_map(|pair| {
            let (previous, current) = (pair[0], pair[1]);
            let ratio = drift_ratio(previous.value, current.value)?;
            let severity = classify_drift(ratio, warn_ratio, error_ratio)?;
            Some(DriftFinding {
                dataset_id: dataset_id.to_string(),
                metric: metric.to_string(),
                current_month: current.month,
                previous_month: previous.month,
                previous_value: previous.value,
                current_value: current.value,
                drift_ratio: ratio,
                severity,
            })
        })
        .collect()
}
