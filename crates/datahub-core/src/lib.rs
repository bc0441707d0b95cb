//! Domain types and algorithms for the DataHub analytics pipeline.
//!
//! Everything in this crate is pure: no file or database I/O. The
//! `datahub-store-sqlite` crate feeds it rows read from the medallion
//! tables and persists what it returns.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod causal;
pub mod config;
pub mod decision;
pub mod drift;
pub mod factor;
pub mod forecast;
pub mod gold;
pub mod quality;
pub mod row;

pub use causal::{evaluate_did, DidEstimate, ExperimentGroup, Observation};
pub use config::{
    DatasetRule, DecisionConfig, DriftConfig, FactorConfig, ForecastConfig, IngestConfig,
    PipelineConfig, QualityConfig,
};
pub use decision::{
    build_candidates, policy_weight, rank_actions, ActionCandidate, DecisionInputs,
    FactorSignal, FeedbackOutcome, ForecastSignal, PolicyTally, RankedAction,
};
pub use drift::{classify_drift, detect_drift, drift_ratio, DriftFinding, MonthlyValue};
pub use factor::{bucket_key, decompose_metric, BucketContribution, MetricBreakdown};
pub use forecast::{forecast, ForecastModel, ForecastPoint, ForecastResult, ModelScore};
pub use gold::{
    canonical_trade_metric, metric_scale, trade_metric_names, TradeCoreTotals, TradeField,
};
pub use quality::{
    evaluate_quality, DatasetCoverage, QualityCounts, QualityIssue, QualitySnapshot,
    TradeConsistency,
};
pub use row::{
    infer_dataset_from_filename, infer_dataset_from_metric, normalize_record, parse_jsonl_line,
    resolve_dataset_id, RawRow, RowParseError, UNKNOWN_DATASET,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DataHubError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Severity attached to quality issues and drift events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Calendar month, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u8,
}

impl YearMonth {
    /// Builds a month, rejecting out-of-range month numbers.
    ///
    /// # Errors
    /// Returns [`DataHubError::Validation`] when `month` is not in `1..=12`.
    pub fn new(year: i32, month: u8) -> Result<Self, DataHubError> {
        if !(1..=12).contains(&month) {
            return Err(DataHubError::Validation(format!(
                "month MUST be in 1..=12, got {month}"
            )));
        }
        Ok(Self { year, month })
    }

    #[must_use]
    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    #[must_use]
    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl Display for YearMonth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = DataHubError;

    /// Accepts `YYYY-MM` and any longer date string starting with it
    /// (`YYYY-MM-DD`, RFC3339 timestamps).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let head = value.get(..7).ok_or_else(|| {
            DataHubError::Parse(format!("month must be formatted YYYY-MM: {value}"))
        })?;
        let (year_raw, month_raw) = head
            .split_once('-')
            .ok_or_else(|| DataHubError::Parse(format!("month must be formatted YYYY-MM: {value}")))?;
        let year: i32 = year_raw
            .parse()
            .map_err(|_| DataHubError::Parse(format!("invalid year in month: {value}")))?;
        let month: u8 = month_raw
            .parse()
            .map_err(|_| DataHubError::Parse(format!("invalid month number: {value}")))?;
        Self::new(year, month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DataHubError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DataHubError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DataHubError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DataHubError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DataHubError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DataHubError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            DataHubError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn year_month_parses_dates_and_timestamps() {
        let month: YearMonth = must_ok("2026-03-14T08:00:00Z".parse());
        assert_eq!(month, YearMonth { year: 2026, month: 3 });
        assert_eq!(month.to_string(), "2026-03");

        let plain: YearMonth = must_ok("2025-11".parse());
        assert_eq!(plain.to_string(), "2025-11");
    }

    #[test]
    fn year_month_rolls_over_year_boundaries() {
        let january = must_ok(YearMonth::new(2026, 1));
        assert_eq!(january.previous().to_string(), "2025-12");
        assert_eq!(january.previous().next(), january);
    }

    #[test]
    fn year_month_rejects_garbage() {
        assert!("2026-13".parse::<YearMonth>().is_err());
        assert!("26-1".parse::<YearMonth>().is_err());
        assert!("abcd-ef".parse::<YearMonth>().is_err());
    }

    #[test]
    fn severity_round_trips_storage_labels() {
        for severity in [Severity::Warn, Severity::Error] {
            assert_eq!(Severity::parse(severity.as_str()), Some(severity));
        }
        assert_eq!(Severity::parse("warn"), None);
    }
}
