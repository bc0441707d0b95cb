use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Severity;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityCounts {
    pub bronze_rows: i64,
    pub silver_rows: i64,
    pub silver_invalid_rows: i64,
    pub gold_rows: i64,
}

impl QualityCounts {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn invalid_ratio(&self) -> f64 {
        if self.silver_rows <= 0 {
            return 0.0;
        }
        self.silver_invalid_rows as f64 / self.silver_rows as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityIssue {
    pub check_name: String,
    pub severity: Severity,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySnapshot {
    pub counts: QualityCounts,
    pub invalid_ratio: f64,
    pub issues: Vec<QualityIssue>,
    pub checked_at: String,
}

impl QualitySnapshot {
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == Severity::Error)
            .count()
    }
}

/// Per-dataset valid silver row count for one expected dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCoverage {
    pub dataset_id: String,
    pub valid_rows: i64,
}

/// Aggregate trade-core sums for one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeConsistency {
    pub dataset_id: String,
    pub txn_amount: f64,
    pub txn_count: f64,
}

/// Derives the severity-tagged findings for one quality check run.
/// Findings are facts to record; nothing here fails.
#[must_use]
pub fn evaluate_quality(
    counts: &QualityCounts,
    coverage: &[DatasetCoverage],
    consistency: &[TradeConsistency],
    invalid_error_ratio: f64,
) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    let ratio = counts.invalid_ratio();
    if ratio > 0.0 {
        let severity = if ratio >= invalid_error_ratio {
            Severity::Error
        } else {
            Severity::Warn
        };
        issues.push(QualityIssue {
            check_name: "invalid_ratio".to_string(),
            severity,
            details: json!({
                "invalid_rows": counts.silver_invalid_rows,
                "silver_rows": counts.silver_rows,
                "ratio": ratio,
                "error_threshold": invalid_error_ratio,
            }),
        });
    }

    if counts.bronze_rows > 0 && counts.silver_rows == 0 {
        issues.push(QualityIssue {
            check_name: "silver_empty".to_string(),
            severity: Severity::Warn,
            details: json!({
                "bronze_rows": counts.bronze_rows,
                "message": "bronze has rows but the cleaning stage has not populated silver",
            }),
        });
    }

    // An empty gold layer only matters once silver has something to aggregate.
    if counts.gold_rows == 0 && counts.silver_rows > 0 {
        issues.push(QualityIssue {
            check_name: "gold_empty".to_string(),
            severity: Severity::Error,
            details: json!({
                "silver_rows": counts.silver_rows,
                "gold_rows": counts.gold_rows,
            }),
        });
    }

    for item in coverage {
        if item.valid_rows < 1 {
            issues.push(QualityIssue {
                check_name: format!("dataset_coverage:{}", item.dataset_id),
                severity: Severity::Warn,
                details: json!({
                    "dataset_id": item.dataset_id,
                    "valid_rows": item.valid_rows,
                }),
            });
        }
    }

    for item in consistency {
        if item.txn_amount > 0.0 && item.txn_count == 0.0 {
            issues.push(QualityIssue {
                check_name: format!("txn_amount_without_count:{}", item.dataset_id),
                severity: Severity::Error,
                details: json!({
                    "dataset_id": item.dataset_id,
                    "txn_amount": item.txn_amount,
                    "txn_count": item.txn_count,
                }),
            });
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(silver: i64, invalid: i64, gold: i64) -> QualityCounts {
        QualityCounts {
            bronze_rows: silver,
            silver_rows: silver,
            silver_invalid_rows: invalid,
            gold_rows: gold,
        }
    }

    fn severity_of(issues: &[QualityIssue], check: &str) -> Option<Severity> {
        issues
            .iter()
            .find(|issue| issue.check_name == check)
            .map(|issue| issue.severity)
    }

    #[test]
    fn invalid_ratio_at_threshold_is_error() {
        let issues = evaluate_quality(&counts(100, 5, 10), &[], &[], 0.05);
        assert_eq!(severity_of(&issues, "invalid_ratio"), Some(Severity::Error));
    }

    #[test]
    fn invalid_ratio_below_threshold_is_warn() {
        let issues = evaluate_quality(&counts(100, 4, 10), &[], &[], 0.05);
        assert_eq!(severity_of(&issues, "invalid_ratio"), Some(Severity::Warn));
    }

    #[test]
    fn clean_silver_emits_no_ratio_issue() {
        let issues = evaluate_quality(&counts(100, 0, 10), &[], &[], 0.05);
        assert!(issues.is_empty());
    }

    #[test]
    fn gold_empty_requires_non_empty_silver() {
        let fresh = evaluate_quality(&QualityCounts::default(), &[], &[], 0.05);
        assert_eq!(severity_of(&fresh, "gold_empty"), None);

        let broken = evaluate_quality(&counts(3, 0, 0), &[], &[], 0.05);
        assert_eq!(severity_of(&broken, "gold_empty"), Some(Severity::Error));
    }

    #[test]
    fn missing_dataset_coverage_warns() {
        let coverage = vec![
            DatasetCoverage {
                dataset_id: "table1".to_string(),
                valid_rows: 12,
            },
            DatasetCoverage {
                dataset_id: "table2".to_string(),
                valid_rows: 0,
            },
        ];
        let issues = evaluate_quality(&counts(12, 0, 4), &coverage, &[], 0.05);
        assert_eq!(
            severity_of(&issues, "dataset_coverage:table2"),
            Some(Severity::Warn)
        );
        assert_eq!(severity_of(&issues, "dataset_coverage:table1"), None);
    }

    #[test]
    fn amount_without_count_is_error() {
        let consistency = vec![TradeConsistency {
            dataset_id: "table1".to_string(),
            txn_amount: 320.0,
            txn_count: 0.0,
        }];
        let issues = evaluate_quality(&counts(5, 0, 5), &[], &consistency, 0.05);
        assert_eq!(
            severity_of(&issues, "txn_amount_without_count:table1"),
            Some(Severity::Error)
        );
    }

    #[test]
    fn silver_empty_warns_when_bronze_has_rows() {
        let counts = QualityCounts {
            bronze_rows: 9,
            ..QualityCounts::default()
        };
        let issues = evaluate_quality(&counts, &[], &[], 0.05);
        assert_eq!(severity_of(&issues, "silver_empty"), Some(Severity::Warn));
    }
}
