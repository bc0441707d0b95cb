//! Period-over-period attribution of metric deltas to dimension buckets.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketContribution {
    pub bucket: String,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
    pub contribution_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricBreakdown {
    pub metric: String,
    pub previous_total: f64,
    pub current_total: f64,
    pub total_delta: f64,
    pub buckets: usize,
    pub top_positive: Vec<BucketContribution>,
    pub top_negative: Vec<BucketContribution>,
}

impl MetricBreakdown {
    /// The bucket that dragged the metric down the most, if any fell.
    #[must_use]
    pub fn worst_contributor(&self) -> Option<&BucketContribution> {
        self.top_negative.first()
    }
}

/// Splits the delta between two periods across every bucket seen in
/// either period.
///
/// Ranking uses the raw delta rather than the ratio: the ratio is unstable
/// when the total delta is close to zero. Equal deltas order by bucket key.
#[must_use]
pub fn decompose_metric(
    metric: &str,
    previous: &BTreeMap<String, f64>,
    current: &BTreeMap<String, f64>,
    top_n: usize,
) -> MetricBreakdown {
    let previous_total: f64 = previous.values().sum();
    let current_total: f64 = current.values().sum();
    let total_delta = current_total - previous_total;

    let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
    let contributions: Vec<BucketContribution> = keys
        .into_iter()
        .map(|bucket| {
            let prev = previous.get(bucket).copied().unwrap_or(0.0);
            let curr = current.get(bucket).copied().unwrap_or(0.0);
            let delta = curr - prev;
            let contribution_ratio = if total_delta == 0.0 {
                0.0
            } else {
                delta / total_delta
            };
            BucketContribution {
                bucket: bucket.clone(),
                previous: prev,
                current: curr,
                delta,
                contribution_ratio,
            }
        })
        .collect();

    let buckets = contributions.len();

    let mut positive: Vec<BucketContribution> = contributions
        .iter()
        .filter(|item| item.delta > 0.0)
        .cloned()
        .collect();
    positive.sort_by(|lhs, rhs| {
        rhs.delta
            .partial_cmp(&lhs.delta)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.bucket.cmp(&rhs.bucket))
    });
    positive.truncate(top_n);

    let mut negative: Vec<BucketContribution> = contributions
        .into_iter()
        .filter(|item| item.delta < 0.0)
        .collect();
    negative.sort_by(|lhs, rhs| {
        lhs.delta
            .partial_cmp(&rhs.delta)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.bucket.cmp(&rhs.bucket))
    });
    negative.truncate(top_n);

    MetricBreakdown {
        metric: metric.to_string(),
        previous_total,
        current_total,
        total_delta,
        buckets,
        top_positive: positive,
        top_negative: negative,
    }
}

/// Joins dimension values into a bucket key, e.g. `guangdong|kiosk`.
#[must_use]
pub fn bucket_key(values: &[Option<String>]) -> String {
    values
        .iter()
        .map(|value| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .unwrap_or("unknown")
        })
        .collect::<Vec<_>>()
        .join("|")
}
