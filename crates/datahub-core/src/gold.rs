//! Canonical trade-core shape for the gold layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradeField {
    TxnCount,
    TxnAmount,
    BenefitAmount,
    FeeIncome,
}

impl TradeField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TxnCount => "txn_count",
            Self::TxnAmount => "txn_amount",
            Self::BenefitAmount => "benefit_amount",
            Self::FeeIncome => "fee_income",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "txn_count" => Some(Self::TxnCount),
            "txn_amount" => Some(Self::TxnAmount),
            "benefit_amount" => Some(Self::BenefitAmount),
            "fee_income" => Some(Self::FeeIncome),
            _ => None,
        }
    }
}

const CENT_TO_YUAN: f64 = 0.01;

// Raw metric name -> (canonical field, multiplier applied to the summed value).
const TRADE_METRICS: &[(&str, TradeField, f64)] = &[
    ("txn_count", TradeField::TxnCount, 1.0),
    ("order_count", TradeField::TxnCount, 1.0),
    ("txn_amount", TradeField::TxnAmount, 1.0),
    ("txn_amount_cent", TradeField::TxnAmount, CENT_TO_YUAN),
    ("benefit_amount", TradeField::BenefitAmount, 1.0),
    ("benefit_amount_cent", TradeField::BenefitAmount, CENT_TO_YUAN),
    ("fee_income", TradeField::FeeIncome, 1.0),
    ("fee_income_cent", TradeField::FeeIncome, CENT_TO_YUAN),
];

/// Looks up the canonical field and unit multiplier for a raw metric name.
#[must_use]
pub fn canonical_trade_metric(metric: &str) -> Option<(TradeField, f64)> {
    TRADE_METRICS
        .iter()
        .find(|(name, _, _)| *name == metric)
        .map(|(_, field, scale)| (*field, *scale))
}

/// All raw metric names that feed the trade-core table.
#[must_use]
pub fn trade_metric_names() -> Vec<&'static str> {
    TRADE_METRICS.iter().map(|(name, _, _)| *name).collect()
}

/// Multiplier that converts a raw `metric` into `requested`. A canonical
/// trade field name also matches its aliases (`txn_amount` matches
/// `txn_amount_cent` at 0.01); any other name only matches itself.
#[must_use]
pub fn metric_scale(requested: &str, metric: &str) -> Option<f64> {
    if requested == metric {
        return Some(1.0);
    }
    let field = TradeField::parse(requested)?;
    match canonical_trade_metric(metric) {
        Some((mapped, scale)) if mapped == field => Some(scale),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TradeCoreTotals {
    pub txn_count: f64,
    pub txn_amount: f64,
    pub benefit_amount: f64,
    pub fee_income: f64,
}

impl TradeCoreTotals {
    /// Folds a summed raw metric into the canonical totals. Returns `false`
    /// when the metric does not map onto the trade core.
    pub fn add(&mut self, metric: &str, summed_value: f64) -> bool {
        let Some((field, scale)) = canonical_trade_metric(metric) else {
            return false;
        };
        let converted = summed_value * scale;
        match field {
            TradeField::TxnCount => self.txn_count += converted,
            TradeField::TxnAmount => self.txn_amount += converted,
            TradeField::BenefitAmount => self.benefit_amount += converted,
            TradeField::FeeIncome => self.fee_income += converted,
        }
        true
    }

    #[must_use]
    pub fn get(&self, field: TradeField) -> f64 {
        match field {
            TradeField::TxnCount => self.txn_count,
            TradeField::TxnAmount => self.txn_amount,
            TradeField::BenefitAmount => self.benefit_amount,
            TradeField::FeeIncome => self.fee_income,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cent_metrics_convert_to_yuan() {
        let mut totals = TradeCoreTotals::default();
        assert!(totals.add("txn_amount", 10.0));
        assert!(totals.add("txn_amount_cent", 250.0));
        assert!(totals.add("fee_income_cent", 100.0));
        assert!((totals.txn_amount - 12.5).abs() < 1e-9);
        assert!((totals.fee_income - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unmapped_metrics_are_ignored() {
        let mut totals = TradeCoreTotals::default();
        assert!(!totals.add("active_merchants", 40.0));
        assert_eq!(totals, TradeCoreTotals::default());
    }

    #[test]
    fn order_count_counts_as_transactions() {
        let mut totals = TradeCoreTotals::default();
        totals.add("order_count", 3.0);
        totals.add("txn_count", 2.0);
        assert!((totals.get(TradeField::TxnCount) - 5.0).abs() < 1e-9);
        assert!(trade_metric_names().contains(&"order_count"));
    }

    #[test]
    fn metric_scale_follows_canonical_aliases() {
        assert_eq!(metric_scale("txn_amount", "txn_amount_cent"), Some(0.01));
        assert_eq!(metric_scale("txn_count", "order_count"), Some(1.0));
        assert_eq!(metric_scale("active_merchants", "active_merchants"), Some(1.0));
        assert_eq!(metric_scale("txn_amount", "fee_income"), None);
        assert_eq!(metric_scale("new_merchants", "active_merchants"), None);
    }
}
