use anyhow::{anyhow, Result};
use datahub_core::{forecast, ForecastResult, TradeField};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{insert_audit, AuditStatus};
use crate::{core_error, new_run_id, SqliteDataHub};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastReport {
    pub run_id: String,
    pub dataset_id: String,
    pub field: TradeField,
    pub horizon_months: usize,
    pub result: ForecastResult,
}

impl SqliteDataHub {
    /// Forecasts the monthly totals of one trade-core field. A `horizon` of
    /// `None` uses the configured horizon.
    pub fn forecast_trade(
        &mut self,
        dataset_id: &str,
        field: TradeField,
        horizon: Option<usize>,
    ) -> Result<ForecastReport> {
        let horizon_months = horizon.unwrap_or(self.config.forecast.horizon_months);
        if horizon_months == 0 {
            return Err(anyhow!("forecast horizon MUST be at least one month"));
        }

        let series = self.monthly_trade_series(dataset_id, field)?;
        if series.is_empty() {
            return Err(anyhow!(
                "no gold_trade_core rows for dataset {dataset_id}; run the gold stage first"
            ));
        }
        let result = forecast(&series, horizon_months, &self.config.forecast).map_err(core_error)?;

        let run_id = new_run_id();
        insert_audit(
            &self.conn,
            &run_id,
            "forecast",
            AuditStatus::Success,
            &json!({
                "dataset_id": dataset_id,
                "field": field.as_str(),
                "model": result.model.as_str(),
                "backtest_mape": result.backtest_mape,
                "history_months": series.len(),
            }),
        )?;
        info!(
            run_id = %run_id,
            dataset_id,
            field = field.as_str(),
            model = result.model.as_str(),
            "forecast complete"
        );

        Ok(ForecastReport {
            run_id,
            dataset_id: dataset_id.to_string(),
            field,
            horizon_months,
            result,
        })
    }
}
