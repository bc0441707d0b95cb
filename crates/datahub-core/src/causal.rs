use serde::{Deserialize, Serialize};

use crate::YearMonth;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentGroup {
    Treated,
    Control,
}

impl ExperimentGroup {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Treated => "treated",
            Self::Control => "control",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "treated" => Some(Self::Treated),
            "control" => Some(Self::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub unit_key: String,
    pub group: ExperimentGroup,
    pub month: YearMonth,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DidEstimate {
    pub start_month: YearMonth,
    pub treated_pre: f64,
    pub treated_post: f64,
    pub control_pre: f64,
    pub control_post: f64,
    pub did: f64,
    pub lift_pct: f64,
    pub observations: usize,
}

/// Two-group difference-in-differences on per-unit monthly observations.
///
/// Months before `start_month` are pre-period. Each cell is the mean of its
/// observations (0.0 when empty). `lift_pct` divides by 1.0 when the
/// control pre-period mean is zero, which yields the raw DID rather than a
/// ratio.
#[must_use]
pub fn evaluate_did(observations: &[Observation], start_month: YearMonth) -> DidEstimate {
    let mut cells = [Cell::default(); 4];
    for item in observations {
        let post = item.month >= start_month;
        let index = match (item.group, post) {
            (ExperimentGroup::Treated, false) => 0,
            (ExperimentGroup::Treated, true) => 1,
            (ExperimentGroup::Control, false) => 2,
            (ExperimentGroup::Control, true) => 3,
        };
        cells[index].sum += item.value;
        cells[index].count += 1;
    }

    let treated_pre = cells[0].mean();
    let treated_post = cells[1].mean();
    let control_pre = cells[2].mean();
    let control_post = cells[3].mean();

    let did = (treated_post - treated_pre) - (control_post - control_pre);
    let denominator = if control_pre == 0.0 { 1.0 } else { control_pre };

    DidEstimate {
        start_month,
        treated_pre,
        treated_post,
        control_pre,
        control_post,
        did,
        lift_pct: did / denominator,
        observations: observations.len(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    sum: f64,
    count: usize,
}

impl Cell {
    #[allow(clippy::cast_precision_loss)]
    fn mean(self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}
