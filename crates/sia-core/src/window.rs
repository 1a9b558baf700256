use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Market-regime label attached to an evaluation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    OutOfSample,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Sideways => "sideways",
            Regime::OutOfSample => "out_of_sample",
        };
        f.write_str(s)
    }
}

/// One named historical evaluation range.
///
/// Windows are static configuration: every candidate in a run is evaluated
/// against the same set. Windows flagged `holdout` form the out-of-sample
/// set for the overfit check and never contribute to the in-sample score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub regime: Regime,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub holdout: bool,
}

impl EvaluationWindow {
    /// Compact `YYYYMMDD-YYYYMMDD` range string for engine invocations.
    pub fn timerange(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}
