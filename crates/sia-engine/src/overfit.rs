use serde::Serialize;
use sia_core::config::OverfitConfig;

/// Outcome of the in-sample vs out-of-sample comparison.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OverfitVerdict {
    /// `oos_score / is_score`.
    pub ratio: f64,
    pub overfitting: bool,
}

/// Compares holdout performance against in-sample performance.
///
/// A candidate that keeps less than `threshold` of its in-sample score out
/// of sample is rejected regardless of how good the in-sample score looks.
pub struct OverfitDetector {
    threshold: f64,
}

impl OverfitDetector {
    pub fn new(cfg: &OverfitConfig) -> Self {
        Self {
            threshold: cfg.threshold,
        }
    }

    /// `None` when `is_score` is non-positive: the ratio is undefined there
    /// and the caller must treat the round as failed, never as passed.
    pub fn check(&self, is_score: f64, oos_score: f64) -> Option<OverfitVerdict> {
        if is_score <= 0.0 {
            return None;
        }
        let ratio = oos_score / is_score;
        Some(OverfitVerdict {
            ratio,
            overfitting: ratio < self.threshold,
        })
    }
}
