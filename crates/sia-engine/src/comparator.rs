use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use sia_core::config::{AgentConfig, LimitsConfig, ScoringConfig};
use sia_core::{compute_score, Candidate, EvaluationWindow, MetricsRecord, Regime};

use crate::aggregator::MetricsAggregator;
use crate::engine::EvalEngine;
use crate::stats::{RobustnessEstimator, RobustnessStats};

/// Outcome of evaluating one candidate on one window.
///
/// `valid` means the result contributes to aggregate scores. A window can be
/// invalid two ways: the engine failed (`failure` is set, recovery may
/// repair it) or the report breached a hard execution limit (`metrics` is
/// retained for audit, nothing to repair).
#[derive(Debug, Clone, Serialize)]
pub struct WindowResult {
    pub window_id: String,
    pub regime: Regime,
    pub holdout: bool,
    pub valid: bool,
    pub score: Option<f64>,
    pub metrics: Option<MetricsRecord>,
    pub failure: Option<String>,
}

/// All window results for one candidate, with aggregates over the valid
/// subset. Invalid windows never contribute to any aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonMatrix {
    pub round: u32,
    pub candidate_id: String,
    pub results: Vec<WindowResult>,
    /// Mean score over valid in-sample windows.
    pub is_mean_score: Option<f64>,
    /// Worst score over valid in-sample windows.
    pub is_worst_score: Option<f64>,
    /// Mean score over valid holdout windows.
    pub oos_score: Option<f64>,
    /// `max(0, 100 - CV*100)` over valid in-sample scores, 0.0 when fewer
    /// than two scores exist or their mean is zero.
    pub robustness_score: f64,
    /// Advisory bootstrap/permutation statistics; absent below two scores.
    pub stats: Option<RobustnessStats>,
}

impl ComparisonMatrix {
    fn new(round: u32, candidate_id: String) -> Self {
        Self {
            round,
            candidate_id,
            results: Vec::new(),
            is_mean_score: None,
            is_worst_score: None,
            oos_score: None,
            robustness_score: 0.0,
            stats: None,
        }
    }

    pub fn result(&self, window_id: &str) -> Option<&WindowResult> {
        self.results.iter().find(|r| r.window_id == window_id)
    }

    pub fn failed_windows(&self) -> impl Iterator<Item = &WindowResult> {
        self.results.iter().filter(|r| r.failure.is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_windows().next().is_some()
    }

    /// True when any in-sample window is invalid; such a matrix cannot
    /// promote its candidate.
    pub fn invalid_in_sample(&self) -> bool {
        self.results.iter().any(|r| !r.holdout && !r.valid)
    }

    /// Target-facing aggregate over valid in-sample metrics: rates and
    /// profits are averaged, loss and drawdown take the worst window.
    pub fn in_sample_profile(&self) -> Option<MetricsRecord> {
        let records: Vec<&MetricsRecord> = self
            .results
            .iter()
            .filter(|r| !r.holdout && r.valid)
            .filter_map(|r| r.metrics.as_ref())
            .collect();
        if records.is_empty() {
            return None;
        }
        let n = records.len() as f64;
        let mut profile = MetricsRecord::default();
        profile.weekly_target_hit_rate =
            records.iter().map(|m| m.weekly_target_hit_rate).sum::<f64>() / n;
        profile.monthly_net_profit_avg =
            records.iter().map(|m| m.monthly_net_profit_avg).sum::<f64>() / n;
        profile.max_monthly_loss = records
            .iter()
            .map(|m| m.max_monthly_loss)
            .fold(0.0, f64::max);
        profile.max_drawdown_pct = records
            .iter()
            .map(|m| m.max_drawdown_pct)
            .fold(0.0, f64::max);
        Some(profile)
    }
}

/// Fans one candidate out over all evaluation windows on a bounded worker
/// pool and folds the results into a [`ComparisonMatrix`].
pub struct WindowComparator {
    engine: Arc<dyn EvalEngine>,
    aggregator: MetricsAggregator,
    pool: rayon::ThreadPool,
    limits: LimitsConfig,
    scoring: ScoringConfig,
    estimator: RobustnessEstimator,
}

impl WindowComparator {
    pub fn new(
        engine: Arc<dyn EvalEngine>,
        cfg: &AgentConfig,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.comparator.max_workers)
            .thread_name(|i| format!("eval-{i}"))
            .build()?;
        Ok(Self {
            engine,
            aggregator: MetricsAggregator::new(cfg.settlement.clone()),
            pool,
            limits: cfg.limits.clone(),
            scoring: cfg.scoring.clone(),
            estimator: RobustnessEstimator::new(&cfg.stats),
        })
    }

    /// Evaluate every window for one candidate. Execution fans out over the
    /// pool; the result vector keeps submission order.
    pub fn evaluate(
        &self,
        candidate: &Candidate,
        windows: &[EvaluationWindow],
        round: u32,
    ) -> ComparisonMatrix {
        let mut matrix = ComparisonMatrix::new(round, candidate.id.clone());
        self.evaluate_into(&mut matrix, candidate, windows);
        matrix
    }

    /// Evaluate only the windows the matrix has no result for yet. A window
    /// already present is never run again, so each (candidate, window) pair
    /// resolves to exactly one result.
    pub fn evaluate_into(
        &self,
        matrix: &mut ComparisonMatrix,
        candidate: &Candidate,
        windows: &[EvaluationWindow],
    ) {
        debug_assert_eq!(matrix.candidate_id, candidate.id);
        let pending: Vec<&EvaluationWindow> = windows
            .iter()
            .filter(|w| matrix.result(&w.id).is_none())
            .collect();
        if pending.is_empty() {
            return;
        }

        debug!(
            candidate = %candidate.id,
            windows = pending.len(),
            "evaluating candidate"
        );
        let fresh: Vec<WindowResult> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|w| self.evaluate_window(candidate, w))
                .collect()
        });
        matrix.results.extend(fresh);
        self.finalize(matrix);
    }

    fn evaluate_window(&self, candidate: &Candidate, window: &EvaluationWindow) -> WindowResult {
        let mut result = WindowResult {
            window_id: window.id.clone(),
            regime: window.regime,
            holdout: window.holdout,
            valid: false,
            score: None,
            metrics: None,
            failure: None,
        };

        let raw = match self.engine.evaluate(candidate, window) {
            Ok(raw) => raw,
            Err(failure) => {
                warn!(window = %window.id, %failure, "engine invocation failed");
                result.failure = Some(failure.to_string());
                return result;
            }
        };

        let metrics = match self.aggregator.normalize(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(window = %window.id, error = %e, "report rejected");
                result.failure = Some(format!("report rejected: {e}"));
                return result;
            }
        };

        if let Some(reason) = metrics.hard_limit_violation(&self.limits) {
            debug!(window = %window.id, %reason, "window disqualified");
            result.metrics = Some(metrics);
            return result;
        }

        result.score = Some(compute_score(&metrics, &self.scoring));
        result.metrics = Some(metrics);
        result.valid = true;
        result
    }

    fn finalize(&self, matrix: &mut ComparisonMatrix) {
        let is_scores: Vec<f64> = matrix
            .results
            .iter()
            .filter(|r| !r.holdout && r.valid)
            .filter_map(|r| r.score)
            .collect();
        let oos_scores: Vec<f64> = matrix
            .results
            .iter()
            .filter(|r| r.holdout && r.valid)
            .filter_map(|r| r.score)
            .collect();

        matrix.is_mean_score = mean(&is_scores);
        matrix.is_worst_score = is_scores.iter().copied().reduce(f64::min);
        matrix.oos_score = mean(&oos_scores);
        matrix.robustness_score = robustness(&is_scores);
        matrix.stats = if is_scores.len() >= 2 {
            let stats = self.estimator.estimate(&is_scores);
            debug!(
                candidate = %matrix.candidate_id,
                ci_low = stats.mean_ci_95.0,
                ci_high = stats.mean_ci_95.1,
                p_value = stats.p_value,
                "robustness statistics"
            );
            Some(stats)
        } else {
            None
        };
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Consistency of per-window scores: `max(0, 100 - CV*100)` rounded to two
/// decimals, where CV is the coefficient of variation.
fn robustness(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let cv = sample_std_dev(scores) / mean.abs();
    ((100.0 - cv * 100.0).max(0.0) * 100.0).round() / 100.0
}

/// Sample standard deviation.
fn sample_std_dev(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use super::*;
    use crate::engine::EngineFailure;

    // 2024-01-01 00:00:00 UTC.
    const MONDAY: i64 = 1_704_067_200;
    const DAY: i64 = 86_400;

    struct StubEngine {
        by_window: HashMap<String, Result<Value, String>>,
        calls: AtomicUsize,
    }

    impl StubEngine {
        fn new(by_window: HashMap<String, Result<Value, String>>) -> Self {
            Self {
                by_window,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EvalEngine for StubEngine {
        fn evaluate(
            &self,
            _candidate: &Candidate,
            window: &EvaluationWindow,
        ) -> Result<Value, EngineFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.by_window.get(&window.id) {
                Some(Ok(v)) => Ok(v.clone()),
                Some(Err(msg)) => Err(EngineFailure {
                    message: msg.clone(),
                    exit_status: Some(1),
                    timed_out: false,
                }),
                None => Err(EngineFailure {
                    message: "no stub response".into(),
                    exit_status: None,
                    timed_out: false,
                }),
            }
        }
    }

    fn make_window(id: &str, holdout: bool) -> EvaluationWindow {
        EvaluationWindow {
            id: id.to_string(),
            label: String::new(),
            regime: if holdout { Regime::OutOfSample } else { Regime::Bull },
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            holdout,
        }
    }

    /// Report whose score is `0.4 * profit + 1.0`: one settled week with the
    /// given net profit, a 10h average hold, and no losses.
    fn report_with_profit(profit: f64) -> Value {
        json!({
            "profit_total_pct": 5.0,
            "max_drawdown_pct": 10.0,
            "total_trades": 80,
            "win_rate": 0.5,
            "avg_trade_duration_hours": 10.0,
            "trades": [
                { "open_ts": MONDAY, "close_ts": MONDAY + DAY, "profit": profit },
            ],
        })
    }

    fn config() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.limits.min_trades = 0;
        cfg
    }

    fn comparator(stub: Arc<StubEngine>) -> WindowComparator {
        WindowComparator::new(stub, &config()).unwrap()
    }

    #[test]
    fn test_results_keep_window_order() {
        let stub = Arc::new(StubEngine::new(HashMap::from([
            ("a".to_string(), Ok(report_with_profit(10.0))),
            ("b".to_string(), Ok(report_with_profit(20.0))),
            ("c".to_string(), Ok(report_with_profit(30.0))),
        ])));
        let windows = vec![
            make_window("a", false),
            make_window("b", false),
            make_window("c", true),
        ];
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &windows,
            1,
        );
        let ids: Vec<&str> = matrix.results.iter().map(|r| r.window_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_aggregates_split_in_sample_and_holdout() {
        let stub = Arc::new(StubEngine::new(HashMap::from([
            ("is_a".to_string(), Ok(report_with_profit(100.0))),
            ("is_b".to_string(), Ok(report_with_profit(50.0))),
            ("oos".to_string(), Ok(report_with_profit(75.0))),
        ])));
        let windows = vec![
            make_window("is_a", false),
            make_window("is_b", false),
            make_window("oos", true),
        ];
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &windows,
            1,
        );

        // Scores: is_a = 41, is_b = 21, oos = 31.
        assert!((matrix.is_mean_score.unwrap() - 31.0).abs() < 1e-10);
        assert!((matrix.is_worst_score.unwrap() - 21.0).abs() < 1e-10);
        assert!((matrix.oos_score.unwrap() - 31.0).abs() < 1e-10);
        // CV = sqrt(200)/31; 100 - CV*100 = 54.3802... rounds to 54.38.
        assert!((matrix.robustness_score - 54.38).abs() < 1e-10);
        assert!(matrix.stats.is_some());
        assert!(!matrix.invalid_in_sample());
    }

    #[test]
    fn test_engine_failure_marks_window_failed() {
        let stub = Arc::new(StubEngine::new(HashMap::from([
            ("good".to_string(), Ok(report_with_profit(100.0))),
            ("bad".to_string(), Err("KeyError: 'rsi_fast'".to_string())),
        ])));
        let windows = vec![make_window("good", false), make_window("bad", false)];
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &windows,
            1,
        );

        let bad = matrix.result("bad").unwrap();
        assert!(!bad.valid);
        assert!(bad.failure.as_ref().unwrap().contains("KeyError"));
        assert!(matrix.has_failures());
        assert!(matrix.invalid_in_sample());
        // The failed window is excluded from the mean.
        assert!((matrix.is_mean_score.unwrap() - 41.0).abs() < 1e-10);
    }

    #[test]
    fn test_rejected_report_marks_window_failed() {
        let stub = Arc::new(StubEngine::new(HashMap::from([(
            "w".to_string(),
            Ok(json!({ "profit_total_pct": 5.0 })),
        )])));
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &[make_window("w", false)],
            1,
        );
        let r = matrix.result("w").unwrap();
        assert!(!r.valid);
        assert!(r.failure.as_ref().unwrap().starts_with("report rejected:"));
    }

    #[test]
    fn test_hard_limit_disqualifies_without_failure() {
        let mut report = report_with_profit(100.0);
        report["max_drawdown_pct"] = json!(99.0);
        let stub = Arc::new(StubEngine::new(HashMap::from([(
            "w".to_string(),
            Ok(report),
        )])));
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &[make_window("w", false)],
            1,
        );

        let r = matrix.result("w").unwrap();
        assert!(!r.valid);
        assert!(r.failure.is_none());
        assert!(r.metrics.is_some());
        assert!(r.score.is_none());
        assert!(matrix.invalid_in_sample());
        assert!(!matrix.has_failures());
    }

    #[test]
    fn test_evaluate_into_never_reruns_a_window() {
        let stub = Arc::new(StubEngine::new(HashMap::from([
            ("a".to_string(), Ok(report_with_profit(10.0))),
            ("b".to_string(), Ok(report_with_profit(20.0))),
        ])));
        let windows = vec![make_window("a", false), make_window("b", false)];
        let candidate = Candidate::new(1, "x".into(), None);
        let comparator = comparator(stub.clone());

        let mut matrix = comparator.evaluate(&candidate, &windows, 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);

        comparator.evaluate_into(&mut matrix, &candidate, &windows);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert_eq!(matrix.results.len(), 2);
    }

    #[test]
    fn test_single_window_has_no_robustness() {
        let stub = Arc::new(StubEngine::new(HashMap::from([(
            "w".to_string(),
            Ok(report_with_profit(10.0)),
        )])));
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &[make_window("w", false)],
            1,
        );
        assert_eq!(matrix.robustness_score, 0.0);
        assert!(matrix.stats.is_none());
    }

    #[test]
    fn test_in_sample_profile_takes_worst_loss() {
        let mut losing = report_with_profit(-50.0);
        losing["max_drawdown_pct"] = json!(30.0);
        let stub = Arc::new(StubEngine::new(HashMap::from([
            ("a".to_string(), Ok(losing)),
            ("b".to_string(), Ok(report_with_profit(100.0))),
        ])));
        let windows = vec![make_window("a", false), make_window("b", false)];
        let matrix = comparator(stub).evaluate(
            &Candidate::new(1, "x".into(), None),
            &windows,
            1,
        );

        let profile = matrix.in_sample_profile().unwrap();
        assert!((profile.monthly_net_profit_avg - 25.0).abs() < 1e-10);
        assert!((profile.max_monthly_loss - 50.0).abs() < 1e-10);
        assert!((profile.max_drawdown_pct - 30.0).abs() < 1e-10);
    }
}
