use crate::config::ScoringConfig;
use crate::metrics::MetricsRecord;

/// Scalar score for one metrics record under a fixed weight set.
///
/// Deterministic: identical inputs always produce the identical score.
/// `hit_rate` and trade efficiency are rescaled to roughly the magnitude of
/// the profit terms so the default weights are comparable.
pub fn compute_score(metrics: &MetricsRecord, weights: &ScoringConfig) -> f64 {
    // Shorter average holds score higher; a zero/unknown duration is
    // treated as a 24-hour hold
    let avg_duration = if metrics.avg_trade_duration_hours > 0.0 {
        metrics.avg_trade_duration_hours
    } else {
        24.0
    };
    let trade_efficiency = 1.0 / avg_duration;

    weights.monthly_profit_weight * metrics.monthly_net_profit_avg
        + weights.hit_rate_weight * metrics.weekly_target_hit_rate * 100.0
        - weights.max_monthly_loss_weight * metrics.max_monthly_loss
        + weights.trade_efficiency_weight * trade_efficiency * 100.0
}

/// Acceptance requires beating the best score by a real margin, not noise.
pub fn is_improvement(current: f64, best: f64, min_improvement: f64) -> bool {
    current > best + min_improvement
}
