use serde::{Deserialize, Serialize};

use crate::config::LimitsConfig;
use crate::settlement::SettlementSummary;

/// Canonical per-evaluation metrics record.
///
/// Raw engine reports are dynamic JSON; everything downstream of the
/// aggregation boundary works with this validated shape only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub profit_total_pct: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
    pub expectancy: f64,
    pub stake_limit_hits: u32,
    pub avg_trade_duration_hours: f64,
    // Derived from the settlement classifier
    pub weekly_target_hit_rate: f64,
    pub weeks_total: u32,
    pub weeks_target_hit: u32,
    pub weeks_budget_exhausted: u32,
    pub weeks_settled: u32,
    pub monthly_net_profit_avg: f64,
    pub max_monthly_loss: f64,
    pub cooldown_triggered: bool,
}

impl MetricsRecord {
    /// Fold a settlement summary into the derived fields.
    pub fn apply_settlement(&mut self, s: &SettlementSummary) {
        self.weekly_target_hit_rate = s.hit_rate;
        self.weeks_total = s.weeks_total;
        self.weeks_target_hit = s.weeks_target_hit;
        self.weeks_budget_exhausted = s.weeks_budget_exhausted;
        self.weeks_settled = s.weeks_settled;
        self.monthly_net_profit_avg = s.monthly_net_profit_avg;
        self.max_monthly_loss = s.max_monthly_loss;
        self.cooldown_triggered = s.cooldown_triggered;
    }

    /// First hard execution limit this record violates, if any.
    ///
    /// A violating record marks its window result invalid; the window is
    /// disqualified but the rest of the round proceeds.
    pub fn hard_limit_violation(&self, limits: &LimitsConfig) -> Option<String> {
        if self.max_drawdown_pct > limits.max_drawdown_pct {
            return Some(format!(
                "max drawdown {:.2}% exceeds hard cap {:.2}%",
                self.max_drawdown_pct, limits.max_drawdown_pct
            ));
        }
        if self.stake_limit_hits > limits.max_stake_limit_hits {
            return Some(format!(
                "{} stake-limit hits (allowed {})",
                self.stake_limit_hits, limits.max_stake_limit_hits
            ));
        }
        if self.total_trades < limits.min_trades {
            return Some(format!(
                "{} trades below minimum {}",
                self.total_trades, limits.min_trades
            ));
        }
        None
    }
}

impl Default for MetricsRecord {
    fn default() -> Self {
        Self {
            profit_total_pct: 0.0,
            max_drawdown_pct: 0.0,
            total_trades: 0,
            win_rate: 0.0,
            profit_factor: 0.0,
            sharpe: 0.0,
            expectancy: 0.0,
            stake_limit_hits: 0,
            avg_trade_duration_hours: 0.0,
            weekly_target_hit_rate: 0.0,
            weeks_total: 0,
            weeks_target_hit: 0,
            weeks_budget_exhausted: 0,
            weeks_settled: 0,
            monthly_net_profit_avg: 0.0,
            max_monthly_loss: 0.0,
            cooldown_triggered: false,
        }
    }
}
