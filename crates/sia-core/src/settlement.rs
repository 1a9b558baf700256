use std::collections::BTreeMap;

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};

use crate::config::SettlementConfig;
use crate::trade::TradeLog;

/// Terminal state of one settlement period. Every period resolves to
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Running period profit reached the weekly target.
    TargetHit,
    /// Running period profit fell to the negative weekly budget.
    BudgetExhausted,
    /// Neither threshold crossed; forced at the period boundary.
    PeriodSettled,
}

/// One classified settlement period (ISO week, UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodReport {
    pub iso_year: i32,
    pub iso_week: u32,
    pub trades: u32,
    /// Final cumulative profit for the period (all trades, even those after
    /// a terminal crossing).
    pub net_profit: f64,
    pub outcome: SettlementOutcome,
}

/// Settlement statistics over a whole trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub periods: Vec<PeriodReport>,
    pub weeks_total: u32,
    pub weeks_target_hit: u32,
    pub weeks_budget_exhausted: u32,
    pub weeks_settled: u32,
    /// `weeks_target_hit / weeks_total`; 0.0 for an empty log.
    pub hit_rate: f64,
    pub monthly_net_profit_avg: f64,
    /// Absolute value of the worst losing month; 0.0 when no month lost.
    pub max_monthly_loss: f64,
    pub cooldown_triggered: bool,
    pub recommendation: Option<String>,
}

impl SettlementSummary {
    fn empty() -> Self {
        Self {
            periods: Vec::new(),
            weeks_total: 0,
            weeks_target_hit: 0,
            weeks_budget_exhausted: 0,
            weeks_settled: 0,
            hit_rate: 0.0,
            monthly_net_profit_avg: 0.0,
            max_monthly_loss: 0.0,
            cooldown_triggered: false,
            recommendation: None,
        }
    }
}

/// Partition a trade log into ISO-week periods and classify each one.
///
/// The running balance is walked in close-timestamp order and resets at
/// every period boundary. The first threshold crossing is terminal for the
/// period: trades closed afterwards still count toward the period's trade
/// count and net profit, but cannot change its classification.
pub fn classify_periods(trades: &TradeLog, cfg: &SettlementConfig) -> SettlementSummary {
    let mut rows: Vec<(i64, f64)> = trades.closes().collect();
    if rows.is_empty() {
        return SettlementSummary::empty();
    }
    rows.sort_by_key(|&(ts, _)| ts);

    let mut periods: Vec<PeriodReport> = Vec::new();
    let mut current: Option<PeriodState> = None;

    for (ts, profit) in rows {
        // Timestamps outside chrono's representable range are dropped
        let dt = match DateTime::from_timestamp(ts, 0) {
            Some(dt) => dt,
            None => continue,
        };
        let week = dt.iso_week();
        let key = (week.year(), week.week());

        if current.as_ref().map(|s| s.key) != Some(key) {
            if let Some(done) = current.take() {
                periods.push(done.finish());
            }
            current = Some(PeriodState::new(key));
        }
        if let Some(state) = current.as_mut() {
            state.trades += 1;
            state.running += profit;
            if state.outcome.is_none() {
                if state.running >= cfg.weekly_target {
                    state.outcome = Some(SettlementOutcome::TargetHit);
                } else if state.running <= -cfg.weekly_budget {
                    state.outcome = Some(SettlementOutcome::BudgetExhausted);
                }
            }
        }
    }
    if let Some(done) = current.take() {
        periods.push(done.finish());
    }

    summarize(periods, cfg)
}

struct PeriodState {
    key: (i32, u32),
    trades: u32,
    running: f64,
    outcome: Option<SettlementOutcome>,
}

impl PeriodState {
    fn new(key: (i32, u32)) -> Self {
        Self {
            key,
            trades: 0,
            running: 0.0,
            outcome: None,
        }
    }

    fn finish(self) -> PeriodReport {
        PeriodReport {
            iso_year: self.key.0,
            iso_week: self.key.1,
            trades: self.trades,
            net_profit: self.running,
            outcome: self.outcome.unwrap_or(SettlementOutcome::PeriodSettled),
        }
    }
}

fn summarize(periods: Vec<PeriodReport>, cfg: &SettlementConfig) -> SettlementSummary {
    let weeks_total = periods.len() as u32;
    let weeks_target_hit = periods
        .iter()
        .filter(|p| p.outcome == SettlementOutcome::TargetHit)
        .count() as u32;
    let weeks_budget_exhausted = periods
        .iter()
        .filter(|p| p.outcome == SettlementOutcome::BudgetExhausted)
        .count() as u32;
    let weeks_settled = weeks_total - weeks_target_hit - weeks_budget_exhausted;

    let hit_rate = if weeks_total > 0 {
        weeks_target_hit as f64 / weeks_total as f64
    } else {
        0.0
    };

    // Four ISO weeks approximate one accounting month
    let mut monthly: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for p in &periods {
        let month_approx = (p.iso_week - 1) / 4 + 1;
        *monthly.entry((p.iso_year, month_approx)).or_insert(0.0) += p.net_profit;
    }
    let monthly_net_profit_avg = if monthly.is_empty() {
        0.0
    } else {
        monthly.values().sum::<f64>() / monthly.len() as f64
    };
    let max_monthly_loss = monthly
        .values()
        .copied()
        .fold(0.0_f64, |worst, v| if v < worst { v } else { worst })
        .abs();

    let cooldown_triggered = cooldown(&periods, cfg.cooldown_weeks as usize);
    let recommendation = if cooldown_triggered {
        Some(format!(
            "last {} periods all negative without a target hit; switch to dry-run for the next period",
            cfg.cooldown_weeks
        ))
    } else {
        None
    };

    SettlementSummary {
        periods,
        weeks_total,
        weeks_target_hit,
        weeks_budget_exhausted,
        weeks_settled,
        hit_rate,
        monthly_net_profit_avg,
        max_monthly_loss,
        cooldown_triggered,
        recommendation,
    }
}

/// True when the most recent `n` periods all missed the target and all
/// finished negative.
fn cooldown(periods: &[PeriodReport], n: usize) -> bool {
    if n == 0 || periods.len() < n {
        return false;
    }
    periods[periods.len() - n..]
        .iter()
        .all(|p| p.outcome != SettlementOutcome::TargetHit && p.net_profit < 0.0)
}
