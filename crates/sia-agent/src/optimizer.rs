use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use sia_core::config::TargetsConfig;
use sia_core::MetricsRecord;

/// The four steerable dimensions of the target profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    WeeklyHitRate,
    MonthlyNetProfitAvg,
    MaxMonthlyLoss,
    MaxDrawdownPct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Explore,
    FineTune,
}

/// Signed distance from target on every dimension; positive means still
/// short of target. The dimension set is fixed: a gap vector always carries
/// all four deltas.
#[derive(Debug, Clone, Serialize)]
pub struct GapVector {
    pub round: u32,
    pub weekly_hit_rate: f64,
    pub monthly_net_profit_avg: f64,
    pub max_monthly_loss: f64,
    pub max_drawdown_pct: f64,
    /// Weighted L2 norm over the positive deltas, each normalized by its
    /// target magnitude.
    pub weighted_norm: f64,
    pub mode: SearchMode,
}

impl GapVector {
    pub fn dims(&self) -> [(MetricKey, f64); 4] {
        [
            (MetricKey::WeeklyHitRate, self.weekly_hit_rate),
            (MetricKey::MonthlyNetProfitAvg, self.monthly_net_profit_avg),
            (MetricKey::MaxMonthlyLoss, self.max_monthly_loss),
            (MetricKey::MaxDrawdownPct, self.max_drawdown_pct),
        ]
    }
}

/// Search-steering hint passed to the proposer. Never mutates a candidate.
#[derive(Debug, Clone, Serialize)]
pub struct Directive {
    pub mode: SearchMode,
    /// Dimensions the next proposal should concentrate on, worst first.
    pub focus_dims: Vec<MetricKey>,
    pub step_scale: f64,
    pub max_param_changes: u32,
}

impl Directive {
    /// Compact JSON rendering for the proposer prompt.
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Measures each accepted candidate against the target profile and steers
/// the next proposal: broad explore steps while far from target, shrinking
/// fine-tune steps as the gap closes.
pub struct TargetGapOptimizer {
    targets: TargetsConfig,
    history_path: Option<PathBuf>,
}

impl TargetGapOptimizer {
    pub fn new(targets: &TargetsConfig) -> Self {
        Self {
            targets: targets.clone(),
            history_path: None,
        }
    }

    /// Enable the append-only JSONL gap history at `path`.
    pub fn with_history(targets: &TargetsConfig, path: PathBuf) -> Self {
        Self {
            targets: targets.clone(),
            history_path: Some(path),
        }
    }

    pub fn compute_gap(&self, current: &MetricsRecord, round: u32) -> GapVector {
        let t = &self.targets;
        // Higher-is-better: target - current. Lower-is-better: current - target.
        let weekly_hit_rate = t.weekly_hit_rate - current.weekly_target_hit_rate;
        let monthly_net_profit_avg = t.monthly_net_profit_avg - current.monthly_net_profit_avg;
        let max_monthly_loss = current.max_monthly_loss - t.max_monthly_loss;
        let max_drawdown_pct = current.max_drawdown_pct - t.max_drawdown_pct;

        let mut acc = 0.0;
        for (key, delta) in [
            (MetricKey::WeeklyHitRate, weekly_hit_rate),
            (MetricKey::MonthlyNetProfitAvg, monthly_net_profit_avg),
            (MetricKey::MaxMonthlyLoss, max_monthly_loss),
            (MetricKey::MaxDrawdownPct, max_drawdown_pct),
        ] {
            if delta <= 0.0 {
                continue;
            }
            let nd = self.normalized(key, delta);
            acc += self.weight(key) * nd * nd;
        }
        let weighted_norm = acc.sqrt();

        let mode = if weighted_norm < t.fine_tune_threshold {
            SearchMode::FineTune
        } else {
            SearchMode::Explore
        };

        GapVector {
            round,
            weekly_hit_rate,
            monthly_net_profit_avg,
            max_monthly_loss,
            max_drawdown_pct,
            weighted_norm,
            mode,
        }
    }

    pub fn recommend(&self, gap: &GapVector) -> Directive {
        let mut ranked: Vec<(MetricKey, f64)> = gap
            .dims()
            .into_iter()
            .filter(|(_, delta)| *delta > 0.0)
            .map(|(key, delta)| (key, self.weight(key) * self.normalized(key, delta)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        match gap.mode {
            SearchMode::FineTune => Directive {
                mode: SearchMode::FineTune,
                focus_dims: ranked.iter().take(1).map(|(k, _)| *k).collect(),
                // Steps shrink with the remaining gap, floored so progress
                // never stalls completely.
                step_scale: (0.3 * gap.weighted_norm / self.targets.fine_tune_threshold)
                    .clamp(0.05, 0.3),
                max_param_changes: 1,
            },
            SearchMode::Explore => Directive {
                mode: SearchMode::Explore,
                focus_dims: ranked.iter().take(2).map(|(k, _)| *k).collect(),
                step_scale: 1.0,
                max_param_changes: 3,
            },
        }
    }

    /// Append the gap to the JSONL history, one record per line.
    pub fn log_gap(&self, gap: &GapVector) -> std::io::Result<()> {
        let Some(path) = &self.history_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(gap).map_err(std::io::Error::other)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        debug!(round = gap.round, norm = gap.weighted_norm, "gap logged");
        Ok(())
    }

    fn weight(&self, key: MetricKey) -> f64 {
        match key {
            MetricKey::WeeklyHitRate => self.targets.hit_rate_weight,
            MetricKey::MonthlyNetProfitAvg => self.targets.monthly_profit_weight,
            MetricKey::MaxMonthlyLoss => self.targets.monthly_loss_weight,
            MetricKey::MaxDrawdownPct => self.targets.drawdown_weight,
        }
    }

    fn target(&self, key: MetricKey) -> f64 {
        match key {
            MetricKey::WeeklyHitRate => self.targets.weekly_hit_rate,
            MetricKey::MonthlyNetProfitAvg => self.targets.monthly_net_profit_avg,
            MetricKey::MaxMonthlyLoss => self.targets.max_monthly_loss,
            MetricKey::MaxDrawdownPct => self.targets.max_drawdown_pct,
        }
    }

    /// Delta normalized by target magnitude; a zero target leaves the delta
    /// unscaled.
    fn normalized(&self, key: MetricKey, delta: f64) -> f64 {
        let target = self.target(key);
        if target != 0.0 {
            delta / target.abs()
        } else {
            delta
        }
    }
}
