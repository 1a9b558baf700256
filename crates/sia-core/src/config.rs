use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::window::EvaluationWindow;

/// Top-level agent configuration, parsed from one or more TOML files.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub windows: Vec<EvaluationWindow>,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub proposer: ProposerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub comparator: ComparatorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub overfit: OverfitConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load and merge multiple TOML files (later files override earlier,
    /// tables merge recursively).
    pub fn from_toml_files(paths: &[&Path]) -> Result<Self, ConfigError> {
        if paths.is_empty() {
            return Err(ConfigError::Parse("no config files provided".into()));
        }
        let mut content =
            std::fs::read_to_string(paths[0]).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut base: toml::Value =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        for path in &paths[1..] {
            content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let overlay: toml::Value =
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            merge_toml(&mut base, overlay);
        }

        let merged_str =
            toml::to_string(&base).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_toml_str(&merged_str)
    }

    /// Reject configurations a run cannot work with. Called once at startup;
    /// unit-level consumers may use partial configs freely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.max_rounds == 0 {
            return Err(ConfigError::Invalid("run.max_rounds must be >= 1".into()));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_attempts must be >= 1".into(),
            ));
        }
        if self.comparator.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "comparator.max_workers must be >= 1".into(),
            ));
        }
        if self.windows.is_empty() {
            return Err(ConfigError::Invalid("no evaluation windows configured".into()));
        }
        let mut ids = HashSet::new();
        for w in &self.windows {
            if !ids.insert(w.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate window id: {}",
                    w.id
                )));
            }
            if w.start >= w.end {
                return Err(ConfigError::Invalid(format!(
                    "window {} has start >= end",
                    w.id
                )));
            }
        }
        if !self.windows.iter().any(|w| w.holdout) {
            return Err(ConfigError::Invalid(
                "at least one holdout window is required".into(),
            ));
        }
        if self.windows.iter().all(|w| w.holdout) {
            return Err(ConfigError::Invalid(
                "at least one in-sample window is required".into(),
            ));
        }
        Ok(())
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    if let (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) =
        (base, overlay)
    {
        for (key, value) in overlay_table {
            if let Some(base_value) = base_table.get_mut(&key) {
                if base_value.is_table() && value.is_table() {
                    merge_toml(base_value, value);
                    continue;
                }
            }
            base_table.insert(key, value);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_20")]
    pub max_rounds: u32,
    /// Consecutive scored rounds without improvement before the run
    /// converges.
    #[serde(default = "default_3")]
    pub stale_rounds_limit: u32,
    #[serde(default = "default_0_5")]
    pub min_improvement: f64,
    #[serde(default = "default_artifact")]
    pub artifact_path: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            stale_rounds_limit: 3,
            min_improvement: 0.5,
            artifact_path: "strategy.py".into(),
            results_dir: "results".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_required_markers")]
    pub required_markers: Vec<String>,
    #[serde(default = "default_forbidden_markers")]
    pub forbidden_markers: Vec<String>,
    #[serde(default = "default_20_0")]
    pub max_leverage: f64,
    #[serde(default = "default_neg_0_98")]
    pub min_stoploss: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_markers: default_required_markers(),
            forbidden_markers: default_forbidden_markers(),
            max_leverage: 20.0,
            min_stoploss: -0.98,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_300")]
    pub timeout_secs: u64,
    #[serde(default = "default_3")]
    pub max_retries: u32,
    #[serde(default = "default_0_3")]
    pub temperature: f64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            api_key_env: "SIA_PROPOSER_API_KEY".into(),
            timeout_secs: 300,
            max_retries: 3,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: String,
    /// Argument template; `{candidate}`, `{start}`, `{end}` and `{window}`
    /// are substituted per invocation.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    #[serde(default = "default_600")]
    pub timeout_secs: u64,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            timeout_secs: 600,
            scratch_dir: "scratch".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComparatorConfig {
    #[serde(default = "default_4")]
    pub max_workers: usize,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_3")]
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_0_4")]
    pub monthly_profit_weight: f64,
    #[serde(default = "default_0_3")]
    pub hit_rate_weight: f64,
    #[serde(default = "default_0_2")]
    pub max_monthly_loss_weight: f64,
    #[serde(default = "default_0_1")]
    pub trade_efficiency_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            monthly_profit_weight: 0.4,
            hit_rate_weight: 0.3,
            max_monthly_loss_weight: 0.2,
            trade_efficiency_weight: 0.1,
        }
    }
}

/// Hard execution limits; a report beyond any of these invalidates its
/// window result.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_95_0")]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub max_stake_limit_hits: u32,
    #[serde(default = "default_50")]
    pub min_trades: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 95.0,
            max_stake_limit_hits: 0,
            min_trades: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverfitConfig {
    /// Minimum acceptable out-of-sample / in-sample score ratio.
    #[serde(default = "default_0_6")]
    pub threshold: f64,
}

impl Default for OverfitConfig {
    fn default() -> Self {
        Self { threshold: 0.6 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsConfig {
    #[serde(default = "default_0_25")]
    pub weekly_hit_rate: f64,
    #[serde(default = "default_100_0")]
    pub monthly_net_profit_avg: f64,
    /// Lower is better.
    #[serde(default = "default_200_0")]
    pub max_monthly_loss: f64,
    /// Lower is better.
    #[serde(default = "default_50_0")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_2_0")]
    pub hit_rate_weight: f64,
    #[serde(default = "default_1_5")]
    pub monthly_profit_weight: f64,
    #[serde(default = "default_1_0")]
    pub monthly_loss_weight: f64,
    #[serde(default = "default_1_0")]
    pub drawdown_weight: f64,
    /// Gap-vector norm below which the search switches to fine-tuning.
    #[serde(default = "default_0_3")]
    pub fine_tune_threshold: f64,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            weekly_hit_rate: 0.25,
            monthly_net_profit_avg: 100.0,
            max_monthly_loss: 200.0,
            max_drawdown_pct: 50.0,
            hit_rate_weight: 2.0,
            monthly_profit_weight: 1.5,
            monthly_loss_weight: 1.0,
            drawdown_weight: 1.0,
            fine_tune_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_1000_0")]
    pub weekly_target: f64,
    #[serde(default = "default_100_0")]
    pub weekly_budget: f64,
    #[serde(default = "default_3")]
    pub cooldown_weeks: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            weekly_target: 1000.0,
            weekly_budget: 100.0,
            cooldown_weeks: 3,
        }
    }
}

/// Advisory bootstrap/permutation statistics. Never decision-affecting.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_1000")]
    pub n_bootstrap: u32,
    #[serde(default = "default_1000")]
    pub n_permutations: u32,
    #[serde(default = "default_42")]
    pub seed: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            n_bootstrap: 1000,
            n_permutations: 1000,
            seed: 42,
        }
    }
}

// Default value helpers
fn default_3() -> u32 { 3 }
fn default_4() -> usize { 4 }
fn default_20() -> u32 { 20 }
fn default_42() -> u64 { 42 }
fn default_50() -> u32 { 50 }
fn default_300() -> u64 { 300 }
fn default_600() -> u64 { 600 }
fn default_1000() -> u32 { 1000 }
fn default_0_1() -> f64 { 0.1 }
fn default_0_2() -> f64 { 0.2 }
fn default_0_25() -> f64 { 0.25 }
fn default_0_3() -> f64 { 0.3 }
fn default_0_4() -> f64 { 0.4 }
fn default_0_5() -> f64 { 0.5 }
fn default_0_6() -> f64 { 0.6 }
fn default_1_0() -> f64 { 1.0 }
fn default_1_5() -> f64 { 1.5 }
fn default_2_0() -> f64 { 2.0 }
fn default_20_0() -> f64 { 20.0 }
fn default_50_0() -> f64 { 50.0 }
fn default_95_0() -> f64 { 95.0 }
fn default_100_0() -> f64 { 100.0 }
fn default_200_0() -> f64 { 200.0 }
fn default_1000_0() -> f64 { 1000.0 }
fn default_neg_0_98() -> f64 { -0.98 }
fn default_artifact() -> String { "strategy.py".into() }
fn default_results_dir() -> String { "results".into() }
fn default_scratch_dir() -> String { "scratch".into() }
fn default_base_url() -> String { "https://api.deepseek.com".into() }
fn default_model() -> String { "deepseek-chat".into() }
fn default_api_key_env() -> String { "SIA_PROPOSER_API_KEY".into() }
fn default_engine_command() -> String { "scripts/run_backtest.sh".into() }
fn default_engine_args() -> Vec<String> {
    vec![
        "--candidate".into(),
        "{candidate}".into(),
        "--timerange".into(),
        "{start}-{end}".into(),
    ]
}
fn default_required_markers() -> Vec<String> {
    vec![
        "WeeklyBudgetController".into(),
        "can_open_trade".into(),
        "confirm_trade_entry".into(),
    ]
}
fn default_forbidden_markers() -> Vec<String> {
    vec!["compound_stakes".into(), "reinvest_profits".into()]
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
