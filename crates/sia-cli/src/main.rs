use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::Serialize;

use sia_agent::{HttpProposer, IterationController, RoundJournal, RoundRecord, RunOutcome};
use sia_core::{
    classify_periods, AgentConfig, SettlementConfig, SettlementOutcome, SettlementSummary,
    TradeLog,
};
use sia_engine::SubprocessEngine;

mod logging;

#[derive(Parser, Debug)]
#[command(name = "sia", about = "Strategy iteration agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive proposal rounds against the evaluation engine
    Run {
        /// Path to TOML config file(s), comma-separated for merge
        #[arg(long, default_value = "config/default.toml")]
        config: String,

        /// Seed artifact to iterate on (overrides run.artifact_path)
        #[arg(long)]
        artifact: Option<PathBuf>,

        /// Stop after this many rounds (overrides run.max_rounds)
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Report file path (stdout if not specified)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Append JSON logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Classify a trade log into weekly settlement periods
    Settle {
        /// Path to CSV trade log
        #[arg(long)]
        trades: PathBuf,

        /// Path to TOML config file(s), comma-separated for merge
        #[arg(long)]
        config: Option<String>,

        /// Override settlement.weekly_target
        #[arg(long)]
        weekly_target: Option<f64>,

        /// Override settlement.weekly_budget
        #[arg(long)]
        weekly_budget: Option<f64>,

        /// Report file path (stdout if not specified)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct RunReport {
    meta: RunMeta,
    outcome: RunOutcome,
    rounds: Vec<RoundRecord>,
}

#[derive(Debug, Serialize)]
struct RunMeta {
    artifact: String,
    windows: usize,
    elapsed_ms: u128,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            artifact,
            max_rounds,
            out,
            log_file,
        } => run(&config, artifact, max_rounds, out, log_file),
        Command::Settle {
            trades,
            config,
            weekly_target,
            weekly_budget,
            out,
        } => settle(&trades, config, weekly_target, weekly_budget, out),
    }
}

fn run(
    config: &str,
    artifact: Option<PathBuf>,
    max_rounds: Option<u32>,
    out: Option<PathBuf>,
    log_file: Option<PathBuf>,
) {
    let _guard = logging::init(log_file.as_deref());
    let start = Instant::now();

    let mut cfg = match load_config(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(path) = artifact {
        cfg.run.artifact_path = path.display().to_string();
    }
    if let Some(n) = max_rounds {
        cfg.run.max_rounds = n;
    }
    if let Err(e) = cfg.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let seed = match std::fs::read_to_string(&cfg.run.artifact_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading artifact {}: {}", cfg.run.artifact_path, e);
            std::process::exit(1);
        }
    };

    let proposer = match HttpProposer::from_config(&cfg.proposer) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error building proposer client: {}", e);
            std::process::exit(1);
        }
    };
    let engine = Arc::new(SubprocessEngine::new(&cfg.engine));

    let mut controller =
        match IterationController::new(cfg.clone(), seed, Box::new(proposer), engine) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error building controller: {}", e);
                std::process::exit(1);
            }
        };

    eprintln!(
        "Running up to {} rounds across {} windows...",
        cfg.run.max_rounds,
        cfg.windows.len()
    );
    let outcome = match controller.run() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error during run: {}", e);
            std::process::exit(1);
        }
    };

    let journal = RoundJournal::new(PathBuf::from(&cfg.run.results_dir).join("round_log.jsonl"));
    let rounds = match journal.read_all() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Warning: round log unreadable: {}", e);
            Vec::new()
        }
    };

    let report = RunReport {
        meta: RunMeta {
            artifact: cfg.run.artifact_path.clone(),
            windows: cfg.windows.len(),
            elapsed_ms: start.elapsed().as_millis(),
        },
        outcome,
        rounds,
    };
    print_run_summary(&report);
    emit(&report, out.as_deref());
}

fn settle(
    trades_path: &Path,
    config: Option<String>,
    weekly_target: Option<f64>,
    weekly_budget: Option<f64>,
    out: Option<PathBuf>,
) {
    let _guard = logging::init(None);

    let trades = match TradeLog::from_csv(trades_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error loading trades: {}", e);
            std::process::exit(1);
        }
    };

    let mut settlement = match config {
        Some(spec) => match load_config(&spec) {
            Ok(cfg) => cfg.settlement,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        },
        None => SettlementConfig::default(),
    };
    if let Some(t) = weekly_target {
        settlement.weekly_target = t;
    }
    if let Some(b) = weekly_budget {
        settlement.weekly_budget = b;
    }

    let summary = classify_periods(&trades, &settlement);
    print_settle_summary(trades_path, trades.len(), &summary);
    emit(&summary, out.as_deref());
}

fn load_config(spec: &str) -> Result<AgentConfig, sia_core::ConfigError> {
    let paths: Vec<PathBuf> = spec.split(',').map(str::trim).map(PathBuf::from).collect();
    let refs: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    AgentConfig::from_toml_files(&refs)
}

fn emit<T: Serialize>(value: &T, out: Option<&Path>) {
    let json = match serde_json::to_string_pretty(value) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("Error serializing report: {}", e);
            std::process::exit(1);
        }
    };
    match out {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &json) {
                eprintln!("Error writing {}: {}", path.display(), e);
                std::process::exit(1);
            }
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "-".into())
}

fn print_run_summary(report: &RunReport) {
    eprintln!("\n{}", "=".repeat(80));
    eprintln!("Iteration Run");
    eprintln!("{}", "=".repeat(80));
    eprintln!(
        "Rounds: {} | Stop: {} | Best: {} | Elapsed: {}ms",
        report.outcome.rounds_completed,
        report.outcome.reason,
        fmt_opt(report.outcome.best_score),
        report.meta.elapsed_ms
    );
    eprintln!("{}", "-".repeat(80));
    eprintln!(
        "{:<6} {:<14} {:<11} {:>8} {:>8} {:>8}  {}",
        "Round", "Candidate", "Decision", "Score", "OOS", "Robust", "Note"
    );
    eprintln!("{}", "-".repeat(80));
    for r in &report.rounds {
        eprintln!(
            "{:<6} {:<14} {:<11} {:>8} {:>8} {:>8}  {}",
            r.round,
            r.candidate_id,
            r.decision.to_string(),
            fmt_opt(r.score),
            fmt_opt(r.oos_score),
            fmt_opt(r.robustness_score),
            r.note,
        );
    }
    eprintln!("{}", "=".repeat(80));
}

fn outcome_label(outcome: SettlementOutcome) -> &'static str {
    match outcome {
        SettlementOutcome::TargetHit => "target_hit",
        SettlementOutcome::BudgetExhausted => "budget_exhausted",
        SettlementOutcome::PeriodSettled => "period_settled",
    }
}

fn print_settle_summary(path: &Path, trades: usize, summary: &SettlementSummary) {
    eprintln!("\n{}", "=".repeat(80));
    eprintln!("Weekly Settlement Report");
    eprintln!("{}", "=".repeat(80));
    eprintln!(
        "Trades: {} ({}) | Weeks: {} | Hit rate: {:.1}%",
        trades,
        path.display(),
        summary.weeks_total,
        summary.hit_rate * 100.0
    );
    eprintln!("{}", "-".repeat(80));
    eprintln!(
        "{:<10} {:>8} {:>12}  {}",
        "Week", "Trades", "NetProfit", "Outcome"
    );
    eprintln!("{}", "-".repeat(80));
    for p in &summary.periods {
        eprintln!(
            "{:<10} {:>8} {:>12.2}  {}",
            format!("{}-W{:02}", p.iso_year, p.iso_week),
            p.trades,
            p.net_profit,
            outcome_label(p.outcome)
        );
    }
    eprintln!("{}", "-".repeat(80));
    eprintln!(
        "Target hit: {} | Budget exhausted: {} | Settled: {} | Avg monthly: {:.2} | Worst month: {:.2}",
        summary.weeks_target_hit,
        summary.weeks_budget_exhausted,
        summary.weeks_settled,
        summary.monthly_net_profit_avg,
        summary.max_monthly_loss
    );
    if summary.cooldown_triggered {
        eprintln!("Cooldown triggered: pause live trading and review the strategy");
    }
    if let Some(r) = &summary.recommendation {
        eprintln!("Recommendation: {}", r);
    }
    eprintln!("{}", "=".repeat(80));
}
