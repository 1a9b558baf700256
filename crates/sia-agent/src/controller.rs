use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use sia_core::{
    is_improvement, AgentConfig, AgentError, Candidate, CandidateStatus, ConfigError, Result,
};
use sia_engine::{ComparisonMatrix, EvalEngine, OverfitDetector, WindowComparator};

use crate::gate::SafetyGate;
use crate::journal::{
    atomic_write, excerpt, Decision, RoundJournal, RoundRecord, VersionStore, WindowSummary,
};
use crate::optimizer::TargetGapOptimizer;
use crate::proposer::{Proposer, ProposerRequest};
use crate::recovery::{ErrorRecoveryManager, IncidentState, RepairResolution};

/// Phases of one round. `Terminated` is entered once and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Proposing,
    Gating,
    Evaluating,
    Scoring,
    Deciding,
    Terminated,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxRounds,
    ConvergedNoImprovement,
    ExternalStop,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::MaxRounds => "max_rounds",
            StopReason::ConvergedNoImprovement => "converged_no_improvement",
            StopReason::ExternalStop => "external_stop",
        };
        f.write_str(s)
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// Last accepted candidate; the seed when nothing was ever accepted.
    pub final_candidate_id: String,
    pub rounds_completed: u32,
    pub best_score: Option<f64>,
}

/// Drives proposal rounds until a termination condition holds.
///
/// The controller owns all mutable run state. The baseline candidate and
/// best score change only inside the deciding step of a round, so every
/// other component sees a consistent view: the proposer always revises the
/// current baseline, and a rejected or quarantined candidate leaves no
/// trace beyond its journal record.
///
/// Decision precedence within a round: gate violations first, then
/// unresolved evaluation failures (rollback), then hard limit breaches
/// (quarantine), then the overfit check, then score comparison.
pub struct IterationController {
    cfg: AgentConfig,
    proposer: Box<dyn Proposer>,
    gate: SafetyGate,
    comparator: WindowComparator,
    overfit: OverfitDetector,
    optimizer: TargetGapOptimizer,
    recovery: ErrorRecoveryManager,
    journal: RoundJournal,
    store: VersionStore,
    stop: Arc<AtomicBool>,
    state: ControllerState,
    baseline: Candidate,
    best_score: Option<f64>,
    stale_rounds: u32,
    directive: Option<String>,
    last_summary: Option<String>,
}

impl IterationController {
    /// Wire a controller around a seed artifact. The seed becomes the
    /// round-0 baseline without being evaluated; the first scored round is
    /// accepted on any positive score.
    pub fn new(
        cfg: AgentConfig,
        seed_content: String,
        proposer: Box<dyn Proposer>,
        engine: Arc<dyn EvalEngine>,
    ) -> Result<Self> {
        cfg.validate()?;
        let comparator = WindowComparator::new(engine, &cfg)
            .map_err(|e| AgentError::Config(ConfigError::Invalid(format!("worker pool: {e}"))))?;
        let results_dir = PathBuf::from(&cfg.run.results_dir);
        let journal = RoundJournal::new(results_dir.join("round_log.jsonl"));
        let store = VersionStore::new(results_dir.join("candidates"));
        let optimizer = TargetGapOptimizer::with_history(
            &cfg.targets,
            results_dir.join("target_gap_history.jsonl"),
        );
        let gate = SafetyGate::new(&cfg.gate);
        let overfit = OverfitDetector::new(&cfg.overfit);
        let recovery = ErrorRecoveryManager::new(&cfg.recovery);
        let baseline = Candidate::seed(seed_content);
        Ok(Self {
            cfg,
            proposer,
            gate,
            comparator,
            overfit,
            optimizer,
            recovery,
            journal,
            store,
            stop: Arc::new(AtomicBool::new(false)),
            state: ControllerState::Idle,
            baseline,
            best_score: None,
            stale_rounds: 0,
            directive: None,
            last_summary: None,
        })
    }

    /// Flag an external caller sets to request an orderly stop. The stop is
    /// observed at the next phase transition; the in-flight round is
    /// journaled before the run ends.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        info!(
            baseline = %self.baseline.id,
            max_rounds = self.cfg.run.max_rounds,
            windows = self.cfg.windows.len(),
            "run starting"
        );
        // The seed is version zero; rollback always has something to
        // restore.
        self.store.persist(&self.baseline)?;

        let mut rounds_completed = 0u32;
        let reason = loop {
            if rounds_completed >= self.cfg.run.max_rounds {
                break StopReason::MaxRounds;
            }
            if self.stop.load(Ordering::SeqCst) {
                break StopReason::ExternalStop;
            }
            let round = rounds_completed + 1;
            let (record, interrupted) = self.run_round(round)?;
            self.journal.append(&record)?;
            self.last_summary = Some(record.summary());
            rounds_completed = round;
            if interrupted {
                break StopReason::ExternalStop;
            }
            if self.stale_rounds >= self.cfg.run.stale_rounds_limit {
                break StopReason::ConvergedNoImprovement;
            }
        };

        self.state = ControllerState::Terminated;
        let outcome = RunOutcome {
            reason,
            final_candidate_id: self.baseline.id.clone(),
            rounds_completed,
            best_score: self.best_score,
        };
        info!(
            reason = %outcome.reason,
            rounds = outcome.rounds_completed,
            final_candidate = %outcome.final_candidate_id,
            best = ?outcome.best_score,
            "run finished"
        );
        Ok(outcome)
    }

    /// One full round. Returns the record to journal and whether an
    /// external stop truncated the round.
    fn run_round(&mut self, round: u32) -> Result<(RoundRecord, bool)> {
        self.state = ControllerState::Proposing;
        info!(round, baseline = %self.baseline.id, "round starting");

        let request = ProposerRequest {
            round,
            current_content: self.baseline.content.clone(),
            last_summary: self.last_summary.clone(),
            directive: self.directive.clone(),
            repair: None,
        };
        let proposal = match self.proposer.propose(&request) {
            Ok(p) => p,
            Err(e) => {
                // No usable proposal this round. The baseline carries over
                // and the loop moves on.
                warn!(round, error = %e, "skipping round");
                self.stale_rounds = 0;
                let record =
                    record_for(round, &self.baseline, Decision::Skip, "", e.to_string());
                return Ok((record, false));
            }
        };
        let rationale = excerpt(&proposal.rationale, 240);
        let mut candidate = Candidate::new(round, proposal.content, Some(self.baseline.id.clone()));
        debug!(
            round,
            candidate = %candidate.id,
            manifest_keys = proposal.manifest.len(),
            "proposal received"
        );

        if !self.enter(ControllerState::Gating) {
            return Ok((self.interrupted(round, &candidate, &rationale, None), true));
        }
        let gate_result = self.gate.validate(&candidate);
        if !gate_result.passed {
            candidate.status = CandidateStatus::Rejected;
            self.stale_rounds = 0;
            info!(round, candidate = %candidate.id, "rejected by gate");
            let record = record_for(
                round,
                &candidate,
                Decision::Reject,
                &rationale,
                format!("gate: {}", gate_result.summary()),
            );
            return Ok((record, false));
        }
        candidate.status = CandidateStatus::Validated;

        if !self.enter(ControllerState::Evaluating) {
            return Ok((self.interrupted(round, &candidate, &rationale, None), true));
        }
        let mut matrix = self.comparator.evaluate(&candidate, &self.cfg.windows, round);
        candidate.status = CandidateStatus::Evaluated;

        let mut repair_note = String::new();
        if matrix.has_failures() {
            let report = self.recovery.repair(
                &candidate,
                &matrix,
                round,
                self.proposer.as_ref(),
                &self.gate,
                |c| self.comparator.evaluate(c, &self.cfg.windows, round),
            );
            match report.resolution {
                RepairResolution::Resolved {
                    candidate: repaired,
                    matrix: fresh,
                } => {
                    info!(
                        round,
                        candidate = %repaired.id,
                        attempts = report.attempts_used,
                        "repair resolved"
                    );
                    repair_note = format!("repaired after {} attempts; ", report.attempts_used);
                    candidate = repaired;
                    matrix = fresh;
                }
                RepairResolution::Escalated => {
                    candidate.status = CandidateStatus::Quarantined;
                    self.stale_rounds = 0;
                    let escalated: Vec<String> = report
                        .incidents
                        .iter()
                        .filter(|i| i.state == IncidentState::Escalated)
                        .map(|i| format!("{} [{}]", i.window_id, i.kind))
                        .collect();
                    warn!(
                        round,
                        candidate = %candidate.id,
                        windows = %escalated.join(", "),
                        "recovery escalated, rolling back"
                    );
                    self.restore_baseline_artifact();
                    let mut record = record_for(
                        round,
                        &candidate,
                        Decision::Rollback,
                        &rationale,
                        format!(
                            "recovery escalated after {} attempts: {}",
                            report.attempts_used,
                            escalated.join(", ")
                        ),
                    );
                    attach_matrix(&mut record, &matrix);
                    return Ok((record, false));
                }
            }
        }

        if !self.enter(ControllerState::Scoring) {
            return Ok((
                self.interrupted(round, &candidate, &rationale, Some(&matrix)),
                true,
            ));
        }
        if matrix.invalid_in_sample() {
            candidate.status = CandidateStatus::Quarantined;
            self.stale_rounds = 0;
            let offenders: Vec<&str> = matrix
                .results
                .iter()
                .filter(|r| !r.holdout && !r.valid)
                .map(|r| r.window_id.as_str())
                .collect();
            warn!(round, candidate = %candidate.id, windows = %offenders.join(", "), "hard limit breach");
            let mut record = record_for(
                round,
                &candidate,
                Decision::Quarantine,
                &rationale,
                format!("{}hard limit breach in {}", repair_note, offenders.join(", ")),
            );
            attach_matrix(&mut record, &matrix);
            return Ok((record, false));
        }
        let Some(is_score) = matrix.is_mean_score else {
            candidate.status = CandidateStatus::Rejected;
            self.stale_rounds = 0;
            let mut record = record_for(
                round,
                &candidate,
                Decision::Reject,
                &rationale,
                format!("{repair_note}no valid in-sample score"),
            );
            attach_matrix(&mut record, &matrix);
            return Ok((record, false));
        };
        if is_score <= 0.0 {
            candidate.status = CandidateStatus::Rejected;
            self.stale_rounds = 0;
            let mut record = record_for(
                round,
                &candidate,
                Decision::Reject,
                &rationale,
                format!("{repair_note}non-positive in-sample score {is_score:.2}"),
            );
            attach_matrix(&mut record, &matrix);
            return Ok((record, false));
        }

        if !self.enter(ControllerState::Deciding) {
            return Ok((
                self.interrupted(round, &candidate, &rationale, Some(&matrix)),
                true,
            ));
        }
        let Some(oos_score) = matrix.oos_score else {
            candidate.status = CandidateStatus::Rejected;
            self.stale_rounds = 0;
            let mut record = record_for(
                round,
                &candidate,
                Decision::Reject,
                &rationale,
                format!("{repair_note}holdout produced no score; failing closed"),
            );
            attach_matrix(&mut record, &matrix);
            return Ok((record, false));
        };
        let verdict = self.overfit.check(is_score, oos_score);
        if let Some(v) = &verdict {
            if v.overfitting {
                candidate.status = CandidateStatus::Rejected;
                self.stale_rounds += 1;
                info!(
                    round,
                    candidate = %candidate.id,
                    ratio = v.ratio,
                    "rejected as overfit"
                );
                let mut record = record_for(
                    round,
                    &candidate,
                    Decision::Reject,
                    &rationale,
                    format!(
                        "{}overfit: is {:.2} oos {:.2} ratio {:.4} below {:.2}",
                        repair_note, is_score, oos_score, v.ratio, self.cfg.overfit.threshold
                    ),
                );
                attach_matrix(&mut record, &matrix);
                record.overfit_ratio = Some(v.ratio);
                return Ok((record, false));
            }
        }

        let improved = match self.best_score {
            Some(best) => is_improvement(is_score, best, self.cfg.run.min_improvement),
            None => true,
        };
        let (decision, note, gap_norm) = if improved {
            candidate.status = CandidateStatus::Promoted;
            self.store.persist(&candidate)?;
            atomic_write(Path::new(&self.cfg.run.artifact_path), &candidate.content)
                .map_err(|e| AgentError::Journal(format!("write live artifact: {e}")))?;

            let note = match self.best_score {
                Some(best) => format!("{repair_note}score {is_score:.2} improved best {best:.2}"),
                None => format!("{repair_note}first accepted revision, score {is_score:.2}"),
            };
            self.best_score = Some(is_score);
            self.stale_rounds = 0;

            // Steering always derives from the newly accepted candidate,
            // never from a rejected one.
            let mut gap_norm = None;
            if let Some(profile) = matrix.in_sample_profile() {
                let gap = self.optimizer.compute_gap(&profile, round);
                gap_norm = Some(gap.weighted_norm);
                if let Err(e) = self.optimizer.log_gap(&gap) {
                    warn!(error = %e, "gap history append failed");
                }
                self.directive = Some(self.optimizer.recommend(&gap).render());
            }
            self.baseline = candidate.clone();
            info!(round, candidate = %candidate.id, score = is_score, "candidate accepted");
            (Decision::Accept, note, gap_norm)
        } else {
            candidate.status = CandidateStatus::Rejected;
            self.stale_rounds += 1;
            let best = self.best_score.unwrap_or(0.0);
            info!(
                round,
                candidate = %candidate.id,
                score = is_score,
                best,
                stale = self.stale_rounds,
                "no improvement"
            );
            (
                Decision::Reject,
                format!(
                    "{}score {:.2} did not beat {:.2} by {:.2}",
                    repair_note, is_score, best, self.cfg.run.min_improvement
                ),
                None,
            )
        };

        let mut record = record_for(round, &candidate, decision, &rationale, note);
        attach_matrix(&mut record, &matrix);
        record.overfit_ratio = verdict.map(|v| v.ratio);
        record.gap_norm = gap_norm;
        Ok((record, false))
    }

    /// Check the stop flag before moving to the next phase.
    fn enter(&mut self, state: ControllerState) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            info!(?state, "external stop observed");
            return false;
        }
        self.state = state;
        true
    }

    fn interrupted(
        &self,
        round: u32,
        candidate: &Candidate,
        rationale: &str,
        matrix: Option<&ComparisonMatrix>,
    ) -> RoundRecord {
        let mut record = record_for(
            round,
            candidate,
            Decision::Skip,
            rationale,
            "external stop before decision".into(),
        );
        if let Some(m) = matrix {
            attach_matrix(&mut record, m);
        }
        record
    }

    /// Rewrite the live artifact from the stored baseline version. The
    /// in-memory baseline is the fallback when the store cannot serve it.
    fn restore_baseline_artifact(&self) {
        let content = match self.store.load(&self.baseline.id) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "stored baseline unavailable, using in-memory copy");
                self.baseline.content.clone()
            }
        };
        if let Err(e) = atomic_write(Path::new(&self.cfg.run.artifact_path), &content) {
            warn!(error = %e, "live artifact restore failed");
        }
    }
}

fn record_for(
    round: u32,
    candidate: &Candidate,
    decision: Decision,
    rationale: &str,
    note: String,
) -> RoundRecord {
    RoundRecord {
        round,
        timestamp: Utc::now(),
        candidate_id: candidate.id.clone(),
        parent_id: candidate.parent_id.clone(),
        decision,
        score: None,
        oos_score: None,
        overfit_ratio: None,
        robustness_score: None,
        gap_norm: None,
        windows: Vec::new(),
        rationale: rationale.to_string(),
        note,
    }
}

fn attach_matrix(record: &mut RoundRecord, matrix: &ComparisonMatrix) {
    record.score = matrix.is_mean_score;
    record.oos_score = matrix.oos_score;
    record.robustness_score = Some(matrix.robustness_score);
    record.windows = matrix.results.iter().map(WindowSummary::from).collect();
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use serde_json::{json, Map, Value};
    use sia_core::{EvaluationWindow, Regime};
    use sia_engine::EngineFailure;
    use tempfile::TempDir;

    use super::*;
    use crate::proposer::Proposal;

    // 2024-01-01 00:00:00 UTC.
    const MONDAY: i64 = 1_704_067_200;
    const DAY: i64 = 86_400;

    struct ScriptedProposer {
        script: Mutex<VecDeque<Result<Proposal>>>,
        calls: Arc<AtomicU32>,
        /// When set, every propose call trips this flag.
        stop: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    }

    impl ScriptedProposer {
        fn new(script: Vec<Result<Proposal>>) -> (Box<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let proposer = Box::new(Self {
                script: Mutex::new(script.into()),
                calls: Arc::clone(&calls),
                stop: Arc::new(Mutex::new(None)),
            });
            (proposer, calls)
        }
    }

    impl Proposer for ScriptedProposer {
        fn propose(&self, _request: &ProposerRequest) -> Result<Proposal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(flag) = self.stop.lock().unwrap().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(AgentError::ProposerUnavailable {
                    attempts: 3,
                    message: "script exhausted".into(),
                })
            })
        }
    }

    /// Engine whose report is steered by `# key = value` hints in the
    /// candidate text, so each scripted proposal controls its own scores.
    struct HintEngine;

    impl EvalEngine for HintEngine {
        fn evaluate(
            &self,
            candidate: &Candidate,
            window: &EvaluationWindow,
        ) -> std::result::Result<Value, EngineFailure> {
            if candidate.content.contains("# explode") {
                return Err(EngineFailure {
                    message: "KeyError: 'rsi_fast'".into(),
                    exit_status: Some(1),
                    timed_out: false,
                });
            }
            let is_profit = hint(&candidate.content, "profit").unwrap_or(50.0);
            let profit = if window.holdout {
                hint(&candidate.content, "oos_profit").unwrap_or(is_profit)
            } else {
                is_profit
            };
            let mut report = json!({
                "profit_total_pct": 5.0,
                "max_drawdown_pct": 10.0,
                "total_trades": 80,
                "win_rate": 0.5,
                "avg_trade_duration_hours": 10.0,
                "trades": [
                    { "open_ts": MONDAY, "close_ts": MONDAY + DAY, "profit": profit },
                ],
            });
            if let Some(dd) = hint(&candidate.content, "drawdown") {
                report["max_drawdown_pct"] = json!(dd);
            }
            Ok(report)
        }
    }

    fn hint(content: &str, key: &str) -> Option<f64> {
        let marker = format!("# {key} = ");
        content
            .lines()
            .find_map(|l| l.trim().strip_prefix(marker.as_str()))
            .and_then(|v| v.trim().parse().ok())
    }

    fn strategy(hints: &str) -> String {
        format!(
            r#"
class Strategy:
    stoploss = -0.25
    leverage = 3

    def can_open_trade(self, budget):
        return budget.remaining > 0

    def confirm_trade_entry(self, pair, amount):
        return True

controller = WeeklyBudgetController()
{hints}
"#
        )
    }

    /// Score for a hinted profit p is 0.4 * p + 1.0.
    fn proposal(hints: &str) -> Result<Proposal> {
        Ok(Proposal {
            content: strategy(hints),
            rationale: format!("set {hints}"),
            manifest: Map::new(),
        })
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

    fn test_config(dir: &Path) -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.windows = vec![make_window("is_a", false), make_window("oos_a", true)];
        cfg.run.max_rounds = 8;
        cfg.run.stale_rounds_limit = 3;
        cfg.run.min_improvement = 0.5;
        cfg.run.artifact_path = dir.join("strategy.py").display().to_string();
        cfg.run.results_dir = dir.join("results").display().to_string();
        cfg.comparator.max_workers = 2;
        cfg.limits.min_trades = 0;
        cfg.recovery.max_attempts = 2;
        cfg
    }

    fn controller(
        cfg: AgentConfig,
        script: Vec<Result<Proposal>>,
    ) -> (IterationController, Arc<AtomicU32>) {
        let (proposer, calls) = ScriptedProposer::new(script);
        let c = IterationController::new(cfg, strategy(""), proposer, Arc::new(HintEngine))
            .unwrap();
        (c, calls)
    }

    fn journal_of(cfg: &AgentConfig) -> RoundJournal {
        RoundJournal::new(PathBuf::from(&cfg.run.results_dir).join("round_log.jsonl"))
    }

    #[test]
    fn test_converges_after_stale_rounds_limit() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path());
        // Rounds 1 and 2 improve; 3 through 5 repeat round 2's content.
        let (mut c, _) = controller(
            cfg.clone(),
            vec![
                proposal("# profit = 100"),
                proposal("# profit = 150"),
                proposal("# profit = 150"),
                proposal("# profit = 150"),
                proposal("# profit = 150"),
            ],
        );

        let outcome = c.run().unwrap();

        assert_eq!(outcome.reason, StopReason::ConvergedNoImprovement);
        assert_eq!(outcome.rounds_completed, 5);
        assert!((outcome.best_score.unwrap() - 61.0).abs() < 1e-9);
        assert_eq!(c.state(), ControllerState::Terminated);

        let records = journal_of(&cfg).read_all().unwrap();
        let decisions: Vec<Decision> = records.iter().map(|r| r.decision).collect();
        assert_eq!(
            decisions,
            vec![
                Decision::Accept,
                Decision::Accept,
                Decision::Reject,
                Decision::Reject,
                Decision::Reject,
            ]
        );
        assert_eq!(outcome.final_candidate_id, records[1].candidate_id);
        assert!(records[4].note.contains("did not beat"));

        // The live artifact holds the round-2 revision.
        let live = fs::read_to_string(dir.path().join("strategy.py")).unwrap();
        assert_eq!(live, strategy("# profit = 150"));
    }

    #[test]
    fn test_max_rounds_stops_an_improving_run() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 3;
        let (mut c, _) = controller(
            cfg.clone(),
            vec![
                proposal("# profit = 100"),
                proposal("# profit = 150"),
                proposal("# profit = 200"),
            ],
        );

        let outcome = c.run().unwrap();

        assert_eq!(outcome.reason, StopReason::MaxRounds);
        assert_eq!(outcome.rounds_completed, 3);
        assert!((outcome.best_score.unwrap() - 81.0).abs() < 1e-9);
        let records = journal_of(&cfg).read_all().unwrap();
        assert!(records.iter().all(|r| r.decision == Decision::Accept));
        // Parent chain follows the accepted lineage.
        assert_eq!(records[1].parent_id.as_deref(), Some(records[0].candidate_id.as_str()));
        assert_eq!(records[2].parent_id.as_deref(), Some(records[1].candidate_id.as_str()));
    }

    #[test]
    fn test_external_stop_before_first_round() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path());
        let (mut c, calls) = controller(cfg.clone(), vec![proposal("# profit = 100")]);
        c.stop_flag().store(true, Ordering::SeqCst);

        let outcome = c.run().unwrap();

        assert_eq!(outcome.reason, StopReason::ExternalStop);
        assert_eq!(outcome.rounds_completed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.final_candidate_id.starts_with("r000-"));
        assert!(journal_of(&cfg).read_all().unwrap().is_empty());
    }

    #[test]
    fn test_stop_during_round_journals_before_exit() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path());
        let (proposer, _) = ScriptedProposer::new(vec![proposal("# profit = 100")]);
        let slot = Arc::clone(&proposer.stop);
        let mut c =
            IterationController::new(cfg.clone(), strategy(""), proposer, Arc::new(HintEngine))
                .unwrap();
        // The stop request lands while round 1 is mid-flight.
        *slot.lock().unwrap() = Some(c.stop_flag());

        let outcome = c.run().unwrap();

        assert_eq!(outcome.reason, StopReason::ExternalStop);
        assert_eq!(outcome.rounds_completed, 1);
        assert!(outcome.final_candidate_id.starts_with("r000-"));
        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, Decision::Skip);
        assert!(records[0].note.contains("external stop"));
    }

    #[test]
    fn test_gate_rejection_keeps_baseline_and_continues() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 2;
        let unsafe_proposal = Ok(Proposal {
            content: strategy("").replace("leverage = 3", "leverage = 50"),
            rationale: "crank leverage".into(),
            manifest: Map::new(),
        });
        let (mut c, _) = controller(cfg.clone(), vec![unsafe_proposal, proposal("# profit = 100")]);

        let outcome = c.run().unwrap();

        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Reject);
        assert!(records[0].note.contains("gate"));
        assert!(records[0].score.is_none());
        assert_eq!(records[1].decision, Decision::Accept);
        assert!((outcome.best_score.unwrap() - 41.0).abs() < 1e-9);
    }

    #[test]
    fn test_proposer_outage_skips_the_round() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 2;
        let outage = Err(AgentError::ProposerUnavailable {
            attempts: 3,
            message: "connection refused".into(),
        });
        let (mut c, _) = controller(cfg.clone(), vec![outage, proposal("# profit = 100")]);

        let outcome = c.run().unwrap();

        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Skip);
        assert!(records[0].note.contains("connection refused"));
        assert_eq!(records[1].decision, Decision::Accept);
        assert_eq!(outcome.rounds_completed, 2);
        assert_eq!(outcome.final_candidate_id, records[1].candidate_id);
    }

    #[test]
    fn test_escalation_rolls_back_to_baseline() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 1;
        // The proposal and both repair attempts fail evaluation.
        let (mut c, calls) = controller(
            cfg.clone(),
            vec![
                proposal("# explode 0"),
                proposal("# explode 1"),
                proposal("# explode 2"),
            ],
        );

        let outcome = c.run().unwrap();

        // One proposal plus exactly max_attempts repair requests.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.reason, StopReason::MaxRounds);
        assert!(outcome.best_score.is_none());
        assert!(outcome.final_candidate_id.starts_with("r000-"));

        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Rollback);
        assert!(records[0].note.contains("escalated after 2 attempts"));
        assert!(records[0].windows.iter().any(|w| w.failure.is_some()));

        // The live artifact still holds the seed content.
        let live = fs::read_to_string(dir.path().join("strategy.py")).unwrap();
        assert_eq!(live, strategy(""));
    }

    #[test]
    fn test_successful_repair_scores_the_round() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 1;
        let (mut c, _) = controller(
            cfg.clone(),
            vec![proposal("# explode 0"), proposal("# profit = 120")],
        );

        let outcome = c.run().unwrap();

        assert!((outcome.best_score.unwrap() - 49.0).abs() < 1e-9);
        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Accept);
        assert!(records[0].note.contains("repaired after 1 attempts"));
        // The repaired candidate descends from the failed proposal.
        let parent = records[0].parent_id.as_deref().unwrap();
        assert!(parent.starts_with("r001-"));
        assert_ne!(parent, records[0].candidate_id);
        assert_eq!(outcome.final_candidate_id, records[0].candidate_id);
    }

    #[test]
    fn test_overfit_candidate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 2;
        let (mut c, _) = controller(
            cfg.clone(),
            vec![
                proposal("# profit = 150\n# oos_profit = 10"),
                proposal("# profit = 100"),
            ],
        );

        let outcome = c.run().unwrap();

        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Reject);
        assert!(records[0].note.contains("overfit"));
        let ratio = records[0].overfit_ratio.unwrap();
        assert!(ratio < 0.6, "ratio {ratio}");
        // The overfit round never became the baseline.
        assert_eq!(records[1].decision, Decision::Accept);
        assert!((outcome.best_score.unwrap() - 41.0).abs() < 1e-9);
    }

    #[test]
    fn test_hard_limit_breach_quarantines() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 1;
        let (mut c, _) = controller(
            cfg.clone(),
            vec![proposal("# profit = 100\n# drawdown = 99")],
        );

        let outcome = c.run().unwrap();

        assert!(outcome.best_score.is_none());
        let records = journal_of(&cfg).read_all().unwrap();
        assert_eq!(records[0].decision, Decision::Quarantine);
        assert!(records[0].note.contains("is_a"));
        assert!(records[0].windows.iter().any(|w| !w.valid && w.failure.is_none()));
    }

    #[test]
    fn test_gap_directive_follows_acceptance() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.run.max_rounds = 1;
        let (mut c, _) = controller(cfg.clone(), vec![proposal("# profit = 100")]);

        c.run().unwrap();

        let records = journal_of(&cfg).read_all().unwrap();
        assert!(records[0].gap_norm.is_some());
        // Accepted rounds append to the gap history.
        let history = PathBuf::from(&cfg.run.results_dir).join("target_gap_history.jsonl");
        assert!(history.exists());
    }
}
