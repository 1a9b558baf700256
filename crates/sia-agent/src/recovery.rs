use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use sia_core::{AgentError, Candidate, CandidateStatus, FailureKind};
use sia_engine::ComparisonMatrix;

use crate::gate::SafetyGate;
use crate::proposer::{Proposer, ProposerRequest};

static STRUCTURAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)SyntaxError|IndentationError|NameError|AttributeError|KeyError|unexpected token|unknown (?:field|column|indicator)")
        .expect("structural regex is valid")
});
static CONFIGURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bconfig(?:uration)?\b|\bsettings\b|\bparameter\b|invalid value|out of (?:range|bounds)")
        .expect("configuration regex is valid")
});
static DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdata\b|\bcandles\b|\bdownload\b|\btimerange\b|missing range|\bpairs\b")
        .expect("data regex is valid")
});

/// Classify a failure signal into a repair scope.
///
/// Patterns are tried structural, then configuration, then data; anything
/// unmatched is an execution failure. The same signal always yields the
/// same kind.
pub fn classify_failure(signal: &str) -> FailureKind {
    if STRUCTURAL_RE.is_match(signal) {
        FailureKind::Structural
    } else if CONFIGURATION_RE.is_match(signal) {
        FailureKind::Configuration
    } else if DATA_RE.is_match(signal) {
        FailureKind::Data
    } else {
        FailureKind::Execution
    }
}

/// Lifecycle of one incident. `Resolved` and `Escalated` are terminal; a
/// window that fails again under a later candidate opens a new incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Repairing,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// No usable repair came back from the proposer.
    NoProposal,
    /// The repaired artifact violated the safety gate.
    GateFailed,
    /// The window failed again under the repaired artifact.
    StillFailing,
    Resolved,
}

/// One entry in an incident's repair ledger.
#[derive(Debug, Clone, Serialize)]
pub struct FixAttempt {
    pub attempt_no: u32,
    /// Repaired candidate the attempt produced, absent when no proposal
    /// was obtained.
    pub candidate_id: Option<String>,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

/// One failing (candidate, window) pair and its repair history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorIncident {
    pub window_id: String,
    /// Candidate that first failed this window.
    pub candidate_id: String,
    /// Classification fixed at open; the message refreshes per attempt.
    pub kind: FailureKind,
    pub message: String,
    pub state: IncidentState,
    pub attempts: Vec<FixAttempt>,
}

impl ErrorIncident {
    fn open(window_id: &str, candidate_id: &str, message: &str) -> Self {
        let kind = classify_failure(message);
        debug!(window = window_id, %kind, "incident opened");
        Self {
            window_id: window_id.to_string(),
            candidate_id: candidate_id.to_string(),
            kind,
            message: message.to_string(),
            state: IncidentState::Open,
            attempts: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, IncidentState::Open | IncidentState::Repairing)
    }

    fn record(
        &mut self,
        attempt_no: u32,
        candidate_id: Option<&str>,
        outcome: AttemptOutcome,
        detail: &str,
    ) {
        self.attempts.push(FixAttempt {
            attempt_no,
            candidate_id: candidate_id.map(str::to_string),
            outcome,
            detail: detail.to_string(),
        });
    }
}

/// How a repair pass ended.
#[derive(Debug)]
pub enum RepairResolution {
    /// Every incident closed; the round continues with the repaired
    /// candidate and its fresh matrix.
    Resolved {
        candidate: Candidate,
        matrix: ComparisonMatrix,
    },
    /// Attempts exhausted or no repairs could be obtained. The caller
    /// discards the candidate and rolls back.
    Escalated,
}

/// Resolution plus the full incident ledger for the journal.
#[derive(Debug)]
pub struct RepairReport {
    pub resolution: RepairResolution,
    pub incidents: Vec<ErrorIncident>,
    pub attempts_used: u32,
}

/// Drives bounded repair of evaluation failures.
///
/// Every failing window opens an [`ErrorIncident`]. An attempt asks the
/// proposer for a corrected artifact scoped to the open incidents, re-gates
/// it, and re-evaluates all windows; the repair is a new candidate
/// descending from the failed one, so a (candidate, window) pair never
/// resolves twice. A gate failure or an unusable response consumes the
/// attempt. After `max_attempts` unresolved attempts every open incident
/// escalates; there is no unbounded retry path.
pub struct ErrorRecoveryManager {
    max_attempts: u32,
}

impl ErrorRecoveryManager {
    pub fn new(cfg: &sia_core::config::RecoveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
        }
    }

    pub fn repair<F>(
        &self,
        failed: &Candidate,
        matrix: &ComparisonMatrix,
        round: u32,
        proposer: &dyn Proposer,
        gate: &SafetyGate,
        mut evaluate: F,
    ) -> RepairReport
    where
        F: FnMut(&Candidate) -> ComparisonMatrix,
    {
        let mut incidents: Vec<ErrorIncident> = matrix
            .failed_windows()
            .map(|r| {
                ErrorIncident::open(
                    &r.window_id,
                    &failed.id,
                    r.failure.as_deref().unwrap_or("unknown failure"),
                )
            })
            .collect();
        debug_assert!(!incidents.is_empty());

        let mut current = failed.clone();
        let mut gate_note: Option<String> = None;

        for attempt_no in 1..=self.max_attempts {
            for incident in incidents.iter_mut().filter(|i| i.is_open()) {
                incident.state = IncidentState::Repairing;
            }
            let open = incidents.iter().filter(|i| i.is_open()).count();
            info!(round, attempt = attempt_no, open, "requesting repair");

            let request = ProposerRequest {
                round,
                current_content: current.content.clone(),
                last_summary: None,
                directive: None,
                repair: Some(repair_context(&incidents, gate_note.as_deref())),
            };
            let proposal = match proposer.propose(&request) {
                Ok(p) => p,
                Err(AgentError::ProposerUnavailable { message, .. }) => {
                    warn!(attempt = attempt_no, error = %message, "proposer unavailable during repair");
                    record_on_open(
                        &mut incidents,
                        attempt_no,
                        None,
                        AttemptOutcome::NoProposal,
                        &message,
                    );
                    return escalate(incidents, attempt_no);
                }
                Err(e) => {
                    // A garbled response consumes the attempt; the next one
                    // retries with the same context.
                    warn!(attempt = attempt_no, error = %e, "repair proposal unusable");
                    record_on_open(
                        &mut incidents,
                        attempt_no,
                        None,
                        AttemptOutcome::NoProposal,
                        &e.to_string(),
                    );
                    continue;
                }
            };

            let mut repaired = Candidate::new(round, proposal.content, Some(current.id.clone()));
            let gate_result = gate.validate(&repaired);
            if !gate_result.passed {
                let summary = gate_result.summary();
                warn!(
                    attempt = attempt_no,
                    candidate = %repaired.id,
                    violations = %summary,
                    "repair rejected by gate"
                );
                record_on_open(
                    &mut incidents,
                    attempt_no,
                    Some(&repaired.id),
                    AttemptOutcome::GateFailed,
                    &summary,
                );
                repaired.status = CandidateStatus::Rejected;
                gate_note = Some(summary);
                current = repaired;
                continue;
            }
            repaired.status = CandidateStatus::Validated;
            gate_note = None;

            let fresh = evaluate(&repaired);
            repaired.status = CandidateStatus::Evaluated;

            for incident in incidents.iter_mut().filter(|i| i.is_open()) {
                let failure = fresh
                    .result(&incident.window_id)
                    .and_then(|r| r.failure.as_deref());
                match failure {
                    None => {
                        incident.state = IncidentState::Resolved;
                        incident.record(
                            attempt_no,
                            Some(&repaired.id),
                            AttemptOutcome::Resolved,
                            "window passed under repair",
                        );
                    }
                    Some(signal) => {
                        incident.message = signal.to_string();
                        incident.record(
                            attempt_no,
                            Some(&repaired.id),
                            AttemptOutcome::StillFailing,
                            signal,
                        );
                    }
                }
            }

            // A repair can break a window that passed before; that is a new
            // incident against the repaired candidate.
            let introduced: Vec<ErrorIncident> = fresh
                .failed_windows()
                .filter(|r| !incidents.iter().any(|i| i.window_id == r.window_id && i.is_open()))
                .map(|r| {
                    ErrorIncident::open(
                        &r.window_id,
                        &repaired.id,
                        r.failure.as_deref().unwrap_or("unknown failure"),
                    )
                })
                .collect();
            incidents.extend(introduced);

            if incidents.iter().all(|i| !i.is_open()) {
                info!(
                    attempt = attempt_no,
                    candidate = %repaired.id,
                    "all incidents resolved"
                );
                return RepairReport {
                    resolution: RepairResolution::Resolved {
                        candidate: repaired,
                        matrix: fresh,
                    },
                    incidents,
                    attempts_used: attempt_no,
                };
            }
            current = repaired;
        }

        escalate(incidents, self.max_attempts)
    }
}

fn escalate(mut incidents: Vec<ErrorIncident>, attempts_used: u32) -> RepairReport {
    let mut escalated = 0;
    for incident in incidents.iter_mut().filter(|i| i.is_open()) {
        incident.state = IncidentState::Escalated;
        escalated += 1;
    }
    warn!(attempts = attempts_used, escalated, "escalating open incidents");
    RepairReport {
        resolution: RepairResolution::Escalated,
        incidents,
        attempts_used,
    }
}

fn record_on_open(
    incidents: &mut [ErrorIncident],
    attempt_no: u32,
    candidate_id: Option<&str>,
    outcome: AttemptOutcome,
    detail: &str,
) {
    for incident in incidents.iter_mut().filter(|i| i.is_open()) {
        incident.record(attempt_no, candidate_id, outcome, detail);
    }
}

fn repair_context(incidents: &[ErrorIncident], gate_note: Option<&str>) -> String {
    let mut lines: Vec<String> = incidents
        .iter()
        .filter(|i| i.is_open())
        .map(|i| format!("window {} [{}]: {}", i.window_id, i.kind, i.message))
        .collect();
    if let Some(note) = gate_note {
        lines.push(format!("previous repair violated the safety gate: {note}"));
    }
    lines.join("\n")
}
