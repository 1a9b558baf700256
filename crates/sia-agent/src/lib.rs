pub mod controller;
pub mod gate;
pub mod journal;
pub mod optimizer;
pub mod proposer;
pub mod recovery;

pub use controller::{ControllerState, IterationController, RunOutcome, StopReason};
pub use gate::{GateResult, SafetyGate, Violation};
pub use journal::{Decision, RoundJournal, RoundRecord, VersionStore, WindowSummary};
pub use optimizer::{Directive, GapVector, MetricKey, SearchMode, TargetGapOptimizer};
pub use proposer::{HttpProposer, Proposal, Proposer, ProposerRequest};
pub use recovery::{
    classify_failure, AttemptOutcome, ErrorIncident, ErrorRecoveryManager, FixAttempt,
    IncidentState, RepairReport, RepairResolution,
};
