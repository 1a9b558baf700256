use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an evaluation failure, used to scope repair requests.
///
/// Classification is deterministic: the same failure signal always maps to
/// the same kind. Signals that match no known pattern classify as `Execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Candidate is malformed or references missing computed fields.
    Structural,
    /// The engine raised at runtime (including timeouts).
    Execution,
    /// Parameters outside engine-accepted bounds.
    Configuration,
    /// A required input range is missing.
    Data,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Structural => "structural",
            FailureKind::Execution => "execution",
            FailureKind::Configuration => "configuration",
            FailureKind::Data => "data",
        };
        f.write_str(s)
    }
}

/// Error taxonomy for the iteration agent.
///
/// The first four variants are round outcomes the controller has a defined
/// transition for; the rest are infrastructure faults surfaced to the
/// operator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("candidate rejected by safety gate: {0}")]
    GateViolation(String),

    #[error("evaluation failed ({kind}): {message}")]
    EvaluationFailure { kind: FailureKind, message: String },

    #[error("candidate overfit: is={is_score:.2} oos={oos_score:.2} ratio={ratio:.4}")]
    OverfitRejection {
        is_score: f64,
        oos_score: f64,
        ratio: f64,
    },

    #[error("proposer unavailable after {attempts} attempts: {message}")]
    ProposerUnavailable { attempts: u32, message: String },

    #[error("malformed proposer response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("report error: {0}")]
    Report(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
