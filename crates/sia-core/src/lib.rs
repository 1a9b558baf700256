pub mod candidate;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod score;
pub mod settlement;
pub mod trade;
pub mod window;

pub use candidate::{content_sha256, Candidate, CandidateStatus};
pub use config::{AgentConfig, ConfigError, SettlementConfig};
pub use errors::{AgentError, FailureKind, Result};
pub use metrics::MetricsRecord;
pub use score::{compute_score, is_improvement};
pub use settlement::{classify_periods, PeriodReport, SettlementOutcome, SettlementSummary};
pub use trade::{CsvError, TradeLog};
pub use window::{EvaluationWindow, Regime};
