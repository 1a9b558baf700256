pub mod aggregator;
pub mod comparator;
pub mod engine;
pub mod overfit;
pub mod stats;

pub use aggregator::{AggregateError, MetricsAggregator};
pub use comparator::{ComparisonMatrix, WindowComparator, WindowResult};
pub use engine::{EngineFailure, EvalEngine, SubprocessEngine};
pub use overfit::{OverfitDetector, OverfitVerdict};
pub use stats::{RobustnessEstimator, RobustnessStats};
