//! Experiment engine: audience targeting, deterministic sticky variant
//! assignment, event tracking, results with significance testing, feature
//! flags and schedule-driven status transitions.

pub mod assignment;
pub mod audience;
pub mod clock;
pub mod engine;
pub mod fence;
pub mod flags;
pub mod hashing;
pub mod insights;
pub mod lifecycle;
pub mod results;
pub mod stats;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{EngineContext, ExperimentEngine};
pub use fence::CommitFence;
pub use flags::{FlagEvaluation, FlagReason};
pub use hashing::{Sha256Hash, StableHash};
pub use insights::TypeInsight;
pub use lifecycle::StatusChange;
pub use results::{ExperimentReport, Recommendation, RecommendationAction};
pub use stats::{SignificanceTest, TwoProportionZTest};
pub use store::{ExperimentStore, InMemoryExperimentStore, InMemoryUserDirectory, UserDirectory};
