//! Multi-armed bandit prompt optimization
//!
//! This module provides:
//! - Template registry with per-template locking
//! - Thompson Sampling, UCB1 and epsilon-greedy selection
//! - Heuristic reward scoring of generated policies
//! - Two-phase select/report token protocol with an ordered history
//! - Sessions with convergence detection
//! - Metrics snapshots and Prometheus exposition
//! - SQLite persistence (write-behind)

mod bandit;
mod metrics;
mod registry;
mod reward;
mod seed;
mod service;
mod session;
mod stats;
mod store;
mod tracker;
mod types;

pub use bandit::{BanditChoice, BanditSelector};
pub use metrics::{
    MetricsExporter, MetricsSnapshot, OptimizerMetrics, SessionSummary, TemplateSummary,
};
pub use registry::TemplateRegistry;
pub use reward::RewardEvaluator;
pub use seed::default_templates;
pub use service::{PromptOptimizer, PromptOptimizerBuilder, SynthesisOutcome};
pub use session::{ConvergenceDetector, DEFAULT_SESSION_ID, Session, SessionManager, SessionTally};
pub use stats::{ConfidenceModel, credible_interval, hoeffding_interval, intervals_overlap};
pub use store::{CREATE_OPTIMIZER_TABLES_SQL, OptimizerStore, SqliteOptimizerStore};
pub use tracker::{HistoryLog, Observation, PendingSelection, PendingSelections, PerformanceTracker};
pub use types::{
    ADAPTIVE_CATEGORY, Algorithm, CandidateSource, MabConfig, PerformanceRecord, PromptTemplate,
    REWARD_EPSILON, RewardComponents, RewardWeights, SelectionReason, SelectionRecord,
    SelectionToken, StatsDelta, SynthesisContext, TemplateHandle, TemplateStats,
};
