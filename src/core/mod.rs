//! Core scoring stages.
//!
//! This module contains:
//! - Feature normalization and smoothing
//! - Context classification
//! - Rolling per-subject baselines
//! - Signal fusion into composite scores
//! - Escalation and alert lifecycle
//! - Daily activity summaries, weekly trends and workplace violation tallies

pub mod baseline;
pub mod biography;
pub mod classify;
pub mod escalation;
pub mod fusion;
pub mod normalize;

// Re-export commonly used types
pub use baseline::{BaselineConfig, BaselineError, BaselineSnapshot, BaselineTracker, Deviation, FeatureStats};
pub use biography::{
    ActivityLedger, DailySummary, DayCounts, DriftLevel, SafetyEscalation, SafetyStanding, WeeklyTrend,
};
pub use classify::{Classification, ClassifyError, Context, ContextClassifier, SubMode};
pub use escalation::{Alert, EscalationEngine, EscalationOutcome, Level, Severity, Thresholds, Trend};
pub use fusion::{rank, CompositeScore, Contribution, ContributionStatus, FusionConfig, FusionEngine, WeightTable};
pub use normalize::{FeatureVector, NormalizeError, Normalizer, NormalizerConfig};
