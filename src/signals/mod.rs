//! Model and rule collaborators.
//!
//! Every collaborator, whether a wrapped ML model output or a hand-written
//! rule, implements [`SignalScorer`]. The [`ScorerRegistry`] runs the
//! scorers configured for a context and turns every failure mode into a
//! degraded [`SubSignal`] so nothing propagates as a pipeline fault.

pub mod rules;

use crate::core::classify::Context;
use crate::core::normalize::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub use rules::{ActivityRiskRule, PpeComplianceRule, PrecomputedSignal, RecoveryIndex, RecoveryIndexRule, ZoneSafetyRule};

/// Fall-risk model output.
pub const FALL_RISK: &str = "fall_risk";
/// Activity-based elderly risk.
pub const ACTIVITY_RISK: &str = "activity_risk";
/// PPE non-compliance.
pub const PPE_COMPLIANCE: &str = "ppe_compliance";
/// Zone and posture violations.
pub const ZONE_SAFETY: &str = "zone_safety";
/// Inverse of the rehabilitation status index.
pub const RECOVERY_RISK: &str = "recovery_risk";

/// Value used for any signal that could not be computed.
pub const NEUTRAL_VALUE: f64 = 0.5;

/// Health of a sub-signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalStatus {
    Ok,
    Degraded { reason: String },
}

/// A bounded [0, 1] score produced by a model or rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSignal {
    pub name: String,
    /// Model or rule that produced the value
    pub source: String,
    pub value: f64,
    pub confidence: f64,
    pub status: SignalStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl SubSignal {
    pub fn new(name: impl Into<String>, source: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            value,
            confidence: 1.0,
            status: SignalStatus::Ok,
            notes: Vec::new(),
        }
    }

    /// A neutral placeholder for a signal that could not be produced.
    pub fn degraded(name: impl Into<String>, source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            value: NEUTRAL_VALUE,
            confidence: 0.0,
            status: SignalStatus::Degraded { reason: reason.into() },
            notes: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, SignalStatus::Degraded { .. })
    }
}

/// Collaborator failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScorerError {
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("invalid input {input}: {value}")]
    InvalidInput { input: String, value: f64 },
    #[error("scorer failed: {0}")]
    Failed(String),
}

/// Capability shared by all model and rule collaborators.
pub trait SignalScorer: Send + Sync {
    /// Name of the sub-signal this scorer produces.
    fn name(&self) -> &str;

    /// Model or rule identifier.
    fn source(&self) -> &str;

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError>;
}

/// Sub-signals from one scorer pass plus failure counts.
#[derive(Debug, Clone, Default)]
pub struct ScorerRun {
    pub signals: Vec<SubSignal>,
    pub failures: u64,
    pub overruns: u64,
}

/// Scorers configured per context.
#[derive(Clone)]
pub struct ScorerRegistry {
    scorers: BTreeMap<Context, Vec<Arc<dyn SignalScorer>>>,
    budget: Duration,
}

impl ScorerRegistry {
    /// Create an empty registry with the given per-scorer time budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            scorers: BTreeMap::new(),
            budget,
        }
    }

    /// Registry wired with the built-in models and rules.
    pub fn with_defaults(budget: Duration) -> Self {
        let mut registry = Self::new(budget);
        registry.register(Context::Elderly, Arc::new(PrecomputedSignal::new("fall_prob", FALL_RISK, "fall_model")));
        registry.register(Context::Elderly, Arc::new(ActivityRiskRule));
        registry.register(Context::Workplace, Arc::new(PpeComplianceRule));
        registry.register(Context::Workplace, Arc::new(ZoneSafetyRule));
        registry.register(Context::Rehab, Arc::new(RecoveryIndexRule));
        registry
    }

    pub fn register(&mut self, context: Context, scorer: Arc<dyn SignalScorer>) {
        self.scorers.entry(context).or_default().push(scorer);
    }

    pub fn scorers(&self, context: Context) -> &[Arc<dyn SignalScorer>] {
        self.scorers.get(&context).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run every scorer for `context` against `features`.
    pub fn evaluate(&self, context: Context, features: &FeatureVector) -> ScorerRun {
        let mut run = ScorerRun::default();

        for scorer in self.scorers(context) {
            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| scorer.score(features)));
            let elapsed = started.elapsed();

            if elapsed > self.budget {
                run.overruns += 1;
                warn!(
                    scorer = scorer.name(),
                    subject = %features.subject_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Scorer exceeded its time budget"
                );
            }

            let signal = match result {
                Ok(Ok(signal)) if signal.value.is_finite() && (0.0..=1.0).contains(&signal.value) => signal,
                Ok(Ok(signal)) => {
                    SubSignal::degraded(scorer.name(), scorer.source(), format!("value out of range: {}", signal.value))
                }
                Ok(Err(e)) => SubSignal::degraded(scorer.name(), scorer.source(), e.to_string()),
                Err(_) => SubSignal::degraded(scorer.name(), scorer.source(), "scorer panicked"),
            };

            if let SignalStatus::Degraded { reason } = &signal.status {
                run.failures += 1;
                debug!(scorer = scorer.name(), subject = %features.subject_id, %reason, "Degraded sub-signal");
            }
            run.signals.push(signal);
        }

        run
    }
}

impl std::fmt::Debug for ScorerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: BTreeMap<&Context, Vec<&str>> = self
            .scorers
            .iter()
            .map(|(ctx, list)| (ctx, list.iter().map(|s| s.name()).collect()))
            .collect();
        f.debug_struct("ScorerRegistry")
            .field("scorers", &names)
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Panicking;

    impl SignalScorer for Panicking {
        fn name(&self) -> &str {
            "panicky"
        }
        fn source(&self) -> &str {
            "test"
        }
        fn score(&self, _features: &FeatureVector) -> Result<SubSignal, ScorerError> {
            panic!("model crashed")
        }
    }

    struct OutOfRange;

    impl SignalScorer for OutOfRange {
        fn name(&self) -> &str {
            "oversized"
        }
        fn source(&self) -> &str {
            "test"
        }
        fn score(&self, _features: &FeatureVector) -> Result<SubSignal, ScorerError> {
            Ok(SubSignal::new("oversized", "test", 1.7))
        }
    }

    #[test]
    fn test_failures_become_degraded_signals() {
        let mut registry = ScorerRegistry::new(Duration::from_secs(1));
        registry.register(Context::Rehab, Arc::new(Panicking));
        registry.register(Context::Rehab, Arc::new(OutOfRange));
        registry.register(Context::Rehab, Arc::new(RecoveryIndexRule));

        let fv = FeatureVector::empty("R1", Utc::now());
        let run = registry.evaluate(Context::Rehab, &fv);

        assert_eq!(run.signals.len(), 3);
        assert_eq!(run.failures, 3);
        for signal in &run.signals {
            assert!(signal.is_degraded());
            assert_eq!(signal.value, NEUTRAL_VALUE);
        }
    }

    #[test]
    fn test_default_registry_per_context() {
        let registry = ScorerRegistry::with_defaults(Duration::from_millis(50));
        let names: Vec<&str> = registry.scorers(Context::Elderly).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec![FALL_RISK, ACTIVITY_RISK]);
        assert_eq!(registry.scorers(Context::Workplace).len(), 2);
        assert_eq!(registry.scorers(Context::Rehab).len(), 1);
    }

    #[test]
    fn test_sub_signal_serialization() {
        let signal = SubSignal::degraded(PPE_COMPLIANCE, "ppe_rules", "missing input: ppe_*");
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"state\":\"degraded\""));
        let back: SubSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }
}
