//! Per-shard scoring pipeline.
//!
//! A [`Pipeline`] owns the mutable state for the subjects routed to one
//! shard and runs every sample through the same sequence of stages:
//!
//! ```text
//! MotionSample ─→ canonicalize ─→ classify ─→ order check ─→ smooth
//!                                                              │
//!     ┌────────────────────────────────────────────────────────┘
//!     ▼
//! deviation ─→ baseline update ─→ scorers ─→ fuse ─→ ledger ─→ escalate
//! ```
//!
//! Deviation is measured against the baseline as it stood before the
//! sample, so a sample never dampens its own z-score.

use crate::config::{Config, ConfigError};
use crate::core::baseline::{BaselineError, BaselineSnapshot, BaselineTracker, Deviation};
use crate::core::biography::{ActivityLedger, DailySummary, DriftLevel, SafetyStanding, WeeklyTrend};
use crate::core::classify::{Classification, ClassifyError, Context, ContextClassifier};
use crate::core::escalation::{Alert, EscalationEngine, Level};
use crate::core::fusion::{CompositeScore, FusionEngine};
use crate::core::normalize::{canonicalize, NormalizeError, Normalizer};
use crate::feed::MotionSample;
use crate::signals::{rules::zone_violations, ScorerRegistry};
use crate::sink::{load_baseline, DocumentStore, SinkRecord};
use crate::telemetry::{DropReason, SharedEngineStats};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reasons a sample is dropped without producing a score.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed sample: {0}")]
    Malformed(#[from] NormalizeError),
    #[error(transparent)]
    Unresolved(#[from] ClassifyError),
    #[error(transparent)]
    OutOfOrder(#[from] BaselineError),
}

impl PipelineError {
    pub fn kind(&self) -> DropReason {
        match self {
            PipelineError::Malformed(_) => DropReason::Malformed,
            PipelineError::Unresolved(_) => DropReason::UnresolvedContext,
            PipelineError::OutOfOrder(_) => DropReason::OutOfOrder,
        }
    }
}

/// Everything one sample produced.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub classification: Classification,
    pub deviation: Deviation,
    pub score: CompositeScore,
    pub previous_level: Level,
    pub level: Level,
    pub opened: Option<Alert>,
    pub resolved: Vec<Alert>,
    pub baseline: BaselineSnapshot,
    /// Summary of a local day that ended with this sample
    pub finished_day: Option<DailySummary>,
    /// Running violation record, for workplace subjects
    pub safety: Option<SafetyStanding>,
}

impl ProcessOutcome {
    /// Records to persist, in write order.
    pub fn into_records(self) -> Vec<SinkRecord> {
        let mut records = Vec::with_capacity(3 + self.resolved.len());
        records.push(SinkRecord::Score(Box::new(self.score)));
        if let Some(alert) = self.opened {
            records.push(SinkRecord::Alert(Box::new(alert)));
        }
        records.extend(self.resolved.into_iter().map(|a| SinkRecord::Alert(Box::new(a))));
        records.push(SinkRecord::Baseline(Box::new(self.baseline)));
        if let Some(day) = self.finished_day {
            records.push(SinkRecord::DailySummary(Box::new(day)));
        }
        records
    }
}

/// Records produced when a subject's session is closed.
#[derive(Debug, Clone, Default)]
pub struct SessionClose {
    pub baseline: Option<BaselineSnapshot>,
    pub day: Option<DailySummary>,
}

impl SessionClose {
    pub fn into_records(self) -> Vec<SinkRecord> {
        let mut records = Vec::new();
        if let Some(baseline) = self.baseline {
            records.push(SinkRecord::Baseline(Box::new(baseline)));
        }
        if let Some(day) = self.day {
            records.push(SinkRecord::DailySummary(Box::new(day)));
        }
        records
    }
}

/// Stateful scoring pipeline for a set of subjects.
pub struct Pipeline {
    normalizer: Normalizer,
    classifier: ContextClassifier,
    baselines: BaselineTracker,
    fusion: FusionEngine,
    escalation: EscalationEngine,
    ledger: ActivityLedger,
    scorers: ScorerRegistry,
    /// Store consulted once per subject for a persisted baseline
    store: Option<Arc<dyn DocumentStore>>,
    seen: HashSet<String>,
    stats: SharedEngineStats,
}

impl Pipeline {
    /// Build a pipeline from a validated configuration.
    pub fn new(
        config: &Config,
        scorers: ScorerRegistry,
        store: Option<Arc<dyn DocumentStore>>,
        stats: SharedEngineStats,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            normalizer: Normalizer::new(&config.normalizer),
            classifier: ContextClassifier::new(config.registry.clone()),
            baselines: BaselineTracker::new(config.baseline.clone()),
            fusion: FusionEngine::new(config.fusion.clone(), config.weight_tables()),
            escalation: EscalationEngine::new(config.thresholds())?,
            ledger: ActivityLedger::new(config.tz()?),
            scorers,
            store,
            seen: HashSet::new(),
            stats,
        })
    }

    /// Score one sample.
    pub fn process(&mut self, sample: &MotionSample) -> Result<ProcessOutcome, PipelineError> {
        let mut features = canonicalize(sample)?;
        let subject_id = features.subject_id.clone();
        let classification = self
            .classifier
            .classify(&subject_id, &features, sample.context_hint.as_deref())?;
        let context = classification.context;

        self.warm_start(&subject_id);
        self.baselines.check_order(&subject_id, features.timestamp)?;
        self.normalizer.smooth(&mut features);
        self.baselines.set_context(&subject_id, context);

        let deviation = self.baselines.deviation(&subject_id, &features);
        let baseline = self.baselines.update(&subject_id, &features, features.timestamp)?;

        let run = self.scorers.evaluate(context, &features);
        self.stats.record_scorer_failures(run.failures, run.overruns);

        let score = self
            .fusion
            .fuse(&subject_id, features.timestamp, context, &deviation, &run.signals);

        let finished_day = self.ledger.record(&features);
        let safety = match context {
            Context::Workplace => {
                let found = zone_violations(&features).len() as u32;
                Some(self.ledger.record_violations(&features, found))
            }
            _ => None,
        };
        let narratives = match context {
            Context::Elderly => self.concerns(&subject_id),
            Context::Workplace => safety.and_then(|s| s.narrative()).into_iter().collect(),
            Context::Rehab => self.rehab_progress(&subject_id).into_iter().collect(),
        };

        let outcome = self.escalation.evaluate(&score, &narratives);

        self.stats.record_processed();
        self.stats.record_score();
        if outcome.opened.is_some() {
            self.stats.record_alert_opened();
        }
        if !outcome.resolved.is_empty() {
            self.stats.record_alerts_resolved(outcome.resolved.len() as u64);
        }

        debug!(
            subject = %subject_id,
            context = %context,
            score = score.value,
            level = ?outcome.level,
            "Scored sample"
        );

        Ok(ProcessOutcome {
            classification,
            deviation,
            score,
            previous_level: outcome.previous,
            level: outcome.level,
            opened: outcome.opened,
            resolved: outcome.resolved,
            baseline,
            finished_day,
            safety,
        })
    }

    /// End a subject's session: archive the baseline and reset smoothing.
    pub fn close_session(&mut self, subject_id: &str) -> SessionClose {
        self.normalizer.close_session(subject_id);
        let baseline = self.baselines.archive(subject_id);
        let day = self.ledger.close_session(subject_id);
        if baseline.is_some() {
            info!(subject = %subject_id, "Session closed, baseline archived");
        }
        SessionClose { baseline, day }
    }

    pub fn baseline(&self, subject_id: &str) -> Option<BaselineSnapshot> {
        self.baselines.snapshot(subject_id)
    }

    pub fn level(&self, subject_id: &str) -> Level {
        self.escalation.level(subject_id)
    }

    pub fn open_alerts(&self, subject_id: &str) -> &[Alert] {
        self.escalation.open_alerts(subject_id)
    }

    /// Weekly activity trend ending on the subject's most recent local day.
    pub fn weekly_trend(&self, subject_id: &str) -> Option<WeeklyTrend> {
        let day = self.ledger.current_day(subject_id)?;
        Some(self.ledger.weekly_trend(subject_id, day))
    }

    /// Load a persisted baseline the first time a subject is seen.
    fn warm_start(&mut self, subject_id: &str) {
        if !self.seen.insert(subject_id.to_string()) || self.baselines.contains(subject_id) {
            return;
        }
        let Some(store) = &self.store else { return };

        match load_baseline(store.as_ref(), subject_id) {
            Ok(Some(snapshot)) => {
                self.baselines.restore(&snapshot);
                self.fusion.seed_version(subject_id, snapshot.version);
                info!(
                    subject = %subject_id,
                    samples = snapshot.sample_count,
                    version = snapshot.version,
                    "Restored baseline"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(subject = %subject_id, "Could not load baseline, starting fresh: {e}"),
        }
    }

    /// Weekly mobility narratives worth attaching to an elderly alert.
    fn concerns(&self, subject_id: &str) -> Vec<String> {
        let Some(trend) = self.weekly_trend(subject_id) else {
            return Vec::new();
        };
        let mut concerns: Vec<String> = trend.concerns().cloned().collect();
        if trend.drift_level > DriftLevel::Low {
            concerns.push(format!(
                "Mobility drift {} ({} of 3 indicators).",
                trend.drift_level, trend.drift_score
            ));
        }
        concerns
    }

    fn rehab_progress(&self, subject_id: &str) -> Option<String> {
        let day = self.ledger.current_day(subject_id)?;
        let summary = self.ledger.daily_summary(subject_id, day)?;
        Some(format!("Rehab progress today {:.0}/100.", summary.rehab_progress_score))
    }

    /// Running workplace violation record for a subject.
    pub fn safety_standing(&self, subject_id: &str) -> SafetyStanding {
        self.ledger.safety_standing(subject_id)
    }
}
