//! Escalation and alerting.
//!
//! Each subject moves through `Normal -> Watch -> Warning -> Critical`.
//! Stepping up happens immediately on crossing a threshold and opens an
//! alert. Stepping down requires the score to stay below the current
//! level's threshold minus a margin for `cooldown` consecutive evaluations,
//! and only ever drops one level at a time. Reaching `Normal` resolves every
//! open alert for the subject.

use crate::config::ConfigError;
use crate::core::classify::Context;
use crate::core::fusion::{CompositeScore, ContributionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

/// Number of recent values kept for trend detection.
const TREND_WINDOW: usize = 3;

/// Contributors listed in an alert's reasons.
const TOP_CONTRIBUTORS: usize = 3;

/// Escalation thresholds for one context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub watch: f64,
    pub warning: f64,
    pub critical: f64,
    /// Hysteresis margin below a level's threshold
    pub margin: f64,
    /// Consecutive evaluations below threshold - margin before stepping down
    pub cooldown: u32,
}

impl Thresholds {
    pub fn defaults_for(context: Context) -> Self {
        match context {
            Context::Elderly => Self {
                watch: 0.45,
                warning: 0.6,
                critical: 0.75,
                margin: 0.05,
                cooldown: 3,
            },
            Context::Workplace => Self {
                watch: 0.4,
                warning: 0.6,
                critical: 0.8,
                margin: 0.05,
                cooldown: 3,
            },
            Context::Rehab => Self {
                watch: 0.5,
                warning: 0.65,
                critical: 0.8,
                margin: 0.05,
                cooldown: 3,
            },
        }
    }

    /// Thresholds must increase strictly across levels within (0, 1].
    pub fn validate(&self, context: Context) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidThreshold { context, reason };

        for (name, value) in [("watch", self.watch), ("warning", self.warning), ("critical", self.critical)] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(invalid(format!("{name} threshold {value} outside (0, 1]")));
            }
        }
        if !(self.watch < self.warning && self.warning < self.critical) {
            return Err(invalid(format!(
                "thresholds not increasing: watch {} warning {} critical {}",
                self.watch, self.warning, self.critical
            )));
        }
        if !self.margin.is_finite() || self.margin < 0.0 || self.margin >= self.watch {
            return Err(invalid(format!("margin {} outside [0, watch)", self.margin)));
        }
        if self.cooldown == 0 {
            return Err(invalid("cooldown must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Highest level whose threshold `value` reaches.
    pub fn level_for(&self, value: f64) -> Level {
        if value >= self.critical {
            Level::Critical
        } else if value >= self.warning {
            Level::Warning
        } else if value >= self.watch {
            Level::Watch
        } else {
            Level::Normal
        }
    }

    pub fn threshold(&self, level: Level) -> Option<f64> {
        match level {
            Level::Normal => None,
            Level::Watch => Some(self.watch),
            Level::Warning => Some(self.warning),
            Level::Critical => Some(self.critical),
        }
    }
}

/// Escalation level of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    Normal,
    Watch,
    Warning,
    Critical,
}

impl Level {
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Level::Normal => None,
            Level::Watch => Some(Severity::Info),
            Level::Warning => Some(Severity::Warning),
            Level::Critical => Some(Severity::Critical),
        }
    }

    fn step_down(self) -> Self {
        match self {
            Level::Critical => Level::Warning,
            Level::Warning => Level::Watch,
            Level::Watch | Level::Normal => Level::Normal,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Normal => "normal",
            Level::Watch => "watch",
            Level::Warning => "warning",
            Level::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Direction of the last few composite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

impl Trend {
    fn of(values: &VecDeque<f64>) -> Self {
        if values.len() < TREND_WINDOW {
            return Trend::Flat;
        }
        let pairs: Vec<(f64, f64)> = values.iter().zip(values.iter().skip(1)).map(|(a, b)| (*a, *b)).collect();
        if pairs.iter().all(|(a, b)| b > a) {
            Trend::Rising
        } else if pairs.iter().all(|(a, b)| b < a) {
            Trend::Falling
        } else {
            Trend::Flat
        }
    }
}

/// Reference to the composite score that triggered an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRef {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub value: f64,
}

impl From<&CompositeScore> for ScoreRef {
    fn from(score: &CompositeScore) -> Self {
        Self {
            key: score.key(),
            timestamp: score.timestamp,
            version: score.version,
            value: score.value,
        }
    }
}

/// A structured alert event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub subject_id: String,
    pub context: Context,
    pub severity: Severity,
    pub score: ScoreRef,
    pub recommended_action: String,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Document key, shared with the triggering score.
    pub fn key(&self) -> &str {
        &self.score.key
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Escalation decision for one score.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOutcome {
    pub previous: Level,
    pub level: Level,
    pub trend: Trend,
    pub opened: Option<Alert>,
    pub resolved: Vec<Alert>,
}

/// Action text for a context and severity.
pub fn recommended_action(context: Context, severity: Severity) -> &'static str {
    match (context, severity) {
        (Context::Elderly, Severity::Info) => {
            "Notify caregiver: review today's mobility summary and check in with the resident."
        }
        (Context::Elderly, Severity::Warning) => {
            "Caregiver check-in required: confirm wellbeing and review recent transitions and near falls."
        }
        (Context::Elderly, Severity::Critical) => {
            "Immediate caregiver response: possible fall or acute mobility change. Verify the resident's status now."
        }
        (Context::Workplace, Severity::Info) => "Notify worker: follow PPE and zone safety rules.",
        (Context::Workplace, Severity::Warning) => {
            "Supervisor notification: verify PPE and zone compliance on site."
        }
        (Context::Workplace, Severity::Critical) => {
            "Escalate to site admin: stop work in the affected area and dispatch a supervisor."
        }
        (Context::Rehab, Severity::Info) => "Therapist review: note the recovery trend at the next session.",
        (Context::Rehab, Severity::Warning) => {
            "Therapist follow-up: schedule a check-in and review the recovery plan."
        }
        (Context::Rehab, Severity::Critical) => {
            "Clinical escalation: contact the patient's care team immediately."
        }
    }
}

#[derive(Debug, Default)]
struct SubjectState {
    level: Level,
    below_count: u32,
    recent: VecDeque<f64>,
    open: Vec<Alert>,
}

/// Per-subject escalation state machines.
#[derive(Debug)]
pub struct EscalationEngine {
    thresholds: HashMap<Context, Thresholds>,
    subjects: HashMap<String, SubjectState>,
}

impl EscalationEngine {
    /// Validate and install thresholds. Contexts left out use the defaults.
    pub fn new(mut thresholds: HashMap<Context, Thresholds>) -> Result<Self, ConfigError> {
        for context in Context::ALL {
            thresholds
                .entry(context)
                .or_insert_with(|| Thresholds::defaults_for(context))
                .validate(context)?;
        }
        Ok(Self {
            thresholds,
            subjects: HashMap::new(),
        })
    }

    pub fn level(&self, subject_id: &str) -> Level {
        self.subjects.get(subject_id).map(|s| s.level).unwrap_or_default()
    }

    pub fn open_alerts(&self, subject_id: &str) -> &[Alert] {
        self.subjects
            .get(subject_id)
            .map(|s| s.open.as_slice())
            .unwrap_or(&[])
    }

    /// Run the state machine for one score.
    ///
    /// `narratives` are appended to the reasons of any alert opened here.
    pub fn evaluate(&mut self, score: &CompositeScore, narratives: &[String]) -> EscalationOutcome {
        let thresholds = self
            .thresholds
            .get(&score.context)
            .copied()
            .unwrap_or_else(|| Thresholds::defaults_for(score.context));
        let state = self.subjects.entry(score.subject_id.clone()).or_default();

        state.recent.push_back(score.value);
        while state.recent.len() > TREND_WINDOW {
            state.recent.pop_front();
        }
        let trend = Trend::of(&state.recent);

        let previous = state.level;
        let crossed = thresholds.level_for(score.value);
        let mut opened = None;
        let mut resolved = Vec::new();

        if crossed > state.level {
            state.level = crossed;
            state.below_count = 0;

            if let Some(severity) = crossed.severity() {
                let alert = build_alert(score, severity, narratives);
                match severity {
                    Severity::Critical => warn!(
                        subject = %score.subject_id,
                        context = %score.context,
                        value = score.value,
                        from = %previous,
                        "Critical alert opened"
                    ),
                    _ => info!(
                        subject = %score.subject_id,
                        context = %score.context,
                        value = score.value,
                        %severity,
                        "Alert opened"
                    ),
                }
                state.open.push(alert.clone());
                opened = Some(alert);
            }
        } else if let Some(threshold) = thresholds.threshold(state.level) {
            if score.value < threshold - thresholds.margin {
                state.below_count += 1;
                if state.below_count >= thresholds.cooldown {
                    state.level = state.level.step_down();
                    state.below_count = 0;
                }
            } else {
                state.below_count = 0;
            }

            if state.level == Level::Normal {
                for mut alert in state.open.drain(..) {
                    alert.resolved_at = Some(score.timestamp);
                    resolved.push(alert);
                }
                if !resolved.is_empty() {
                    info!(subject = %score.subject_id, count = resolved.len(), "Alerts resolved");
                }
            }
        }

        EscalationOutcome {
            previous,
            level: state.level,
            trend,
            opened,
            resolved,
        }
    }
}

fn build_alert(score: &CompositeScore, severity: Severity, narratives: &[String]) -> Alert {
    let mut contributors: Vec<_> = score
        .breakdown
        .iter()
        .filter(|c| c.weighted() > 0.0 && !c.is_degraded())
        .collect();
    contributors.sort_by(|a, b| b.weighted().total_cmp(&a.weighted()));

    let mut reasons = Vec::new();
    for c in contributors.into_iter().take(TOP_CONTRIBUTORS) {
        let mut reason = format!("{} {:.2} (weight {:.2})", c.name, c.value, c.weight);
        if !c.notes.is_empty() {
            reason.push_str(": ");
            reason.push_str(&c.notes.join("; "));
        }
        reasons.push(reason);
    }
    for c in &score.breakdown {
        if let ContributionStatus::Degraded { reason } = &c.status {
            reasons.push(format!("{} degraded: {reason}", c.name));
        }
    }
    reasons.extend(narratives.iter().cloned());

    Alert {
        id: Uuid::new_v4(),
        subject_id: score.subject_id.clone(),
        context: score.context,
        severity,
        score: ScoreRef::from(score),
        recommended_action: recommended_action(score.context, severity).to_string(),
        reasons,
        created_at: score.timestamp,
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn score(version: u64, value: f64) -> CompositeScore {
        CompositeScore {
            subject_id: "S1".to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + version as i64, 0).unwrap(),
            context: Context::Elderly,
            value,
            confidence: 1.0,
            version,
            breakdown: Vec::new(),
        }
    }

    fn engine() -> EscalationEngine {
        EscalationEngine::new(HashMap::new()).unwrap()
    }

    #[test]
    fn test_jump_straight_to_critical() {
        let mut engine = engine();
        let outcome = engine.evaluate(&score(1, 0.82), &[]);
        assert_eq!(outcome.previous, Level::Normal);
        assert_eq!(outcome.level, Level::Critical);
        let alert = outcome.opened.unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.recommended_action.contains("caregiver"));
        assert_eq!(engine.open_alerts("S1").len(), 1);
    }

    #[test]
    fn test_hysteresis_holds_within_cooldown() {
        let mut engine = engine();
        engine.evaluate(&score(1, 0.62), &[]);
        assert_eq!(engine.level("S1"), Level::Warning);

        // Oscillates around the warning threshold, never cooldown times in a row
        let values = [0.5, 0.5, 0.62, 0.5, 0.5, 0.61, 0.5];
        for (i, v) in values.iter().enumerate() {
            let outcome = engine.evaluate(&score(i as u64 + 2, *v), &[]);
            assert_eq!(outcome.level, Level::Warning);
            assert!(outcome.opened.is_none());
        }
    }

    #[test]
    fn test_steps_down_one_level_and_resolves_at_normal() {
        let mut engine = engine();
        engine.evaluate(&score(1, 0.62), &[]);

        let mut version = 2;
        let mut levels = Vec::new();
        let mut resolved = Vec::new();
        for _ in 0..6 {
            let outcome = engine.evaluate(&score(version, 0.1), &[]);
            levels.push(outcome.level);
            resolved.extend(outcome.resolved);
            version += 1;
        }

        assert_eq!(
            levels,
            vec![
                Level::Warning,
                Level::Warning,
                Level::Watch,
                Level::Watch,
                Level::Watch,
                Level::Normal
            ]
        );
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_at, Some(score(7, 0.1).timestamp));
        assert!(engine.open_alerts("S1").is_empty());
    }

    #[test]
    fn test_no_duplicate_alert_without_level_change() {
        let mut engine = engine();
        let mut alerts = 0;
        for (i, v) in [0.5, 0.55, 0.5, 0.58, 0.46].iter().enumerate() {
            if engine.evaluate(&score(i as u64 + 1, *v), &[]).opened.is_some() {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_rising_low_scores_still_step_down() {
        let mut engine = engine();
        engine.evaluate(&score(1, 0.9), &[]);
        assert_eq!(engine.level("S1"), Level::Critical);

        // Climbing steadily, but every value is far below watch
        let mut last = None;
        for i in 0..20u64 {
            let outcome = engine.evaluate(&score(i + 2, 0.05 + 0.01 * i as f64), &[]);
            if i >= 2 {
                assert_eq!(outcome.trend, Trend::Rising);
            }
            last = Some(outcome);
        }
        assert_eq!(last.map(|o| o.level), Some(Level::Normal));
        assert!(engine.open_alerts("S1").is_empty());
    }

    #[test]
    fn test_trend_is_reported() {
        let mut engine = engine();
        assert_eq!(engine.evaluate(&score(1, 0.1), &[]).trend, Trend::Flat);
        engine.evaluate(&score(2, 0.2), &[]);
        assert_eq!(engine.evaluate(&score(3, 0.3), &[]).trend, Trend::Rising);
        engine.evaluate(&score(4, 0.2), &[]);
        assert_eq!(engine.evaluate(&score(5, 0.1), &[]).trend, Trend::Falling);
    }

    #[test]
    fn test_threshold_validation() {
        let mut thresholds = HashMap::new();
        thresholds.insert(
            Context::Workplace,
            Thresholds {
                watch: 0.6,
                warning: 0.5,
                critical: 0.8,
                margin: 0.05,
                cooldown: 3,
            },
        );
        let err = EscalationEngine::new(thresholds).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidThreshold {
                context: Context::Workplace,
                ..
            }
        ));

        let bad_margin = Thresholds {
            margin: 0.5,
            ..Thresholds::defaults_for(Context::Rehab)
        };
        assert!(bad_margin.validate(Context::Rehab).is_err());
        let no_cooldown = Thresholds {
            cooldown: 0,
            ..Thresholds::defaults_for(Context::Rehab)
        };
        assert!(no_cooldown.validate(Context::Rehab).is_err());
    }

    #[test]
    fn test_alert_reasons_include_contributors_and_narratives() {
        use crate::core::fusion::Contribution;

        let mut s = score(1, 0.9);
        s.breakdown = vec![
            Contribution {
                name: "deviation".to_string(),
                source: "baseline".to_string(),
                value: 1.0,
                weight: 0.5,
                confidence: 1.0,
                status: ContributionStatus::Ok,
                notes: vec!["gait_speed z=-5.00".to_string()],
            },
            Contribution {
                name: "activity_risk".to_string(),
                source: "unavailable".to_string(),
                value: 0.5,
                weight: 0.1,
                confidence: 0.0,
                status: ContributionStatus::Degraded {
                    reason: "sub-signal missing".to_string(),
                },
                notes: Vec::new(),
            },
        ];
        let alert = build_alert(&s, Severity::Critical, &["Walking decreased by 30%".to_string()]);
        assert!(alert.reasons[0].starts_with("deviation 1.00"));
        assert!(alert.reasons.iter().any(|r| r.contains("activity_risk degraded")));
        assert_eq!(alert.reasons.last().unwrap(), "Walking decreased by 30%");
        assert_eq!(alert.key(), s.key());
    }
}
