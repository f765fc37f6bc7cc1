//! Motion biography.
//!
//! Keeps per-subject activity counts per local calendar day and derives
//! daily summaries and week-over-week mobility trends from them. Workplace
//! subjects also accumulate a running tally of zone and posture violations.

use crate::core::normalize::FeatureVector;
use crate::feed::Activity;
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Days of counts kept per subject (two comparison weeks).
pub const RETENTION_DAYS: i64 = 14;

const NEAR_FALL_LOW: f64 = 0.45;
const NEAR_FALL_HIGH: f64 = 0.7;

const STABLE_NARRATIVE: &str = "Mobility stable. No immediate intervention required.";

/// Safety score lost per recorded violation.
const VIOLATION_PENALTY: u32 = 15;

/// Activity counts for one subject-day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCounts {
    pub walking: u32,
    pub transitions: u32,
    pub inactivity: u32,
    pub exercise: u32,
    pub stairs: u32,
    pub near_falls: u32,
    pub falls: u32,
    pub total: u32,
    /// Workplace zone and posture violations
    #[serde(default)]
    pub violations: u32,
}

impl DayCounts {
    fn record(&mut self, activity: Option<Activity>, fall_prob: Option<f64>, fall_detected: bool) {
        match activity {
            Some(Activity::Walk) => self.walking += 1,
            Some(Activity::Transitions) => self.transitions += 1,
            Some(Activity::Static) => self.inactivity += 1,
            Some(Activity::Exercise) => self.exercise += 1,
            Some(Activity::Stairs) => self.stairs += 1,
            None => {}
        }
        if fall_prob.is_some_and(|p| (NEAR_FALL_LOW..NEAR_FALL_HIGH).contains(&p)) {
            self.near_falls += 1;
        }
        if fall_detected {
            self.falls += 1;
        }
        self.total += 1;
    }

    fn add(&mut self, other: &DayCounts) {
        self.walking += other.walking;
        self.transitions += other.transitions;
        self.inactivity += other.inactivity;
        self.exercise += other.exercise;
        self.stairs += other.stairs;
        self.near_falls += other.near_falls;
        self.falls += other.falls;
        self.total += other.total;
        self.violations += other.violations;
    }

    /// Fall-risk score 0-100 from event ratios.
    pub fn fall_risk_score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let total = self.total as f64;
        let risk = 0.4 * self.falls as f64 / total
            + 0.3 * self.near_falls as f64 / total
            + 0.2 * self.transitions as f64 / total
            + 0.1 * self.inactivity as f64 / total;
        round2((risk * 100.0).min(100.0))
    }

    /// Share of exercise and transitions, 0-100.
    pub fn safety_risk_score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let risky = (self.exercise + self.transitions) as f64 / self.total as f64;
        round2((risky * 100.0).min(100.0))
    }

    /// Rehabilitation progress 0-100: walking raises it, transitions and
    /// falls lower it.
    pub fn rehab_progress_score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let total = self.total as f64;
        let progress = 0.5 * self.walking as f64 / total
            + 0.3 * (1.0 - self.transitions as f64 / total)
            + 0.2 * (1.0 - self.falls as f64 / total);
        round2(progress * 100.0)
    }
}

/// Summary of one subject-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub subject_id: String,
    pub date: NaiveDate,
    pub counts: DayCounts,
    pub fall_risk_score: f64,
    #[serde(default)]
    pub safety_risk_score: f64,
    #[serde(default)]
    pub rehab_progress_score: f64,
}

impl DailySummary {
    pub fn new(subject_id: impl Into<String>, date: NaiveDate, counts: DayCounts) -> Self {
        Self {
            subject_id: subject_id.into(),
            date,
            fall_risk_score: counts.fall_risk_score(),
            safety_risk_score: counts.safety_risk_score(),
            rehab_progress_score: counts.rehab_progress_score(),
            counts,
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.subject_id, self.date)
    }
}

/// Comparison of the last seven days with the seven before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyTrend {
    pub subject_id: String,
    pub end_date: NaiveDate,
    /// Percentage changes, 0 when the earlier week has no data
    pub walk_change: f64,
    pub near_fall_change: f64,
    pub transition_change: f64,
    pub inactivity_change: f64,
    /// Drift indicators raised: walking down, transitions up, inactivity up
    pub drift_score: u8,
    pub drift_level: DriftLevel,
    pub narratives: Vec<String>,
}

impl WeeklyTrend {
    /// Narratives that call for attention.
    pub fn concerns(&self) -> impl Iterator<Item = &String> {
        self.narratives.iter().filter(|n| n.as_str() != STABLE_NARRATIVE)
    }
}

/// How far a subject's mobility has drifted from the previous week.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DriftLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl DriftLevel {
    fn from_score(score: u8) -> Self {
        match score {
            0 => DriftLevel::Low,
            1 => DriftLevel::Medium,
            _ => DriftLevel::High,
        }
    }
}

impl std::fmt::Display for DriftLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriftLevel::Low => "low",
            DriftLevel::Medium => "medium",
            DriftLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// Workplace escalation tier from the running violation count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyEscalation {
    #[default]
    NoAction,
    Warning,
    Supervisor,
    Admin,
}

impl SafetyEscalation {
    pub fn for_count(violations: u32) -> Self {
        match violations {
            0 => SafetyEscalation::NoAction,
            1..=2 => SafetyEscalation::Warning,
            3..=4 => SafetyEscalation::Supervisor,
            _ => SafetyEscalation::Admin,
        }
    }
}

impl std::fmt::Display for SafetyEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyEscalation::NoAction => "no action",
            SafetyEscalation::Warning => "warning",
            SafetyEscalation::Supervisor => "supervisor alert",
            SafetyEscalation::Admin => "admin escalation",
        };
        f.write_str(s)
    }
}

/// Running workplace safety record for one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyStanding {
    pub violations: u32,
    pub escalation: SafetyEscalation,
    /// 100 minus 15 per violation, floored at 0
    pub safety_score: u32,
}

impl SafetyStanding {
    pub fn from_count(violations: u32) -> Self {
        Self {
            violations,
            escalation: SafetyEscalation::for_count(violations),
            safety_score: 100u32.saturating_sub(violations.saturating_mul(VIOLATION_PENALTY)),
        }
    }

    /// Alert reason line, or `None` while the record is clean.
    pub fn narrative(&self) -> Option<String> {
        if self.violations == 0 {
            return None;
        }
        Some(format!(
            "Safety violations on record: {} ({}), safety score {}.",
            self.violations, self.escalation, self.safety_score
        ))
    }
}

#[derive(Debug, Default)]
struct SubjectDays {
    days: BTreeMap<NaiveDate, DayCounts>,
    current: Option<NaiveDate>,
    /// Never trimmed by retention
    violations: u32,
}

/// Per-subject daily activity ledger.
#[derive(Debug)]
pub struct ActivityLedger {
    tz: Tz,
    subjects: HashMap<String, SubjectDays>,
}

impl ActivityLedger {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            subjects: HashMap::new(),
        }
    }

    /// Count one sample. Returns the summary of the previous day when the
    /// subject's local day has rolled over.
    pub fn record(&mut self, features: &FeatureVector) -> Option<DailySummary> {
        let fall_prob = features.signal("fall_prob");
        if features.activity.is_none() && fall_prob.is_none() && !features.fall_detected {
            return None;
        }

        let day = features.timestamp.with_timezone(&self.tz).date_naive();
        let entry = self.subjects.entry(features.subject_id.clone()).or_default();

        let finished = match entry.current {
            Some(previous) if day > previous => entry
                .days
                .get(&previous)
                .map(|counts| DailySummary::new(features.subject_id.clone(), previous, *counts)),
            _ => None,
        };
        if entry.current.map_or(true, |c| day > c) {
            entry.current = Some(day);
        }

        entry
            .days
            .entry(day)
            .or_default()
            .record(features.activity, fall_prob, features.fall_detected);

        let oldest = day - Duration::days(RETENTION_DAYS - 1);
        entry.days.retain(|d, _| *d >= oldest);

        finished
    }

    pub fn daily_summary(&self, subject_id: &str, date: NaiveDate) -> Option<DailySummary> {
        let counts = self.subjects.get(subject_id)?.days.get(&date)?;
        Some(DailySummary::new(subject_id, date, *counts))
    }

    /// Add workplace violations found in one sample to the subject's day
    /// and running tally.
    pub fn record_violations(&mut self, features: &FeatureVector, count: u32) -> SafetyStanding {
        let entry = self.subjects.entry(features.subject_id.clone()).or_default();
        if count > 0 {
            let day = features.timestamp.with_timezone(&self.tz).date_naive();
            entry.days.entry(day).or_default().violations += count;
            entry.violations += count;
        }
        SafetyStanding::from_count(entry.violations)
    }

    pub fn safety_standing(&self, subject_id: &str) -> SafetyStanding {
        SafetyStanding::from_count(self.subjects.get(subject_id).map_or(0, |s| s.violations))
    }

    pub fn weekly_trend(&self, subject_id: &str, end_date: NaiveDate) -> WeeklyTrend {
        let mut this_week = DayCounts::default();
        let mut last_week = DayCounts::default();

        if let Some(subject) = self.subjects.get(subject_id) {
            for i in 0..7 {
                if let Some(c) = subject.days.get(&(end_date - Duration::days(i))) {
                    this_week.add(c);
                }
                if let Some(c) = subject.days.get(&(end_date - Duration::days(i + 7))) {
                    last_week.add(c);
                }
            }
        }

        let walk_change = pct_change(this_week.walking, last_week.walking);
        let near_fall_change = pct_change(this_week.near_falls, last_week.near_falls);
        let transition_change = pct_change(this_week.transitions, last_week.transitions);
        let inactivity_change = pct_change(this_week.inactivity, last_week.inactivity);

        let mut narratives = Vec::new();
        let mut drift_score = 0;
        if walk_change <= -20.0 {
            drift_score += 1;
            narratives.push(format!("Walking reduced by {:.0}% compared with the previous week.", -walk_change));
        }
        if near_fall_change >= 20.0 {
            narratives.push(format!("Near falls up {near_fall_change:.0}% over recent days."));
        }
        if transition_change >= 20.0 {
            drift_score += 1;
            narratives.push(format!("Unstable transitions up {transition_change:.0}%."));
        }
        if inactivity_change >= 25.0 {
            drift_score += 1;
            narratives.push(format!(
                "Inactivity up {inactivity_change:.0}%. Mobility may be declining."
            ));
        }
        if narratives.is_empty() {
            narratives.push(STABLE_NARRATIVE.to_string());
        }

        WeeklyTrend {
            subject_id: subject_id.to_string(),
            end_date,
            walk_change,
            near_fall_change,
            transition_change,
            inactivity_change,
            drift_score,
            drift_level: DriftLevel::from_score(drift_score),
            narratives,
        }
    }

    /// Most recent local day seen for a subject.
    pub fn current_day(&self, subject_id: &str) -> Option<NaiveDate> {
        self.subjects.get(subject_id)?.current
    }

    pub fn close_session(&mut self, subject_id: &str) -> Option<DailySummary> {
        let day = self.current_day(subject_id)?;
        self.daily_summary(subject_id, day)
    }
}

fn pct_change(current: u32, previous: u32) -> f64 {
    if previous == 0 {
        return 0.0;
    }
    round2((current as f64 - previous as f64) / previous as f64 * 100.0)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
