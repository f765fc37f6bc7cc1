//! End-to-end scoring scenarios through a single pipeline shard.

use chrono::{DateTime, Duration, TimeZone, Utc};
use motion_risk_engine::config::{Config, SubjectProfile};
use motion_risk_engine::core::{ContributionStatus, Context, Deviation, Level, SafetyEscalation, Severity};
use motion_risk_engine::feed::{Activity, MotionSample, Zone};
use motion_risk_engine::pipeline::Pipeline;
use motion_risk_engine::signals::{ScorerRegistry, FALL_RISK, PPE_COMPLIANCE};
use motion_risk_engine::sink::{self, DocumentStore, MemoryStore};
use motion_risk_engine::telemetry::{create_shared_stats, DropReason, SharedEngineStats};
use motion_risk_engine::CompositeScore;
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn pipeline_with(config: &Config, stats: SharedEngineStats) -> Pipeline {
    Pipeline::new(
        config,
        ScorerRegistry::with_defaults(StdDuration::from_millis(50)),
        None,
        stats,
    )
    .unwrap()
}

fn pipeline() -> Pipeline {
    pipeline_with(&Config::default(), create_shared_stats())
}

fn elderly(index: i64, gait_speed: f64, fall_prob: f64) -> MotionSample {
    MotionSample::new("S1", start() + Duration::minutes(index), 50.0)
        .with_hint("elderly")
        .with_feature("gait_speed", gait_speed)
        .with_signal("fall_prob", fall_prob)
        .with_activity(Activity::Walk)
}

/// Twenty samples alternating 1.1 / 1.3 m/s: mean 1.2, population std 0.1.
fn establish_baseline(p: &mut Pipeline) {
    for i in 0..20 {
        let gait = if i % 2 == 0 { 1.1 } else { 1.3 };
        let outcome = p.process(&elderly(i, gait, 0.1)).unwrap();
        assert_eq!(outcome.level, Level::Normal, "sample {i} escalated");
        assert!(outcome.opened.is_none());
    }
}

#[test]
fn test_elderly_gait_drop_opens_single_critical_alert() {
    let mut p = pipeline();
    establish_baseline(&mut p);

    let outcome = p.process(&elderly(20, 0.7, 0.8)).unwrap();

    match &outcome.deviation {
        Deviation::Measured { features } => {
            let gait = &features["gait_speed"];
            assert!((gait.z + 5.0).abs() < 1e-6, "z = {}", gait.z);
            assert!((gait.baseline_mean - 1.2).abs() < 1e-9);
            assert!((gait.baseline_std - 0.1).abs() < 1e-9);
        }
        other => panic!("expected measured deviation, got {other:?}"),
    }

    assert!((outcome.score.value - 0.82).abs() < 1e-9);
    assert_eq!(outcome.score.contribution(FALL_RISK).unwrap().value, 0.8);
    assert_eq!(outcome.previous_level, Level::Normal);
    assert_eq!(outcome.level, Level::Critical);

    let alert = outcome.opened.as_ref().expect("critical alert");
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.context, Context::Elderly);
    assert!(!alert.recommended_action.is_empty());
    assert_eq!(alert.key(), outcome.score.key());
    assert_eq!(p.open_alerts("S1").len(), 1);
}

#[test]
fn test_no_repeat_alert_while_level_holds() {
    let mut p = pipeline();
    establish_baseline(&mut p);
    assert!(p.process(&elderly(20, 0.7, 0.8)).unwrap().opened.is_some());

    // Still critical: no new alert
    let again = p.process(&elderly(21, 0.7, 0.9)).unwrap();
    assert_eq!(again.level, Level::Critical);
    assert!(again.opened.is_none());
    assert_eq!(p.open_alerts("S1").len(), 1);
}

#[test]
fn test_step_down_waits_for_cooldown() {
    let mut p = pipeline();
    establish_baseline(&mut p);
    p.process(&elderly(20, 0.7, 0.8)).unwrap();

    // Default cooldown is three evaluations
    for i in 21..23 {
        let outcome = p.process(&elderly(i, 1.2, 0.1)).unwrap();
        assert_eq!(outcome.level, Level::Critical, "stepped down early at {i}");
    }
    let outcome = p.process(&elderly(23, 1.2, 0.1)).unwrap();
    assert_eq!(outcome.level, Level::Warning);
    assert!(outcome.opened.is_none());
    assert!(outcome.resolved.is_empty());

    // Two more levels, three calm samples each
    let mut last = outcome;
    for i in 24..30 {
        last = p.process(&elderly(i, 1.2, 0.1)).unwrap();
    }
    assert_eq!(last.level, Level::Normal);
    assert_eq!(last.resolved.len(), 1);
    assert_eq!(last.resolved[0].resolved_at, Some(last.score.timestamp));
    assert!(p.open_alerts("S1").is_empty());
}

#[test]
fn test_workplace_missing_ppe_is_degraded() {
    let mut p = pipeline();
    let sample = MotionSample::new("W7", start(), 50.0)
        .with_hint("workplace")
        .with_feature("accel_magnitude", 9.8)
        .with_zone(Zone::Safe)
        .with_activity(Activity::Walk);

    let outcome = p.process(&sample).unwrap();
    let score = &outcome.score;
    assert!((0.0..=1.0).contains(&score.value));

    let ppe = score.contribution(PPE_COMPLIANCE).expect("ppe contribution kept");
    assert!(matches!(ppe.status, ContributionStatus::Degraded { .. }));
    assert_eq!(ppe.value, 0.5);
    assert_eq!(score.degraded().count(), 1);
}

#[test]
fn test_score_round_trips_through_store() {
    let mut p = pipeline();
    let store = MemoryStore::new();
    let mut scores = Vec::new();

    for i in 0..12 {
        let outcome = p.process(&elderly(i, 1.0 + 0.03 * i as f64, 0.13)).unwrap();
        scores.push(outcome.score.clone());
        for record in outcome.into_records() {
            record.write_to(&store).unwrap();
        }
    }

    for score in &scores {
        let loaded: CompositeScore = sink::load(&store, sink::SCORES, &score.key()).unwrap().unwrap();
        assert_eq!(&loaded, score);
    }
    let baseline = sink::load_baseline(&store, "S1").unwrap().unwrap();
    assert_eq!(baseline.version, 12);
    assert_eq!(store.list(sink::SCORES).unwrap().len(), 12);
}

#[test]
fn test_bad_samples_are_dropped_without_halting() {
    let stats = create_shared_stats();
    let mut config = Config::default();
    config.registry.insert(
        "R2".to_string(),
        SubjectProfile {
            role: Some(Context::Rehab),
        },
    );
    let mut p = pipeline_with(&config, stats.clone());

    p.process(&elderly(5, 1.2, 0.1)).unwrap();

    // Out of order for S1
    let err = p.process(&elderly(1, 1.2, 0.1)).unwrap_err();
    assert_eq!(err.kind(), DropReason::OutOfOrder);

    // Negative gait speed
    let err = p.process(&elderly(6, -1.0, 0.1)).unwrap_err();
    assert_eq!(err.kind(), DropReason::Malformed);

    // Nobody knows who this is
    let ghost = MotionSample::new("ghost", start(), 50.0).with_feature("acc_variance", 0.2);
    assert_eq!(p.process(&ghost).unwrap_err().kind(), DropReason::UnresolvedContext);

    // Other subjects and later samples still score
    let rehab = MotionSample::new("R2", start(), 50.0)
        .with_feature("acc_variance", 0.2)
        .with_signal("rsi", 40.0);
    let outcome = p.process(&rehab).unwrap();
    assert_eq!(outcome.score.context, Context::Rehab);
    assert!(p.process(&elderly(6, 1.2, 0.1)).is_ok());

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.samples_processed, 3);
    assert_eq!(snapshot.scores_emitted, 3);
}

#[test]
fn test_rolling_day_emits_summary() {
    let mut p = pipeline();
    p.process(&elderly(0, 1.2, 0.1)).unwrap();

    let next_day = elderly(24 * 60, 1.2, 0.5);
    let outcome = p.process(&next_day).unwrap();
    let summary = outcome.finished_day.expect("previous day summary");
    assert_eq!(summary.date, start().date_naive());
    assert_eq!(summary.counts.walking, 1);
    assert_eq!(summary.key(), "S1_2026-03-02");
}

#[test]
fn test_workplace_violations_accumulate() {
    let mut p = pipeline();
    let entry = |minute: i64| {
        MotionSample::new("W1", start() + Duration::minutes(minute), 50.0)
            .with_hint("workplace")
            .with_feature("ppe_helmet", 1.0)
            .with_zone(Zone::Restricted)
            .with_activity(Activity::Walk)
    };

    let first = p.process(&entry(0)).unwrap();
    assert_eq!(first.level, Level::Watch);
    let alert = first.opened.expect("watch alert");
    assert!(alert
        .reasons
        .iter()
        .any(|r| r == "Safety violations on record: 1 (warning), safety score 85."));

    let mut last = None;
    for minute in 1..5 {
        last = p.process(&entry(minute)).unwrap().safety;
    }
    let standing = last.expect("workplace standing");
    assert_eq!(standing.violations, 5);
    assert_eq!(standing.escalation, SafetyEscalation::Admin);
    assert_eq!(standing.safety_score, 25);
    assert_eq!(p.safety_standing("W1"), standing);

    // Elderly subjects carry no workplace record
    assert!(p.process(&elderly(0, 1.2, 0.1)).unwrap().safety.is_none());
}

#[test]
fn test_rehab_alert_reports_progress() {
    let mut p = pipeline();
    let sample = MotionSample::new("R1", start(), 50.0)
        .with_hint("rehab")
        .with_feature("acc_variance", 0.2)
        .with_signal("rsi", 10.0)
        .with_activity(Activity::Walk);

    let outcome = p.process(&sample).unwrap();
    assert_eq!(outcome.level, Level::Warning);
    let alert = outcome.opened.expect("rehab alert");
    assert!(alert.reasons.iter().any(|r| r == "Rehab progress today 100/100."));
    assert!(alert.reasons.iter().any(|r| r.contains("Needs Improvement")));
}
