//! Demonstration of the motion risk engine on synthetic subjects.
//!
//! This example shows how to:
//! 1. Build a scoring pipeline from the default configuration
//! 2. Establish a personal gait baseline for an elderly resident
//! 3. Watch a sudden gait drop escalate straight to a Critical alert
//! 4. Score a workplace subject whose PPE sensors are offline
//! 5. Persist everything to an in-memory store and rank the results
//!
//! Run with: cargo run --example scenario_demo

use chrono::{Duration, TimeZone, Utc};
use motion_risk_engine::{
    config::Config,
    core::rank,
    feed::{Activity, MotionSample, Zone},
    pipeline::Pipeline,
    signals::ScorerRegistry,
    sink::{self, MemoryStore},
    telemetry::create_shared_stats,
    CompositeScore,
};
use std::time::Duration as StdDuration;

fn main() {
    println!("Motion Risk Engine - Scenario Demo");
    println!("==================================");
    println!();

    let stats = create_shared_stats();
    let store = MemoryStore::new();
    let mut pipeline = match Pipeline::new(
        &Config::default(),
        ScorerRegistry::with_defaults(StdDuration::from_millis(50)),
        None,
        stats.clone(),
    ) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return;
        }
    };

    let start = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
    let mut latest: Vec<CompositeScore> = Vec::new();

    // Resident S1 walks at 1.1 / 1.3 m/s for twenty minutes, then slows to 0.7
    println!("Resident S1 (elderly):");
    for i in 0..21 {
        let (gait, fall_prob) = match i {
            20 => (0.7, 0.8),
            _ if i % 2 == 0 => (1.1, 0.1),
            _ => (1.3, 0.1),
        };
        let sample = MotionSample::new("S1", start + Duration::minutes(i), 50.0)
            .with_hint("elderly")
            .with_feature("gait_speed", gait)
            .with_signal("fall_prob", fall_prob)
            .with_activity(Activity::Walk);

        match pipeline.process(&sample) {
            Ok(outcome) => {
                let z = outcome
                    .deviation
                    .max_abs_z()
                    .map(|z| format!("{z:.2}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  #{:<2} gait {:.1} m/s  |z| {:>5}  score {:.3}  level {}",
                    i + 1,
                    gait,
                    z,
                    outcome.score.value,
                    outcome.level
                );
                if let Some(alert) = &outcome.opened {
                    println!();
                    println!("  ALERT {} ({})", alert.severity, alert.id);
                    println!("  Action: {}", alert.recommended_action);
                    for reason in &alert.reasons {
                        println!("    - {reason}");
                    }
                    println!();
                }
                if i == 20 {
                    latest.push(outcome.score.clone());
                }
                for record in outcome.into_records() {
                    if let Err(e) = record.write_to(&store) {
                        eprintln!("  write failed: {e}");
                    }
                }
            }
            Err(e) => println!("  #{:<2} dropped: {e}", i + 1),
        }
    }
    println!();

    // Worker W7 in a hazard zone with no PPE readings
    println!("Worker W7 (workplace, PPE sensors offline):");
    let sample = MotionSample::new("W7", start, 50.0)
        .with_hint("workplace")
        .with_feature("accel_magnitude", 9.9)
        .with_zone(Zone::Hazard)
        .with_activity(Activity::Stairs);
    match pipeline.process(&sample) {
        Ok(outcome) => {
            println!("  score {:.3}  level {}", outcome.score.value, outcome.level);
            for c in &outcome.score.breakdown {
                println!(
                    "    {:<16} value {:.2}  weight {:.2}  {:?}",
                    c.name, c.value, c.weight, c.status
                );
            }
            latest.push(outcome.score.clone());
            for record in outcome.into_records() {
                let _ = record.write_to(&store);
            }
        }
        Err(e) => println!("  dropped: {e}"),
    }
    println!();

    rank(&mut latest);
    println!("Ranking:");
    for (i, score) in latest.iter().enumerate() {
        println!("  {}. {} ({}) {:.3}", i + 1, score.subject_id, score.context, score.value);
    }
    println!();

    println!("Store contents:");
    for collection in [sink::SCORES, sink::ALERTS, sink::BASELINES, sink::DAILY_SUMMARIES] {
        println!("  {:<18} {}", collection, store.len(collection));
    }
    println!();
    println!("{}", stats.summary());
}
