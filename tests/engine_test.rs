//! Concurrency and sink behaviour of the sharded engine.

use chrono::{DateTime, Duration, TimeZone, Utc};
use motion_risk_engine::config::Config;
use motion_risk_engine::core::{Alert, Context, FeatureVector, Severity};
use motion_risk_engine::feed::{Activity, MotionSample};
use motion_risk_engine::signals::{ScorerError, ScorerRegistry, SignalScorer, SubSignal};
use motion_risk_engine::sink::{self, MemoryStore};
use motion_risk_engine::telemetry::create_shared_stats;
use motion_risk_engine::{CompositeScore, Engine, EngineError};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn sample(subject: &str, index: i64, gait_speed: f64, fall_prob: f64) -> MotionSample {
    MotionSample::new(subject, start() + Duration::minutes(index), 50.0)
        .with_hint("elderly")
        .with_feature("gait_speed", gait_speed)
        .with_signal("fall_prob", fall_prob)
        .with_activity(Activity::Walk)
}

fn registry() -> ScorerRegistry {
    ScorerRegistry::with_defaults(StdDuration::from_millis(50))
}

fn config(workers: usize) -> Config {
    let mut config = Config::default();
    config.engine.workers = workers;
    config.sink.retry_base_ms = 5;
    config.sink.retry_max_ms = 20;
    config
}

#[test]
fn test_scores_written_in_subject_order() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::start(&config(3), store.clone(), registry(), create_shared_stats()).unwrap();
    assert_eq!(engine.shard_count(), 3);

    let subjects = ["S1", "S2", "S3", "S4"];
    for i in 0..15 {
        for subject in subjects {
            engine.submit(sample(subject, i, 1.2, 0.1)).unwrap();
        }
    }
    let stats = engine.shutdown();
    assert_eq!(stats.samples_received, 60);
    assert_eq!(stats.scores_emitted, 60);

    let mut versions: HashMap<String, Vec<u64>> = HashMap::new();
    for (collection, key) in store.writes() {
        if collection != sink::SCORES {
            continue;
        }
        let score: CompositeScore = sink::load(store.as_ref(), sink::SCORES, &key).unwrap().unwrap();
        versions.entry(score.subject_id).or_default().push(score.version);
    }
    for subject in subjects {
        let expected: Vec<u64> = (1..=15).collect();
        assert_eq!(versions[subject], expected, "order broken for {subject}");
    }
}

#[test]
fn test_alert_survives_store_outage() {
    let store = Arc::new(MemoryStore::new());
    store.set_available(false);

    let mut config = config(2);
    config.sink.queue_capacity = 4;
    let engine = Engine::start(&config, store.clone(), registry(), create_shared_stats()).unwrap();

    for i in 0..20 {
        let gait = if i % 2 == 0 { 1.1 } else { 1.3 };
        engine.submit(sample("S1", i, gait, 0.1)).unwrap();
    }
    engine.submit(sample("S1", 20, 0.7, 0.8)).unwrap();

    let reviver = {
        let store = store.clone();
        thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(200));
            store.set_available(true);
        })
    };
    let stats = engine.shutdown();
    reviver.join().unwrap();

    let alerts: Vec<Alert> = sink::load_all(store.as_ref(), sink::ALERTS).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].context, Context::Elderly);

    // 21 scores + 21 baselines + 1 alert, each either written or counted
    assert_eq!(stats.sink_writes + stats.sink_dropped, 43);
    assert!(stats.sink_retries > 0);
}

#[test]
fn test_cancelled_subject_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::start(&config(2), store.clone(), registry(), create_shared_stats()).unwrap();

    engine.cancel("S2");
    assert!(engine.is_cancelled("S2"));
    for i in 0..5 {
        engine.submit(sample("S1", i, 1.2, 0.1)).unwrap();
        engine.submit(sample("S2", i, 1.2, 0.1)).unwrap();
    }
    engine.resume("S3");
    let stats = engine.shutdown();

    assert_eq!(stats.cancelled_skipped, 5);
    assert_eq!(stats.scores_emitted, 5);
    assert!(sink::load_baseline(store.as_ref(), "S2").unwrap().is_none());
    assert_eq!(sink::load_baseline(store.as_ref(), "S1").unwrap().unwrap().version, 5);
}

#[test]
fn test_close_session_persists_baseline() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::start(&config(1), store.clone(), registry(), create_shared_stats()).unwrap();

    for i in 0..3 {
        engine.submit(sample("S1", i, 1.2, 0.1)).unwrap();
    }
    engine.close_session("S1").unwrap();
    engine.shutdown();

    let writes = store.writes();
    let last = writes.last().unwrap();
    assert_eq!(last.0, sink::DAILY_SUMMARIES);
    assert_eq!(writes[writes.len() - 2], (sink::BASELINES.to_string(), "S1".to_string()));
}

struct SlowScorer;

impl SignalScorer for SlowScorer {
    fn name(&self) -> &str {
        "slow"
    }

    fn source(&self) -> &str {
        "test"
    }

    fn score(&self, _features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        thread::sleep(StdDuration::from_millis(200));
        Ok(SubSignal::new("slow", "test", 0.0))
    }
}

#[test]
fn test_full_shard_reports_busy() {
    let mut config = config(1);
    config.engine.shard_capacity = 1;
    let mut scorers = ScorerRegistry::new(StdDuration::from_secs(1));
    scorers.register(Context::Elderly, Arc::new(SlowScorer));

    let engine = Engine::start(&config, Arc::new(MemoryStore::new()), scorers, create_shared_stats()).unwrap();

    let results: Vec<_> = (0..5).map(|i| engine.try_submit(sample("S1", i, 1.2, 0.1))).collect();
    assert!(results[0].is_ok());
    assert!(results.iter().any(|r| r == &Err(EngineError::Busy)));

    engine.shutdown();
    assert_eq!(engine.submit(sample("S1", 9, 1.2, 0.1)), Err(EngineError::Stopped));
    assert_eq!(engine.try_submit(sample("S1", 9, 1.2, 0.1)), Err(EngineError::Stopped));
}

#[test]
fn test_every_accepted_sample_is_scored_across_shutdown() {
    let engine = Engine::start(&config(3), Arc::new(MemoryStore::new()), registry(), create_shared_stats()).unwrap();

    let accepted: usize = thread::scope(|scope| {
        let submitters: Vec<_> = ["S1", "S2", "S3", "S4"]
            .into_iter()
            .map(|subject| {
                let engine = &engine;
                scope.spawn(move || {
                    let mut accepted = 0;
                    for i in 0..500 {
                        match engine.submit(sample(subject, i, 1.2, 0.1)) {
                            Ok(()) => accepted += 1,
                            Err(e) => {
                                assert_eq!(e, EngineError::Stopped);
                                break;
                            }
                        }
                    }
                    accepted
                })
            })
            .collect();

        thread::sleep(StdDuration::from_millis(5));
        engine.shutdown();
        submitters.into_iter().map(|h| h.join().unwrap()).sum()
    });

    let stats = engine.stats();
    assert_eq!(stats.samples_received as usize, accepted);
    assert_eq!(stats.scores_emitted as usize, accepted);
}
