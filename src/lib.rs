//! Motion Risk Engine - context-aware risk scoring for motion streams.
//!
//! This library turns wearable motion samples into explainable composite
//! risk scores per subject, escalates sustained risk into alerts, and
//! persists results to a document store.
//!
//! # Guarantees
//!
//! - **Per-subject order**: a subject's samples are scored by one worker,
//!   in submission order
//! - **Own-baseline deviation**: every sample is compared with the
//!   subject's baseline as it stood before that sample
//! - **No dropped alerts**: the sink may shed scores under pressure, never
//!   alerts
//! - **Explainable scores**: each composite score carries its full
//!   contribution breakdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Motion Risk Engine                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐               │
//! │  │ Normalize │──▶│ Classify  │──▶│ Baseline  │               │
//! │  └───────────┘   └───────────┘   └───────────┘               │
//! │                                        │                      │
//! │                                        ▼                      │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐               │
//! │  │   Sink    │◀──│ Escalate  │◀──│   Fuse    │◀── scorers    │
//! │  └───────────┘   └───────────┘   └───────────┘               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use motion_risk_engine::{create_shared_stats, Config, Engine, FileStore, ScorerRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = Config::default();
//! let store = Arc::new(FileStore::new("/tmp/motion-risk"));
//! let scorers = ScorerRegistry::with_defaults(Duration::from_millis(50));
//! let engine = Engine::start(&config, store, scorers, create_shared_stats()).unwrap();
//!
//! // engine.submit(sample) for each MotionSample, then:
//! let stats = engine.shutdown();
//! println!("{} scores", stats.scores_emitted);
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod feed;
pub mod pipeline;
pub mod signals;
pub mod sink;
pub mod telemetry;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use core::{
    rank, Alert, BaselineSnapshot, CompositeScore, Context, DailySummary, Deviation, FeatureVector, Level, Severity,
};
pub use engine::{Engine, EngineError};
pub use feed::{Activity, FeedItem, JsonlFeed, MotionSample, Zone};
pub use pipeline::{Pipeline, PipelineError, ProcessOutcome};
pub use signals::{ScorerRegistry, SignalScorer, SubSignal};
pub use sink::{DocumentStore, FileStore, MemoryStore, SinkError, SinkRecord, SinkWriter};
pub use telemetry::{create_shared_stats, create_shared_stats_with_persistence, SharedEngineStats, StatsSnapshot};

#[cfg(feature = "remote")]
pub use sink::HttpStore;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
