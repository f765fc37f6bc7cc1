//! Operational counters for the motion risk engine.

pub mod stats;

// Re-export commonly used types
pub use stats::{
    create_shared_stats, create_shared_stats_with_persistence, DropReason, EngineStats, SharedEngineStats,
    StatsSnapshot,
};
