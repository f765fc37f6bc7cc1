//! Engine counters.
//!
//! Lock-free counters shared by the shards and the sink writer. Values can
//! be persisted to disk so `motion-risk status` reports totals across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Why a sample was dropped before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Malformed,
    UnresolvedContext,
    OutOfOrder,
    Cancelled,
}

/// Engine statistics for the current session.
#[derive(Debug)]
pub struct EngineStats {
    samples_received: AtomicU64,
    samples_processed: AtomicU64,
    malformed_dropped: AtomicU64,
    unresolved_dropped: AtomicU64,
    out_of_order_dropped: AtomicU64,
    cancelled_skipped: AtomicU64,
    scores_emitted: AtomicU64,
    alerts_opened: AtomicU64,
    alerts_resolved: AtomicU64,
    scorer_failures: AtomicU64,
    scorer_overruns: AtomicU64,
    sink_writes: AtomicU64,
    sink_retries: AtomicU64,
    /// Records lost to queue overflow or rejection
    sink_dropped: AtomicU64,
    backpressure_events: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_processed: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            unresolved_dropped: AtomicU64::new(0),
            out_of_order_dropped: AtomicU64::new(0),
            cancelled_skipped: AtomicU64::new(0),
            scores_emitted: AtomicU64::new(0),
            alerts_opened: AtomicU64::new(0),
            alerts_resolved: AtomicU64::new(0),
            scorer_failures: AtomicU64::new(0),
            scorer_overruns: AtomicU64::new(0),
            sink_writes: AtomicU64::new(0),
            sink_retries: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that load and save totals at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            warn!("Could not load previous engine stats: {e}");
        }

        stats
    }

    pub fn record_received(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.samples_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.malformed_dropped,
            DropReason::UnresolvedContext => &self.unresolved_dropped,
            DropReason::OutOfOrder => &self.out_of_order_dropped,
            DropReason::Cancelled => &self.cancelled_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_score(&self) {
        self.scores_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_opened(&self) {
        self.alerts_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alerts_resolved(&self, count: u64) {
        self.alerts_resolved.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_scorer_failures(&self, failures: u64, overruns: u64) {
        self.scorer_failures.fetch_add(failures, Ordering::Relaxed);
        self.scorer_overruns.fetch_add(overruns, Ordering::Relaxed);
    }

    pub fn record_sink_write(&self) {
        self.sink_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_retry(&self) {
        self.sink_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_dropped(&self, count: u64) {
        self.sink_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_processed: self.samples_processed.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            unresolved_dropped: self.unresolved_dropped.load(Ordering::Relaxed),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            cancelled_skipped: self.cancelled_skipped.load(Ordering::Relaxed),
            scores_emitted: self.scores_emitted.load(Ordering::Relaxed),
            alerts_opened: self.alerts_opened.load(Ordering::Relaxed),
            alerts_resolved: self.alerts_resolved.load(Ordering::Relaxed),
            scorer_failures: self.scorer_failures.load(Ordering::Relaxed),
            scorer_overruns: self.scorer_overruns.load(Ordering::Relaxed),
            sink_writes: self.sink_writes.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Engine Statistics:\n\
             - Samples received: {}\n\
             - Samples processed: {}\n\
             - Dropped (malformed / unresolved / out-of-order): {} / {} / {}\n\
             - Skipped (cancelled subjects): {}\n\
             - Composite scores emitted: {}\n\
             - Alerts opened / resolved: {} / {}\n\
             - Degraded sub-signals: {} (over budget: {})\n\
             \n\
             Sink:\n\
             - Documents written: {}\n\
             - Retries: {}\n\
             - Records dropped: {}\n\
             - Backpressure events: {}\n\
             - Session duration: {} seconds",
            s.samples_received,
            s.samples_processed,
            s.malformed_dropped,
            s.unresolved_dropped,
            s.out_of_order_dropped,
            s.cancelled_skipped,
            s.scores_emitted,
            s.alerts_opened,
            s.alerts_resolved,
            s.scorer_failures,
            s.scorer_overruns,
            s.sink_writes,
            s.sink_retries,
            s.sink_dropped,
            s.backpressure_events,
            s.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                counters: self.snapshot(),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                self.store_all(&persisted.counters);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.store_all(&StatsSnapshot::zero(self.session_start));
    }

    fn store_all(&self, s: &StatsSnapshot) {
        self.samples_received.store(s.samples_received, Ordering::Relaxed);
        self.samples_processed.store(s.samples_processed, Ordering::Relaxed);
        self.malformed_dropped.store(s.malformed_dropped, Ordering::Relaxed);
        self.unresolved_dropped.store(s.unresolved_dropped, Ordering::Relaxed);
        self.out_of_order_dropped.store(s.out_of_order_dropped, Ordering::Relaxed);
        self.cancelled_skipped.store(s.cancelled_skipped, Ordering::Relaxed);
        self.scores_emitted.store(s.scores_emitted, Ordering::Relaxed);
        self.alerts_opened.store(s.alerts_opened, Ordering::Relaxed);
        self.alerts_resolved.store(s.alerts_resolved, Ordering::Relaxed);
        self.scorer_failures.store(s.scorer_failures, Ordering::Relaxed);
        self.scorer_overruns.store(s.scorer_overruns, Ordering::Relaxed);
        self.sink_writes.store(s.sink_writes, Ordering::Relaxed);
        self.sink_retries.store(s.sink_retries, Ordering::Relaxed);
        self.sink_dropped.store(s.sink_dropped, Ordering::Relaxed);
        self.backpressure_events.store(s.backpressure_events, Ordering::Relaxed);
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_received: u64,
    pub samples_processed: u64,
    pub malformed_dropped: u64,
    pub unresolved_dropped: u64,
    pub out_of_order_dropped: u64,
    pub cancelled_skipped: u64,
    pub scores_emitted: u64,
    pub alerts_opened: u64,
    pub alerts_resolved: u64,
    pub scorer_failures: u64,
    pub scorer_overruns: u64,
    pub sink_writes: u64,
    pub sink_retries: u64,
    pub sink_dropped: u64,
    pub backpressure_events: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl StatsSnapshot {
    fn zero(session_start: DateTime<Utc>) -> Self {
        Self {
            samples_received: 0,
            samples_processed: 0,
            malformed_dropped: 0,
            unresolved_dropped: 0,
            out_of_order_dropped: 0,
            cancelled_skipped: 0,
            scores_emitted: 0,
            alerts_opened: 0,
            alerts_resolved: 0,
            scorer_failures: 0,
            scorer_overruns: 0,
            sink_writes: 0,
            sink_retries: 0,
            sink_dropped: 0,
            backpressure_events: 0,
            session_start,
            session_duration_secs: 0,
        }
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    counters: StatsSnapshot,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared engine stats.
pub type SharedEngineStats = Arc<EngineStats>;

/// Create new shared engine stats.
pub fn create_shared_stats() -> SharedEngineStats {
    Arc::new(EngineStats::new())
}

/// Create new shared engine stats with persistence.
pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedEngineStats {
    Arc::new(EngineStats::with_persistence(path))
}
