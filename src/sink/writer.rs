//! Write-behind sink writer.
//!
//! Records are queued in FIFO order and written by a dedicated thread. The
//! queue is bounded: on overflow the oldest non-alert record is dropped.
//! Alerts are never dropped and may push the queue past its capacity. When
//! the store is unavailable the head record is retried with exponential
//! backoff; records behind it wait, so per-subject order is preserved.

use super::{DocumentStore, SinkError, SinkRecord};
use crate::config::SinkConfig;
use crate::telemetry::SharedEngineStats;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Writer settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub capacity: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long shutdown keeps draining
    pub drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from(&SinkConfig::default())
    }
}

impl From<&SinkConfig> for WriterConfig {
    fn from(config: &SinkConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms.max(1)),
            retry_max: Duration::from_millis(config.retry_max_ms.max(config.retry_base_ms.max(1))),
            drain_timeout: config.drain_timeout,
        }
    }
}

impl WriterConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.retry_max)
    }
}

#[derive(Debug, Default)]
struct Queue {
    records: VecDeque<SinkRecord>,
    /// A record currently held by the writer thread
    in_flight: bool,
    closing: bool,
    deadline: Option<Instant>,
}

impl Queue {
    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when records arrive or shutdown starts
    ready: Condvar,
    /// Signalled when the queue becomes idle
    idle: Condvar,
    /// Interrupts a backoff wait at shutdown
    retry: Condvar,
    stats: SharedEngineStats,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the background writer.
pub struct SinkWriter {
    shared: Arc<Shared>,
    config: WriterConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SinkWriter {
    /// Start the writer thread.
    pub fn spawn(store: Arc<dyn DocumentStore>, config: WriterConfig, stats: SharedEngineStats) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            idle: Condvar::new(),
            retry: Condvar::new(),
            stats,
        });

        let worker_shared = Arc::clone(&shared);
        let worker_config = config.clone();
        let handle = thread::Builder::new()
            .name("sink-writer".to_string())
            .spawn(move || run(worker_shared, store, worker_config))
            .map_err(|e| error!("Failed to start sink writer: {e}"))
            .ok();

        Self {
            shared,
            config,
            handle: Mutex::new(handle),
        }
    }

    /// Queue a record. Returns `false` if the record itself was dropped.
    pub fn enqueue(&self, record: SinkRecord) -> bool {
        let stats = &self.shared.stats;
        let mut queue = self.shared.lock();

        if queue.closing {
            warn!(collection = record.collection(), "Sink writer closed, dropping record");
            stats.record_sink_dropped(1);
            return false;
        }

        if queue.records.len() >= self.config.capacity {
            stats.record_backpressure();
            match queue.records.iter().position(|r| !r.is_alert()) {
                Some(oldest) => {
                    if let Some(dropped) = queue.records.remove(oldest) {
                        debug!(collection = dropped.collection(), key = %dropped.key(), "Queue full, dropped oldest record");
                    }
                    stats.record_sink_dropped(1);
                }
                None if record.is_alert() => {
                    warn!(pending = queue.records.len(), "Queue full of alerts, exceeding capacity");
                }
                None => {
                    stats.record_sink_dropped(1);
                    return false;
                }
            }
        }

        queue.records.push_back(record);
        self.shared.ready.notify_one();
        true
    }

    /// Records waiting to be written, including one being retried.
    pub fn pending(&self) -> usize {
        let queue = self.shared.lock();
        queue.records.len() + usize::from(queue.in_flight)
    }

    /// Block until the queue is empty or `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.lock();
        while !queue.records.is_empty() || queue.in_flight {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            queue = self
                .shared
                .idle
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Drain for up to the configured timeout and stop the thread.
    ///
    /// Returns the number of records abandoned.
    pub fn shutdown(&self) -> usize {
        {
            let mut queue = self.shared.lock();
            if !queue.closing {
                queue.closing = true;
                queue.deadline = Some(Instant::now() + self.config.drain_timeout);
            }
            self.shared.ready.notify_all();
            self.shared.retry.notify_all();
        }

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Sink writer thread panicked");
            }
        }

        let mut queue = self.shared.lock();
        let abandoned = queue.records.len();
        if abandoned > 0 {
            let alerts = queue.records.iter().filter(|r| r.is_alert()).count();
            error!(abandoned, alerts, "Sink drain timed out");
            self.shared.stats.record_sink_dropped(abandoned as u64);
            queue.records.clear();
        }
        abandoned
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>, store: Arc<dyn DocumentStore>, config: WriterConfig) {
    loop {
        let record = {
            let mut queue = shared.lock();
            loop {
                if queue.closing && (queue.records.is_empty() || queue.past_deadline()) {
                    shared.idle.notify_all();
                    return;
                }
                if let Some(record) = queue.records.pop_front() {
                    queue.in_flight = true;
                    break record;
                }
                shared.idle.notify_all();
                queue = shared.ready.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let done = write_with_retry(&shared, store.as_ref(), &config, &record);

        let mut queue = shared.lock();
        queue.in_flight = false;
        if !done {
            // Deadline hit mid-retry; put it back so shutdown counts it
            queue.records.push_front(record);
        }
        if queue.records.is_empty() {
            shared.idle.notify_all();
        }
    }
}

/// Returns `false` only when shutdown's deadline expired before success.
fn write_with_retry(shared: &Shared, store: &dyn DocumentStore, config: &WriterConfig, record: &SinkRecord) -> bool {
    let mut attempt = 0u32;
    loop {
        match record.write_to(store) {
            Ok(()) => {
                shared.stats.record_sink_write();
                return true;
            }
            Err(SinkError::Unavailable(reason)) => {
                let delay = config.backoff(attempt);
                shared.stats.record_sink_retry();
                warn!(
                    collection = record.collection(),
                    key = %record.key(),
                    attempt,
                    "Sink unavailable ({reason}), retrying in {delay:?}"
                );
                attempt = attempt.saturating_add(1);

                let queue = shared.lock();
                if queue.closing && queue.past_deadline() {
                    return false;
                }
                let (queue, _) = shared
                    .retry
                    .wait_timeout(queue, delay)
                    .unwrap_or_else(PoisonError::into_inner);
                if queue.closing && queue.past_deadline() {
                    return false;
                }
            }
            Err(e) => {
                error!(collection = record.collection(), key = %record.key(), "Dropping record: {e}");
                shared.stats.record_sink_dropped(1);
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::biography::{DailySummary, DayCounts};
    use crate::core::classify::Context;
    use crate::core::escalation::{Alert, ScoreRef, Severity};
    use crate::sink::{MemoryStore, ALERTS, DAILY_SUMMARIES};
    use crate::telemetry::create_shared_stats;
    use chrono::{NaiveDate, Utc};

    fn summary(n: u32) -> SinkRecord {
        SinkRecord::DailySummary(Box::new(DailySummary::new(
            format!("S{n}"),
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            DayCounts::default(),
        )))
    }

    fn alert(n: u32) -> SinkRecord {
        SinkRecord::Alert(Box::new(Alert {
            id: uuid::Uuid::new_v4(),
            subject_id: "S1".to_string(),
            context: Context::Elderly,
            severity: Severity::Critical,
            score: ScoreRef {
                key: format!("S1_{n}_{n}"),
                timestamp: Utc::now(),
                version: n as u64,
                value: 0.9,
            },
            recommended_action: String::new(),
            reasons: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
        }))
    }

    fn config(capacity: usize) -> WriterConfig {
        WriterConfig {
            capacity,
            retry_base: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config(1);
        assert_eq!(config.backoff(0), Duration::from_millis(5));
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(40), Duration::from_millis(20));
    }

    #[test]
    fn test_writes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let stats = create_shared_stats();
        let writer = SinkWriter::spawn(store.clone(), config(16), stats.clone());

        for n in 0..5 {
            assert!(writer.enqueue(summary(n)));
        }
        assert!(writer.flush(Duration::from_secs(5)));

        let keys: Vec<String> = store.writes().into_iter().map(|(_, k)| k).collect();
        let expected: Vec<String> = (0..5).map(|n| format!("S{n}_2024-01-10")).collect();
        assert_eq!(keys, expected);
        assert_eq!(stats.snapshot().sink_writes, 5);
        assert_eq!(writer.shutdown(), 0);
    }

    #[test]
    fn test_retries_until_store_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let stats = create_shared_stats();
        let writer = SinkWriter::spawn(store.clone(), config(16), stats.clone());

        writer.enqueue(summary(1));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(store.len(DAILY_SUMMARIES), 0);
        assert_eq!(writer.pending(), 1);

        store.set_available(true);
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(store.len(DAILY_SUMMARIES), 1);
        assert!(stats.snapshot().sink_retries >= 1);
    }

    #[test]
    fn test_overflow_drops_oldest_non_alert_and_keeps_alerts() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let stats = create_shared_stats();
        let writer = SinkWriter::spawn(store.clone(), config(2), stats.clone());

        // Wait until the first record is held by the retrying writer
        writer.enqueue(summary(0));
        let started = Instant::now();
        while stats.snapshot().sink_retries == 0 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(writer.enqueue(summary(1)));
        assert!(writer.enqueue(summary(2)));
        assert!(writer.enqueue(summary(3)));
        assert!(writer.enqueue(alert(1)));
        assert!(writer.enqueue(alert(2)));
        assert!(writer.enqueue(alert(3)));
        assert!(!writer.enqueue(summary(4)));

        let s = stats.snapshot();
        assert_eq!(s.sink_dropped, 4);
        assert_eq!(s.backpressure_events, 5);

        store.set_available(true);
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(store.len(ALERTS), 3);
        assert_eq!(store.len(DAILY_SUMMARIES), 1);
        let first = &store.writes()[0];
        assert_eq!(first.1, "S0_2024-01-10");
    }

    #[test]
    fn test_shutdown_abandons_after_deadline() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let stats = create_shared_stats();
        let writer = SinkWriter::spawn(store.clone(), config(16), stats.clone());

        for n in 0..3 {
            writer.enqueue(summary(n));
        }
        assert_eq!(writer.shutdown(), 3);
        assert_eq!(stats.snapshot().sink_dropped, 3);
        assert!(!writer.enqueue(summary(9)));
    }
}
