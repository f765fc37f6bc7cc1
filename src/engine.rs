//! Sharded scoring engine.
//!
//! Samples are routed to a fixed worker by a hash of the subject id, so one
//! subject is always handled by one thread and its samples are scored in
//! submission order. Each worker owns a [`Pipeline`] and hands its records
//! to the shared [`SinkWriter`].

use crate::config::{Config, ConfigError};
use crate::feed::MotionSample;
use crate::pipeline::Pipeline;
use crate::signals::ScorerRegistry;
use crate::sink::{DocumentStore, SinkRecord, SinkWriter, WriterConfig};
use crate::telemetry::{DropReason, SharedEngineStats, StatsSnapshot};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine is stopped")]
    Stopped,
    #[error("shard queue is full")]
    Busy,
}

/// Work delivered to a shard.
#[derive(Debug)]
enum ShardMessage {
    Sample(Box<MotionSample>),
    CloseSession(String),
    Shutdown,
}

type CancelSet = Arc<RwLock<HashSet<String>>>;

/// Running engine.
pub struct Engine {
    shards: Vec<Sender<ShardMessage>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    writer: Arc<SinkWriter>,
    cancelled: CancelSet,
    stopped: AtomicBool,
    /// Held shared while enqueueing, exclusively while stopping, so no
    /// accepted sample can land behind a shard's shutdown message.
    gate: RwLock<()>,
    store: Arc<dyn DocumentStore>,
    stats: SharedEngineStats,
}

impl Engine {
    /// Validate `config` and start the workers and the sink writer.
    pub fn start(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        scorers: ScorerRegistry,
        stats: SharedEngineStats,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let writer = Arc::new(SinkWriter::spawn(
            store.clone(),
            WriterConfig::from(&config.sink),
            stats.clone(),
        ));
        let cancelled: CancelSet = Arc::new(RwLock::new(HashSet::new()));

        let mut shards = Vec::with_capacity(config.engine.workers);
        let mut handles = Vec::with_capacity(config.engine.workers);
        for index in 0..config.engine.workers {
            let pipeline = Pipeline::new(config, scorers.clone(), Some(store.clone()), stats.clone())?;
            let (tx, rx) = bounded(config.engine.shard_capacity);
            let worker = ShardWorker {
                index,
                pipeline,
                rx,
                writer: writer.clone(),
                cancelled: cancelled.clone(),
                stats: stats.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("motion-risk-shard-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| ConfigError::Io(format!("Failed to spawn shard {index}: {e}")))?;
            shards.push(tx);
            handles.push(handle);
        }

        info!(workers = shards.len(), "Engine started");

        Ok(Self {
            shards,
            handles: Mutex::new(handles),
            writer,
            cancelled,
            stopped: AtomicBool::new(false),
            gate: RwLock::new(()),
            store,
            stats,
        })
    }

    /// Queue a sample, waiting while its shard is full.
    pub fn submit(&self, sample: MotionSample) -> Result<(), EngineError> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let shard = self.running_shard(&sample.subject_id)?;
        shard
            .send(ShardMessage::Sample(Box::new(sample)))
            .map_err(|_| EngineError::Stopped)?;
        self.stats.record_received();
        Ok(())
    }

    /// Queue a sample without waiting.
    pub fn try_submit(&self, sample: MotionSample) -> Result<(), EngineError> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let shard = self.running_shard(&sample.subject_id)?;
        match shard.try_send(ShardMessage::Sample(Box::new(sample))) {
            Ok(()) => {
                self.stats.record_received();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(EngineError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(EngineError::Stopped),
        }
    }

    /// Close a subject's session after its queued samples are scored.
    pub fn close_session(&self, subject_id: &str) -> Result<(), EngineError> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let shard = self.running_shard(subject_id)?;
        shard
            .send(ShardMessage::CloseSession(subject_id.trim().to_string()))
            .map_err(|_| EngineError::Stopped)
    }

    /// Skip a subject's remaining samples.
    ///
    /// Takes effect between samples; a sample already being scored
    /// completes.
    pub fn cancel(&self, subject_id: &str) {
        self.cancelled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject_id.trim().to_string());
        info!(subject = %subject_id, "Subject cancelled");
    }

    pub fn resume(&self, subject_id: &str) {
        self.cancelled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject_id.trim());
    }

    pub fn is_cancelled(&self, subject_id: &str) -> bool {
        is_cancelled(&self.cancelled, subject_id)
    }

    /// Wait for the sink queue to empty.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.writer.flush(timeout)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting samples, score what is queued, then drain the sink.
    ///
    /// Idempotent; later calls return the final counters.
    pub fn shutdown(&self) -> StatsSnapshot {
        {
            let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            if self.stopped.swap(true, Ordering::SeqCst) {
                return self.stats.snapshot();
            }
        }

        for shard in &self.shards {
            let _ = shard.send(ShardMessage::Shutdown);
        }
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Shard worker panicked");
            }
        }

        let abandoned = self.writer.shutdown();
        if abandoned > 0 {
            warn!(abandoned, "Sink records abandoned at shutdown");
        }
        if let Err(e) = self.stats.save() {
            warn!("Failed to save stats: {e}");
        }

        let snapshot = self.stats.snapshot();
        info!(
            processed = snapshot.samples_processed,
            alerts = snapshot.alerts_opened,
            "Engine stopped"
        );
        snapshot
    }

    fn running_shard(&self, subject_id: &str) -> Result<&Sender<ShardMessage>, EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        Ok(&self.shards[shard_for(subject_id, self.shards.len())])
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shard index for a subject.
pub fn shard_for(subject_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    subject_id.trim().hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

fn is_cancelled(set: &CancelSet, subject_id: &str) -> bool {
    set.read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(subject_id.trim())
}

struct ShardWorker {
    index: usize,
    pipeline: Pipeline,
    rx: Receiver<ShardMessage>,
    writer: Arc<SinkWriter>,
    cancelled: CancelSet,
    stats: SharedEngineStats,
}

impl ShardWorker {
    fn run(mut self) {
        debug!(shard = self.index, "Shard worker started");

        for message in self.rx.iter() {
            match message {
                ShardMessage::Sample(sample) => {
                    if is_cancelled(&self.cancelled, &sample.subject_id) {
                        self.stats.record_dropped(DropReason::Cancelled);
                        debug!(subject = %sample.subject_id, "Skipping cancelled subject");
                        continue;
                    }
                    match self.pipeline.process(&sample) {
                        Ok(outcome) => self.emit(outcome.into_records()),
                        Err(e) => {
                            self.stats.record_dropped(e.kind());
                            warn!(subject = %sample.subject_id, "Dropping sample: {e}");
                        }
                    }
                }
                ShardMessage::CloseSession(subject_id) => {
                    let records = self.pipeline.close_session(&subject_id).into_records();
                    self.emit(records);
                }
                ShardMessage::Shutdown => break,
            }
        }

        debug!(shard = self.index, "Shard worker stopped");
    }

    fn emit(&self, records: Vec<SinkRecord>) {
        for record in records {
            self.writer.enqueue(record);
        }
    }
}
