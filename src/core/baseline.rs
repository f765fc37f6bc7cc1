//! Per-subject rolling baselines.
//!
//! The sliding time window is split into a fixed number of aligned buckets.
//! Each bucket keeps Welford accumulators per feature; buckets are merged
//! with Chan's parallel formula when a snapshot or deviation is needed. Memory
//! per subject is bounded by the bucket count, never by the number of
//! samples, and no update rescans history.

use crate::config::duration_serde;
use crate::core::classify::Context;
use crate::core::normalize::FeatureVector;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

/// Baseline tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Length of the sliding window
    #[serde(with = "duration_serde")]
    pub window: std::time::Duration,
    /// Number of buckets the window is divided into
    pub bucket_count: u32,
    /// Samples required before deviations are reported numerically
    pub min_samples: u64,
    /// Absolute clamp applied to z-scores
    pub max_z: f64,
    /// Floor applied to the baseline standard deviation
    pub min_std: f64,
    /// Archived snapshots kept per subject
    pub history_limit: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window: std::time::Duration::from_secs(7 * 24 * 3600),
            bucket_count: 28,
            min_samples: 10,
            max_z: 10.0,
            min_std: 1e-3,
            history_limit: 8,
        }
    }
}

/// Welford accumulator for one feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Fold another accumulator into this one (Chan et al.).
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let a = self.count as f64;
        let b = other.count as f64;
        let n = a + b;
        let delta = other.mean - self.mean;
        self.mean += delta * b / n;
        self.m2 += other.m2 + delta * delta * a * b / n;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    fn from_stats(stats: &FeatureStats) -> Self {
        Self {
            count: stats.count,
            mean: stats.mean,
            m2: stats.variance * stats.count as f64,
            min: stats.min,
            max: stats.max,
        }
    }
}

/// Rolling statistics for one feature as exposed in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

impl FeatureStats {
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Estimate a percentile from the normal approximation, bounded by the
    /// observed range.
    pub fn percentile(&self, p: f64) -> f64 {
        if p <= 0.0 {
            return self.min;
        }
        if p >= 1.0 {
            return self.max;
        }
        match Normal::new(self.mean, self.std_dev()) {
            Ok(normal) => normal.inverse_cdf(p).clamp(self.min, self.max),
            Err(_) => self.mean,
        }
    }
}

impl From<&RunningStats> for FeatureStats {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            mean: stats.mean,
            variance: stats.variance(),
            min: stats.min,
            max: stats.max,
        }
    }
}

/// Point-in-time view of a subject's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub subject_id: String,
    pub context: Option<Context>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Samples inside the live window
    pub sample_count: u64,
    pub features: BTreeMap<String, FeatureStats>,
    /// Incremented on every accepted update
    pub version: u64,
    /// Fewer than the minimum number of samples in the window
    pub insufficient_data: bool,
}

/// Subject record owned by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
    pub context: Option<Context>,
    pub archived: bool,
    /// Archived snapshots, oldest first
    pub history: Vec<BaselineSnapshot>,
}

/// Deviation of one feature from its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeviation {
    pub z: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    /// Two-sided probability of a deviation at least this large
    pub tail_probability: f64,
}

/// Result of a deviation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deviation {
    /// Too little history for a numeric verdict
    Provisional { samples: u64, required: u64 },
    Measured { features: BTreeMap<String, FeatureDeviation> },
}

impl Deviation {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Deviation::Provisional { .. })
    }

    /// Largest absolute z-score across features.
    pub fn max_abs_z(&self) -> Option<f64> {
        match self {
            Deviation::Provisional { .. } => None,
            Deviation::Measured { features } => features.values().map(|d| d.z.abs()).reduce(f64::max),
        }
    }

    /// Feature with the largest absolute z-score.
    pub fn worst_feature(&self) -> Option<(&str, &FeatureDeviation)> {
        match self {
            Deviation::Provisional { .. } => None,
            Deviation::Measured { features } => features
                .iter()
                .max_by(|a, b| a.1.z.abs().total_cmp(&b.1.z.abs()))
                .map(|(name, d)| (name.as_str(), d)),
        }
    }
}

/// Baseline errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BaselineError {
    #[error("out-of-order sample for {subject_id}: {timestamp} is earlier than {last}")]
    OutOfOrder {
        subject_id: String,
        last: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Bucket {
    start: DateTime<Utc>,
    samples: u64,
    stats: BTreeMap<String, RunningStats>,
}

#[derive(Debug, Clone)]
struct SubjectBaseline {
    context: Option<Context>,
    buckets: VecDeque<Bucket>,
    last_timestamp: Option<DateTime<Utc>>,
    version: u64,
    archived: bool,
    history: Vec<BaselineSnapshot>,
}

impl SubjectBaseline {
    fn new() -> Self {
        Self {
            context: None,
            buckets: VecDeque::new(),
            last_timestamp: None,
            version: 0,
            archived: false,
            history: Vec::new(),
        }
    }
}

/// Owner of all per-subject baseline state.
#[derive(Debug)]
pub struct BaselineTracker {
    config: BaselineConfig,
    window: Duration,
    bucket_width: Duration,
    subjects: HashMap<String, SubjectBaseline>,
}

impl BaselineTracker {
    pub fn new(config: BaselineConfig) -> Self {
        let window_ms = (config.window.as_millis() as i64).max(1);
        let width_ms = (window_ms / config.bucket_count.max(1) as i64).max(1);
        Self {
            window: Duration::milliseconds(window_ms),
            bucket_width: Duration::milliseconds(width_ms),
            config,
            subjects: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    pub fn contains(&self, subject_id: &str) -> bool {
        self.subjects.contains_key(subject_id)
    }

    /// Reject timestamps earlier than the subject's last accepted sample.
    pub fn check_order(&self, subject_id: &str, timestamp: DateTime<Utc>) -> Result<(), BaselineError> {
        match self.subjects.get(subject_id).and_then(|s| s.last_timestamp) {
            Some(last) if timestamp < last => Err(BaselineError::OutOfOrder {
                subject_id: subject_id.to_string(),
                last,
                timestamp,
            }),
            _ => Ok(()),
        }
    }

    /// Record the active context for a subject.
    pub fn set_context(&mut self, subject_id: &str, context: Context) {
        self.subjects
            .entry(subject_id.to_string())
            .or_insert_with(SubjectBaseline::new)
            .context = Some(context);
    }

    /// Fold a sample into the subject's baseline.
    pub fn update(
        &mut self,
        subject_id: &str,
        features: &FeatureVector,
        timestamp: DateTime<Utc>,
    ) -> Result<BaselineSnapshot, BaselineError> {
        self.check_order(subject_id, timestamp)?;

        let bucket_start = self.bucket_start(timestamp);
        let window_start = timestamp - self.window;
        let width = self.bucket_width;

        let subject = self
            .subjects
            .entry(subject_id.to_string())
            .or_insert_with(SubjectBaseline::new);

        while let Some(front) = subject.buckets.front() {
            if front.start + width <= window_start {
                subject.buckets.pop_front();
            } else {
                break;
            }
        }

        let needs_bucket = subject
            .buckets
            .back()
            .map(|b| b.start < bucket_start)
            .unwrap_or(true);
        if needs_bucket {
            subject.buckets.push_back(Bucket {
                start: bucket_start,
                samples: 0,
                stats: BTreeMap::new(),
            });
        }

        if let Some(bucket) = subject.buckets.back_mut() {
            bucket.samples += 1;
            for (name, value) in &features.features {
                bucket.stats.entry(name.clone()).or_default().push(*value);
            }
        }

        subject.last_timestamp = Some(timestamp);
        subject.version += 1;
        subject.archived = false;

        Ok(self.build_snapshot(subject_id, timestamp))
    }

    /// Per-feature z-scores of `features` against the current baseline.
    ///
    /// Buckets that have fallen out of the window at the vector's timestamp
    /// are ignored.
    pub fn deviation(&self, subject_id: &str, features: &FeatureVector) -> Deviation {
        let required = self.config.min_samples;
        let (samples, merged) = match self.subjects.get(subject_id) {
            Some(subject) => self.merge_live(subject, features.timestamp),
            None => (0, BTreeMap::new()),
        };

        if samples < required {
            return Deviation::Provisional { samples, required };
        }

        let mut result = BTreeMap::new();
        for (name, value) in &features.features {
            let Some(stats) = merged.get(name) else { continue };
            if stats.count() < required {
                continue;
            }
            let std = stats.variance().sqrt().max(self.config.min_std);
            let z = ((value - stats.mean()) / std).clamp(-self.config.max_z, self.config.max_z);
            result.insert(
                name.clone(),
                FeatureDeviation {
                    z,
                    baseline_mean: stats.mean(),
                    baseline_std: std,
                    tail_probability: tail_probability(z),
                },
            );
        }

        if result.is_empty() {
            Deviation::Provisional { samples, required }
        } else {
            Deviation::Measured { features: result }
        }
    }

    /// Current snapshot for a subject.
    pub fn snapshot(&self, subject_id: &str) -> Option<BaselineSnapshot> {
        let last = self.subjects.get(subject_id)?.last_timestamp?;
        Some(self.build_snapshot(subject_id, last))
    }

    /// Subject record with its archived snapshots.
    pub fn subject(&self, subject_id: &str) -> Option<Subject> {
        self.subjects.get(subject_id).map(|s| Subject {
            subject_id: subject_id.to_string(),
            context: s.context,
            archived: s.archived,
            history: s.history.clone(),
        })
    }

    /// Seed a subject from a persisted snapshot.
    ///
    /// The restored statistics land in a single bucket at the snapshot's
    /// window end; the version counter continues from the snapshot.
    pub fn restore(&mut self, snapshot: &BaselineSnapshot) {
        let start = self.bucket_start(snapshot.window_end);
        let stats = snapshot
            .features
            .iter()
            .map(|(name, s)| (name.clone(), RunningStats::from_stats(s)))
            .collect();

        let mut buckets = VecDeque::new();
        if snapshot.sample_count > 0 {
            buckets.push_back(Bucket {
                start,
                samples: snapshot.sample_count,
                stats,
            });
        }

        let subject = self
            .subjects
            .entry(snapshot.subject_id.clone())
            .or_insert_with(SubjectBaseline::new);
        subject.context = snapshot.context;
        subject.buckets = buckets;
        subject.last_timestamp = Some(snapshot.window_end);
        subject.version = snapshot.version;
    }

    /// Archive the current snapshot into the subject's history.
    pub fn archive(&mut self, subject_id: &str) -> Option<BaselineSnapshot> {
        let snapshot = self.snapshot(subject_id)?;
        let limit = self.config.history_limit;
        let subject = self.subjects.get_mut(subject_id)?;
        subject.history.push(snapshot.clone());
        if subject.history.len() > limit {
            let excess = subject.history.len() - limit;
            subject.history.drain(..excess);
        }
        subject.archived = true;
        Some(snapshot)
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.bucket_width.num_milliseconds();
        let ts_ms = timestamp.timestamp_millis();
        let start_ms = ts_ms - ts_ms.rem_euclid(width_ms);
        Utc.timestamp_millis_opt(start_ms).single().unwrap_or(timestamp)
    }

    fn merge_live(&self, subject: &SubjectBaseline, at: DateTime<Utc>) -> (u64, BTreeMap<String, RunningStats>) {
        let window_start = at - self.window;
        let mut samples = 0;
        let mut merged: BTreeMap<String, RunningStats> = BTreeMap::new();
        for bucket in subject
            .buckets
            .iter()
            .filter(|b| b.start + self.bucket_width > window_start)
        {
            samples += bucket.samples;
            for (name, stats) in &bucket.stats {
                merged.entry(name.clone()).or_default().merge(stats);
            }
        }
        (samples, merged)
    }

    fn build_snapshot(&self, subject_id: &str, at: DateTime<Utc>) -> BaselineSnapshot {
        let subject = &self.subjects[subject_id];
        let (sample_count, merged) = self.merge_live(subject, at);
        let window_start = subject
            .buckets
            .iter()
            .find(|b| b.start + self.bucket_width > at - self.window)
            .map(|b| b.start)
            .unwrap_or(at);

        BaselineSnapshot {
            subject_id: subject_id.to_string(),
            context: subject.context,
            window_start,
            window_end: at,
            sample_count,
            features: merged.iter().map(|(k, v)| (k.clone(), FeatureStats::from(v))).collect(),
            version: subject.version,
            insufficient_data: sample_count < self.config.min_samples,
        }
    }
}

fn tail_probability(z: f64) -> f64 {
    let normal = Normal::standard();
    (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0)
}
