//! Feature normalization.
//!
//! Converts raw motion samples into a canonical feature vector: units are
//! converted, physical ranges are enforced and noisy inertial statistics are
//! passed through a bounded exponential smoothing filter keyed per subject.

use crate::feed::{Activity, MotionSample, Zone};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Lower bound applied to the configured smoothing coefficient.
const MIN_SMOOTHING_ALPHA: f64 = 0.05;

/// Upper bound on a plausible sensor sampling rate.
const MAX_SAMPLING_RATE_HZ: f64 = 10_000.0;

/// Unit conversion and range rule for a known feature.
struct FeatureSpec {
    raw: &'static str,
    canonical: &'static str,
    scale: f64,
    min: f64,
    max: f64,
    smoothed: bool,
}

const FEATURE_SPECS: &[FeatureSpec] = &[
    FeatureSpec { raw: "gait_speed", canonical: "gait_speed", scale: 1.0, min: 0.0, max: 5.0, smoothed: false },
    FeatureSpec { raw: "gait_speed_cm_s", canonical: "gait_speed", scale: 0.01, min: 0.0, max: 5.0, smoothed: false },
    FeatureSpec { raw: "stride_length", canonical: "stride_length", scale: 1.0, min: 0.0, max: 3.0, smoothed: false },
    FeatureSpec { raw: "stride_length_cm", canonical: "stride_length", scale: 0.01, min: 0.0, max: 3.0, smoothed: false },
    FeatureSpec { raw: "stride_variability", canonical: "stride_variability", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: false },
    FeatureSpec { raw: "balance_sway", canonical: "balance_sway", scale: 1.0, min: 0.0, max: 100.0, smoothed: false },
    FeatureSpec { raw: "balance_sway_mm", canonical: "balance_sway", scale: 0.1, min: 0.0, max: 100.0, smoothed: false },
    FeatureSpec { raw: "accel_magnitude", canonical: "accel_magnitude", scale: 1.0, min: 0.0, max: 160.0, smoothed: true },
    FeatureSpec { raw: "accel_magnitude_g", canonical: "accel_magnitude", scale: 9.80665, min: 0.0, max: 160.0, smoothed: true },
    FeatureSpec { raw: "acc_variance", canonical: "acc_variance", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: true },
    FeatureSpec { raw: "acc_jerk", canonical: "acc_jerk", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: true },
    FeatureSpec { raw: "acc_energy", canonical: "acc_energy", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: true },
    FeatureSpec { raw: "gyro_variance", canonical: "gyro_variance", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: true },
    FeatureSpec { raw: "step_regularity", canonical: "step_regularity", scale: 1.0, min: 0.0, max: f64::MAX, smoothed: false },
];

fn spec_for(name: &str) -> Option<&'static FeatureSpec> {
    FEATURE_SPECS.iter().find(|s| s.raw == name)
}

fn is_smoothed(canonical: &str) -> bool {
    FEATURE_SPECS.iter().any(|s| s.canonical == canonical && s.smoothed)
}

/// Normalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Exponential smoothing coefficient (1.0 disables smoothing)
    pub smoothing_alpha: f64,
    /// Gap after which a subject's smoothing state starts fresh (in seconds)
    pub session_gap_secs: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.3,
            session_gap_secs: 300, // 5 minutes
        }
    }
}

/// Canonical, validated view of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub sampling_rate_hz: f64,
    /// Features in canonical units
    pub features: BTreeMap<String, f64>,
    pub activity: Option<Activity>,
    pub fall_detected: bool,
    pub zone: Option<Zone>,
    /// External model outputs carried through unchanged
    pub signals: BTreeMap<String, f64>,
    pub tags: BTreeSet<String>,
}

impl FeatureVector {
    /// Create a vector with no features.
    pub fn empty(subject_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            timestamp,
            sampling_rate_hz: 1.0,
            features: BTreeMap::new(),
            activity: None,
            fall_detected: false,
            zone: None,
            signals: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    pub fn signal(&self, name: &str) -> Option<f64> {
        self.signals.get(name).copied()
    }

    /// Whether any feature name starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.features.keys().any(|k| k.starts_with(prefix))
    }
}

/// MalformedSampleError: the sample is dropped, the stream continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("malformed sample: missing subject id")]
    MissingSubject,
    #[error("malformed sample for {subject_id}: invalid sampling rate {rate}")]
    InvalidSamplingRate { subject_id: String, rate: f64 },
    #[error("malformed sample for {subject_id}: no features")]
    NoFeatures { subject_id: String },
    #[error("malformed sample for {subject_id}: {field} is not finite")]
    NonFinite { subject_id: String, field: String },
    #[error("malformed sample for {subject_id}: {field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        subject_id: String,
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("malformed sample for {subject_id}: {field} reported more than once")]
    Duplicate { subject_id: String, field: String },
}

/// Convert a raw sample into canonical units and validate it.
///
/// Pure function of the input; no smoothing is applied.
pub fn canonicalize(sample: &MotionSample) -> Result<FeatureVector, NormalizeError> {
    let subject_id = sample.subject_id.trim();
    if subject_id.is_empty() {
        return Err(NormalizeError::MissingSubject);
    }
    let subject = || subject_id.to_string();

    let rate = sample.sampling_rate_hz;
    if !rate.is_finite() || rate <= 0.0 || rate > MAX_SAMPLING_RATE_HZ {
        return Err(NormalizeError::InvalidSamplingRate {
            subject_id: subject(),
            rate,
        });
    }

    if sample.features.is_empty() {
        return Err(NormalizeError::NoFeatures { subject_id: subject() });
    }

    let mut features = BTreeMap::new();
    for (name, &raw) in &sample.features {
        if !raw.is_finite() {
            return Err(NormalizeError::NonFinite {
                subject_id: subject(),
                field: name.clone(),
            });
        }

        let (canonical, value, min, max) = match spec_for(name) {
            Some(spec) => (spec.canonical.to_string(), raw * spec.scale, spec.min, spec.max),
            None if name.starts_with(crate::core::classify::PPE_FEATURE_PREFIX) => (name.clone(), raw, 0.0, 1.0),
            None => (name.clone(), raw, f64::MIN, f64::MAX),
        };

        if value < min || value > max {
            return Err(NormalizeError::OutOfRange {
                subject_id: subject(),
                field: name.clone(),
                value: raw,
                min,
                max,
            });
        }

        if features.insert(canonical.clone(), value).is_some() {
            return Err(NormalizeError::Duplicate {
                subject_id: subject(),
                field: canonical,
            });
        }
    }

    for (name, value) in &sample.signals {
        if !value.is_finite() {
            return Err(NormalizeError::NonFinite {
                subject_id: subject(),
                field: name.clone(),
            });
        }
    }

    Ok(FeatureVector {
        subject_id: subject(),
        timestamp: sample.timestamp,
        sampling_rate_hz: rate,
        features,
        activity: sample.activity,
        fall_detected: sample.fall_detected,
        zone: sample.zone,
        signals: sample.signals.clone(),
        tags: sample.tags.clone(),
    })
}

/// Per-subject smoothing memory.
#[derive(Debug, Clone)]
struct SmoothingState {
    last_timestamp: DateTime<Utc>,
    values: BTreeMap<String, f64>,
}

/// Feature normalizer with per-subject smoothing state.
#[derive(Debug)]
pub struct Normalizer {
    alpha: f64,
    session_gap: Duration,
    state: HashMap<String, SmoothingState>,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            alpha: config.smoothing_alpha.clamp(MIN_SMOOTHING_ALPHA, 1.0),
            session_gap: Duration::seconds(config.session_gap_secs as i64),
            state: HashMap::new(),
        }
    }

    /// Normalize a raw sample.
    ///
    /// Smoothing state is only touched once the sample has validated.
    pub fn normalize(&mut self, sample: &MotionSample) -> Result<FeatureVector, NormalizeError> {
        let mut vector = canonicalize(sample)?;
        self.smooth(&mut vector);
        Ok(vector)
    }

    /// Apply the subject's smoothing filter to an already canonical vector.
    pub fn smooth(&mut self, vector: &mut FeatureVector) {
        let alpha = self.alpha;

        // A long gap starts a new session
        let stale = self
            .state
            .get(&vector.subject_id)
            .map(|s| vector.timestamp - s.last_timestamp > self.session_gap)
            .unwrap_or(false);
        if stale {
            self.state.remove(&vector.subject_id);
        }

        let state = self
            .state
            .entry(vector.subject_id.clone())
            .or_insert_with(|| SmoothingState {
                last_timestamp: vector.timestamp,
                values: BTreeMap::new(),
            });

        for (name, value) in vector.features.iter_mut() {
            if !is_smoothed(name) {
                continue;
            }
            let smoothed = match state.values.get(name) {
                Some(previous) => alpha * *value + (1.0 - alpha) * previous,
                None => *value,
            };
            state.values.insert(name.clone(), smoothed);
            *value = smoothed;
        }

        state.last_timestamp = vector.timestamp;
    }

    /// Drop smoothing memory for a subject whose session was closed.
    pub fn close_session(&mut self, subject_id: &str) {
        self.state.remove(subject_id);
    }

    /// Number of subjects with live smoothing state.
    pub fn tracked_subjects(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_unit_conversion() {
        let sample = MotionSample::new("S1", at(0), 50.0)
            .with_feature("gait_speed_cm_s", 120.0)
            .with_feature("accel_magnitude_g", 1.0)
            .with_feature("balance_sway_mm", 25.0);
        let fv = canonicalize(&sample).unwrap();
        assert!((fv.get("gait_speed").unwrap() - 1.2).abs() < 1e-12);
        assert!((fv.get("accel_magnitude").unwrap() - 9.80665).abs() < 1e-12);
        assert!((fv.get("balance_sway").unwrap() - 2.5).abs() < 1e-12);
        assert!(fv.get("gait_speed_cm_s").is_none());
    }

    #[test]
    fn test_rejects_bad_sampling_rate() {
        let sample = MotionSample::new("S1", at(0), -50.0).with_feature("gait_speed", 1.0);
        assert!(matches!(
            canonicalize(&sample),
            Err(NormalizeError::InvalidSamplingRate { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_fields() {
        let sample = MotionSample::new("  ", at(0), 50.0).with_feature("gait_speed", 1.0);
        assert_eq!(canonicalize(&sample), Err(NormalizeError::MissingSubject));

        let sample = MotionSample::new("S1", at(0), 50.0);
        assert!(matches!(canonicalize(&sample), Err(NormalizeError::NoFeatures { .. })));
    }

    #[test]
    fn test_rejects_out_of_range_and_duplicates() {
        let sample = MotionSample::new("S1", at(0), 50.0).with_feature("gait_speed", -0.5);
        assert!(matches!(canonicalize(&sample), Err(NormalizeError::OutOfRange { .. })));

        let sample = MotionSample::new("S1", at(0), 50.0).with_feature("ppe_helmet", 1.5);
        assert!(matches!(canonicalize(&sample), Err(NormalizeError::OutOfRange { .. })));

        let sample = MotionSample::new("S1", at(0), 50.0)
            .with_feature("gait_speed", 1.0)
            .with_feature("gait_speed_cm_s", 100.0);
        assert!(matches!(canonicalize(&sample), Err(NormalizeError::Duplicate { .. })));
    }

    #[test]
    fn test_rejects_non_finite_signal() {
        let sample = MotionSample::new("S1", at(0), 50.0)
            .with_feature("gait_speed", 1.0)
            .with_signal("fall_prob", f64::NAN);
        assert!(matches!(canonicalize(&sample), Err(NormalizeError::NonFinite { .. })));
    }

    #[test]
    fn test_smoothing_applies_to_inertial_features_only() {
        let config = NormalizerConfig {
            smoothing_alpha: 0.5,
            session_gap_secs: 300,
        };
        let mut normalizer = Normalizer::new(&config);

        let first = MotionSample::new("S1", at(0), 50.0)
            .with_feature("acc_energy", 10.0)
            .with_feature("gait_speed", 1.0);
        let second = MotionSample::new("S1", at(1), 50.0)
            .with_feature("acc_energy", 20.0)
            .with_feature("gait_speed", 2.0);

        normalizer.normalize(&first).unwrap();
        let fv = normalizer.normalize(&second).unwrap();
        assert!((fv.get("acc_energy").unwrap() - 15.0).abs() < 1e-12);
        assert!((fv.get("gait_speed").unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_session_reset() {
        let config = NormalizerConfig {
            smoothing_alpha: 0.5,
            session_gap_secs: 60,
        };
        let mut normalizer = Normalizer::new(&config);

        normalizer
            .normalize(&MotionSample::new("S1", at(0), 50.0).with_feature("acc_energy", 10.0))
            .unwrap();

        // Gap beyond the session threshold starts fresh
        let fv = normalizer
            .normalize(&MotionSample::new("S1", at(600), 50.0).with_feature("acc_energy", 30.0))
            .unwrap();
        assert!((fv.get("acc_energy").unwrap() - 30.0).abs() < 1e-12);

        normalizer.close_session("S1");
        assert_eq!(normalizer.tracked_subjects(), 0);
    }

    #[test]
    fn test_malformed_sample_leaves_state_untouched() {
        let mut normalizer = Normalizer::new(&NormalizerConfig::default());
        let bad = MotionSample::new("S1", at(0), 0.0).with_feature("acc_energy", 10.0);
        assert!(normalizer.normalize(&bad).is_err());
        assert_eq!(normalizer.tracked_subjects(), 0);
    }
}
