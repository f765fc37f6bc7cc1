//! Inbound motion sample types.
//!
//! A `MotionSample` is what the external motion-ingestion collaborator
//! delivers: sensor-derived features plus whatever labels and model outputs
//! it already computed upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Activity label produced by the upstream activity classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Activity {
    Walk,
    Static,
    Transitions,
    Exercise,
    Stairs,
}

impl Activity {
    /// Parse a label as emitted by the activity classifier.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "walk" | "walking" => Some(Activity::Walk),
            "static" | "still" => Some(Activity::Static),
            "transitions" | "transition" => Some(Activity::Transitions),
            "exercise" => Some(Activity::Exercise),
            "stairs" => Some(Activity::Stairs),
            _ => None,
        }
    }
}

/// Workplace zone reported by the positioning collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    Restricted,
    Hazard,
    Safe,
}

/// A single motion record for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Opaque subject identity
    pub subject_id: String,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Sensor sampling rate the features were derived at
    pub sampling_rate_hz: f64,
    /// Raw sensor-derived features, possibly in non-canonical units
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    /// Explicit context hint (may be overridden by the classifier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_hint: Option<String>,
    /// Activity label from the upstream classifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    /// Whether the upstream fall detector fired for this sample
    #[serde(default)]
    pub fall_detected: bool,
    /// Zone the subject was in, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<Zone>,
    /// Pre-computed external model outputs (e.g. `fall_prob`, `rsi`)
    #[serde(default)]
    pub signals: BTreeMap<String, f64>,
    /// Free-form session tags (e.g. `rehab_session`)
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MotionSample {
    /// Create a sample with no labels, signals or tags.
    pub fn new(subject_id: impl Into<String>, timestamp: DateTime<Utc>, sampling_rate_hz: f64) -> Self {
        Self {
            subject_id: subject_id.into(),
            timestamp,
            sampling_rate_hz,
            features: BTreeMap::new(),
            context_hint: None,
            activity: None,
            fall_detected: false,
            zone: None,
            signals: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn with_signal(mut self, name: impl Into<String>, value: f64) -> Self {
        self.signals.insert(name.into(), value);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.context_hint = Some(hint.into());
        self
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zone = Some(zone);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}
