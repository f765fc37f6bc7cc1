//! Context classification.
//!
//! Decides which interpretation context (Elderly, Workplace, Rehab) applies
//! to a normalized sample. An explicit, recognized hint always wins;
//! otherwise a fixed rule cascade runs over the feature signature and the
//! subject registry.

use crate::config::SubjectProfile;
use crate::core::normalize::FeatureVector;
use crate::feed::Zone;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Tag for rehab sessions set by the ingestion collaborator.
pub const REHAB_SESSION_TAG: &str = "rehab_session";

/// Prefix of features produced by PPE detection sensors.
pub const PPE_FEATURE_PREFIX: &str = "ppe_";

const GAIT_FEATURES: &[&str] = &["gait_speed", "stride_length", "stride_variability", "balance_sway"];
const LIMB_FEATURES: &[&str] = &["acc_variance", "acc_jerk", "step_regularity", "gyro_variance", "acc_energy"];

/// Interpretation context for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    Elderly,
    Workplace,
    Rehab,
}

impl Context {
    pub const ALL: [Context; 3] = [Context::Elderly, Context::Workplace, Context::Rehab];

    /// Parse an explicit context hint. Returns `None` for unrecognized hints.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_lowercase().as_str() {
            "elderly" => Some(Context::Elderly),
            "workplace" | "employee" => Some(Context::Workplace),
            "rehab" => Some(Context::Rehab),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Context::Elderly => "elderly",
            Context::Workplace => "workplace",
            Context::Rehab => "rehab",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer interpretation within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubMode {
    General,
    RestrictedZone,
    HazardZone,
    SafeZone,
    LimbRecovery,
    SubstanceRecovery,
}

/// What decided the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Hint,
    PpeSensors,
    ZoneData,
    RehabSession,
    GaitWithElderlyProfile,
    Registry,
}

/// Result of classifying one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub context: Context,
    pub sub_mode: SubMode,
    pub source: ClassificationSource,
}

/// Classification errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    #[error("unresolved context for subject {subject_id}: no rule matched and no usable hint")]
    Unresolved { subject_id: String },
}

/// Deterministic rule-cascade classifier.
#[derive(Debug, Clone, Default)]
pub struct ContextClassifier {
    registry: BTreeMap<String, SubjectProfile>,
}

impl ContextClassifier {
    pub fn new(registry: BTreeMap<String, SubjectProfile>) -> Self {
        Self { registry }
    }

    /// Look up a subject's registry profile.
    pub fn profile(&self, subject_id: &str) -> Option<&SubjectProfile> {
        self.registry.get(subject_id)
    }

    /// Classify a sample.
    ///
    /// Rule order: hint, PPE sensors, zone data, rehab session tag,
    /// gait/balance features with an elderly registry profile, registry role.
    pub fn classify(
        &self,
        subject_id: &str,
        features: &FeatureVector,
        hint: Option<&str>,
    ) -> Result<Classification, ClassifyError> {
        if let Some(context) = hint.and_then(Context::from_hint) {
            return Ok(Classification {
                context,
                sub_mode: sub_mode_for(context, features),
                source: ClassificationSource::Hint,
            });
        }

        let role = self.registry.get(subject_id).and_then(|p| p.role);

        let rule = if features.has_prefix(PPE_FEATURE_PREFIX) {
            Some((Context::Workplace, ClassificationSource::PpeSensors))
        } else if features.zone.is_some() {
            Some((Context::Workplace, ClassificationSource::ZoneData))
        } else if features.tags.contains(REHAB_SESSION_TAG) {
            Some((Context::Rehab, ClassificationSource::RehabSession))
        } else if role == Some(Context::Elderly) && GAIT_FEATURES.iter().any(|f| features.get(f).is_some()) {
            Some((Context::Elderly, ClassificationSource::GaitWithElderlyProfile))
        } else {
            role.map(|r| (r, ClassificationSource::Registry))
        };

        match rule {
            Some((context, source)) => Ok(Classification {
                context,
                sub_mode: sub_mode_for(context, features),
                source,
            }),
            None => Err(ClassifyError::Unresolved {
                subject_id: subject_id.to_string(),
            }),
        }
    }
}

fn sub_mode_for(context: Context, features: &FeatureVector) -> SubMode {
    match context {
        Context::Elderly => SubMode::General,
        Context::Workplace => match features.zone {
            Some(Zone::Restricted) => SubMode::RestrictedZone,
            Some(Zone::Hazard) => SubMode::HazardZone,
            Some(Zone::Safe) => SubMode::SafeZone,
            None => SubMode::General,
        },
        Context::Rehab => {
            if features.signals.contains_key("sleep_quality") || features.signals.contains_key("stress_regulation") {
                SubMode::SubstanceRecovery
            } else if features.signals.contains_key("rsi") || LIMB_FEATURES.iter().any(|f| features.get(f).is_some()) {
                SubMode::LimbRecovery
            } else {
                SubMode::General
            }
        }
    }
}
