//! Built-in model wrappers and rule scorers.

use super::{
    ScorerError, SignalScorer, SubSignal, ACTIVITY_RISK, PPE_COMPLIANCE, RECOVERY_RISK, ZONE_SAFETY,
};
use crate::core::classify::PPE_FEATURE_PREFIX;
use crate::core::normalize::FeatureVector;
use crate::feed::{Activity, Zone};

/// Fall probability band treated as a near fall.
const NEAR_FALL_RANGE: std::ops::Range<f64> = 0.45..0.7;

/// Lifts a pre-computed model output from the sample's signal map.
#[derive(Debug, Clone)]
pub struct PrecomputedSignal {
    input: String,
    name: String,
    source: String,
}

impl PrecomputedSignal {
    pub fn new(input: impl Into<String>, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            name: name.into(),
            source: source.into(),
        }
    }
}

impl SignalScorer for PrecomputedSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        let value = features
            .signal(&self.input)
            .ok_or_else(|| ScorerError::MissingInput(self.input.clone()))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ScorerError::InvalidInput {
                input: self.input.clone(),
                value,
            });
        }
        Ok(SubSignal::new(&self.name, &self.source, value))
    }
}

/// Elderly risk from the activity label and fall events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityRiskRule;

impl SignalScorer for ActivityRiskRule {
    fn name(&self) -> &str {
        ACTIVITY_RISK
    }

    fn source(&self) -> &str {
        "activity_rules"
    }

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        if features.fall_detected {
            return Ok(SubSignal::new(ACTIVITY_RISK, self.source(), 1.0).with_note("fall detected"));
        }

        let activity = features
            .activity
            .ok_or_else(|| ScorerError::MissingInput("activity".to_string()))?;

        let (mut value, note) = match activity {
            Activity::Transitions => (0.6, Some("instability during posture transitions")),
            Activity::Stairs => (0.5, Some("stair use")),
            Activity::Static => (0.3, Some("inactivity")),
            Activity::Exercise => (0.3, Some("fatigue")),
            Activity::Walk => (0.0, None),
        };

        let mut signal = SubSignal::new(ACTIVITY_RISK, self.source(), 0.0);
        if let Some(note) = note {
            signal.notes.push(note.to_string());
        }

        if let Some(prob) = features.signal("fall_prob") {
            if NEAR_FALL_RANGE.contains(&prob) {
                value = f64::max(value, 0.5);
                signal.notes.push(format!("near fall (fall probability {prob:.2})"));
            }
        }

        signal.value = value;
        Ok(signal)
    }
}

/// Workplace zone and posture violations in one sample, with their risk.
pub fn zone_violations(features: &FeatureVector) -> Vec<(f64, &'static str)> {
    let mut violations = Vec::new();
    match (features.zone, features.activity) {
        (Some(Zone::Restricted), Some(Activity::Walk)) => violations.push((1.0, "restricted zone entry")),
        (Some(Zone::Hazard), Some(Activity::Stairs)) => violations.push((0.9, "stairs in hazard zone")),
        _ => {}
    }
    match features.activity {
        Some(Activity::Exercise) => violations.push((0.6, "overexertion")),
        Some(Activity::Static) => violations.push((0.6, "prolonged inactivity, possible collapse")),
        Some(Activity::Transitions) => violations.push((0.5, "unsafe posture transition")),
        _ => {}
    }
    violations
}

/// Workplace zone and posture rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneSafetyRule;

impl SignalScorer for ZoneSafetyRule {
    fn name(&self) -> &str {
        ZONE_SAFETY
    }

    fn source(&self) -> &str {
        "zone_rules"
    }

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        if features.zone.is_none() && features.activity.is_none() {
            return Err(ScorerError::MissingInput("zone or activity".to_string()));
        }

        let violations = zone_violations(features);
        let value = violations.iter().map(|(v, _)| *v).fold(0.0, f64::max);
        let confidence = if features.zone.is_some() { 1.0 } else { 0.6 };

        let mut signal = SubSignal::new(ZONE_SAFETY, self.source(), value).with_confidence(confidence);
        signal.notes = violations.into_iter().map(|(_, note)| note.to_string()).collect();
        Ok(signal)
    }
}

/// Workplace PPE non-compliance from `ppe_*` detector features.
#[derive(Debug, Clone, Copy, Default)]
pub struct PpeComplianceRule;

impl SignalScorer for PpeComplianceRule {
    fn name(&self) -> &str {
        PPE_COMPLIANCE
    }

    fn source(&self) -> &str {
        "ppe_rules"
    }

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        let items: Vec<(&str, f64)> = features
            .features
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(PPE_FEATURE_PREFIX).map(|item| (item, *v)))
            .collect();

        if items.is_empty() {
            return Err(ScorerError::MissingInput(format!("{PPE_FEATURE_PREFIX}*")));
        }

        let compliance = items.iter().map(|(_, v)| v).sum::<f64>() / items.len() as f64;
        let mut signal = SubSignal::new(PPE_COMPLIANCE, self.source(), (1.0 - compliance).clamp(0.0, 1.0));
        for (item, worn) in items {
            if worn < 0.5 {
                signal.notes.push(format!("missing {item}"));
            }
        }
        Ok(signal)
    }
}

/// Which recovery index a rehab sample reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryIndex {
    /// Limb recovery status index from the `rsi` model
    Limb,
    /// Substance recovery index from sleep quality and stress regulation
    Substance,
}

impl RecoveryIndex {
    fn label(self) -> &'static str {
        match self {
            RecoveryIndex::Limb => "rsi",
            RecoveryIndex::Substance => "substance recovery index",
        }
    }

    /// Clinical band for an index value in [0, 100].
    pub fn status(self, index: f64) -> &'static str {
        match self {
            RecoveryIndex::Limb if index >= 70.0 => "Good Recovery",
            RecoveryIndex::Limb if index >= 50.0 => "Moderate Recovery",
            RecoveryIndex::Limb => "Needs Improvement",
            RecoveryIndex::Substance if index < 30.0 => "High Risk",
            RecoveryIndex::Substance if index < 60.0 => "Early Recovery",
            RecoveryIndex::Substance => "Stable Recovery",
        }
    }
}

/// Rehabilitation risk from the recovery status index.
///
/// Uses `rsi` (0-100) when present, otherwise the substance recovery index
/// derived from `sleep_quality` and `stress_regulation`. Status bands follow
/// the index that was used.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryIndexRule;

impl RecoveryIndexRule {
    fn index(features: &FeatureVector) -> Result<(f64, RecoveryIndex), ScorerError> {
        if let Some(rsi) = features.signal("rsi") {
            return Ok((rsi, RecoveryIndex::Limb));
        }
        match (features.signal("sleep_quality"), features.signal("stress_regulation")) {
            (Some(sleep), Some(stress)) => Ok((0.5 * sleep + 0.5 * stress, RecoveryIndex::Substance)),
            _ => Err(ScorerError::MissingInput(
                "rsi or sleep_quality/stress_regulation".to_string(),
            )),
        }
    }
}

impl SignalScorer for RecoveryIndexRule {
    fn name(&self) -> &str {
        RECOVERY_RISK
    }

    fn source(&self) -> &str {
        "recovery_model"
    }

    fn score(&self, features: &FeatureVector) -> Result<SubSignal, ScorerError> {
        let (index, kind) = Self::index(features)?;
        if !(0.0..=100.0).contains(&index) {
            return Err(ScorerError::InvalidInput {
                input: kind.label().to_string(),
                value: index,
            });
        }

        Ok(SubSignal::new(RECOVERY_RISK, self.source(), 1.0 - index / 100.0)
            .with_note(format!("{} {index:.1}: {}", kind.label(), kind.status(index))))
    }
}
