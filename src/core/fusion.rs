//! Signal fusion.
//!
//! Combines the baseline deviation and the context's sub-signals into one
//! bounded composite score using a per-context weight table. Fusion is
//! total: missing or failed inputs contribute a neutral value and are
//! marked in the breakdown instead of failing the score.

use crate::config::ConfigError;
use crate::core::baseline::Deviation;
use crate::core::classify::Context;
use crate::signals::{
    SignalStatus, SubSignal, ACTIVITY_RISK, FALL_RISK, NEUTRAL_VALUE, PPE_COMPLIANCE, RECOVERY_RISK, ZONE_SAFETY,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Name of the deviation-derived contribution.
pub const DEVIATION_SIGNAL: &str = "deviation";

/// Allowed drift of a weight table's sum from 1.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Mapping from deviation z-scores to risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// |z| at or below which deviation risk is zero
    pub deadband_z: f64,
    /// |z| at or above which deviation risk is one
    pub saturation_z: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            deadband_z: 1.0,
            saturation_z: 4.0,
        }
    }
}

impl FusionConfig {
    /// Risk in [0, 1] for the largest absolute z-score.
    pub fn deviation_risk(&self, max_abs_z: f64) -> f64 {
        let span = self.saturation_z - self.deadband_z;
        if span <= 0.0 {
            return if max_abs_z > self.deadband_z { 1.0 } else { 0.0 };
        }
        ((max_abs_z - self.deadband_z) / span).clamp(0.0, 1.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.deadband_z.is_finite()
            && self.saturation_z.is_finite()
            && self.deadband_z >= 0.0
            && self.saturation_z > self.deadband_z;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                field: "fusion".to_string(),
                reason: format!(
                    "need 0 <= deadband_z < saturation_z, got {} and {}",
                    self.deadband_z, self.saturation_z
                ),
            })
        }
    }
}

/// Per-context weights over the deviation signal and named sub-signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(BTreeMap<String, f64>);

impl WeightTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Built-in weights for a context.
    pub fn defaults_for(context: Context) -> Self {
        match context {
            Context::Elderly => Self::new([(DEVIATION_SIGNAL, 0.5), (FALL_RISK, 0.4), (ACTIVITY_RISK, 0.1)]),
            Context::Workplace => Self::new([(DEVIATION_SIGNAL, 0.2), (PPE_COMPLIANCE, 0.4), (ZONE_SAFETY, 0.4)]),
            Context::Rehab => Self::new([(DEVIATION_SIGNAL, 0.4), (RECOVERY_RISK, 0.6)]),
        }
    }

    pub fn weight(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Weights must be finite, non-negative and sum to 1.
    pub fn validate(&self, context: Context) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidWeights { context, reason };

        if self.0.is_empty() {
            return Err(invalid("weight table is empty".to_string()));
        }
        for (name, weight) in &self.0 {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(invalid(format!("weight for {name} is {weight}")));
            }
        }
        let sum: f64 = self.0.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(invalid(format!("weights sum to {sum}, expected 1")));
        }
        Ok(())
    }
}

/// Why a contribution carries the value it does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContributionStatus {
    Ok,
    /// Baseline still below its minimum sample count
    Provisional,
    Degraded { reason: String },
}

/// One row of a composite score's breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub name: String,
    pub source: String,
    pub value: f64,
    pub weight: f64,
    pub confidence: f64,
    pub status: ContributionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Contribution {
    pub fn weighted(&self) -> f64 {
        self.weight * self.value
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, ContributionStatus::Degraded { .. })
    }
}

/// Fused, explainable risk value for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub context: Context,
    /// Always within [0, 1]
    pub value: f64,
    /// Weight-averaged confidence of the contributions
    pub confidence: f64,
    /// Monotone per subject
    pub version: u64,
    pub breakdown: Vec<Contribution>,
}

impl CompositeScore {
    /// Document key: subject, timestamp in milliseconds and version.
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.subject_id, self.timestamp.timestamp_millis(), self.version)
    }

    /// Highest value among weighted sub-signals that actually reported.
    ///
    /// The deviation row and degraded placeholders do not count.
    pub fn worst_signal(&self) -> f64 {
        self.breakdown
            .iter()
            .filter(|c| c.weight > 0.0 && c.name != DEVIATION_SIGNAL && c.status == ContributionStatus::Ok)
            .map(|c| c.value)
            .fold(0.0, f64::max)
    }

    pub fn contribution(&self, name: &str) -> Option<&Contribution> {
        self.breakdown.iter().find(|c| c.name == name)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &Contribution> {
        self.breakdown.iter().filter(|c| c.is_degraded())
    }
}

/// Total order used for dashboard ranking, most urgent first.
///
/// Value descending, then worst single sub-signal descending, then most
/// recent timestamp, then subject id ascending.
pub fn compare_for_ranking(a: &CompositeScore, b: &CompositeScore) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| b.worst_signal().total_cmp(&a.worst_signal()))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.subject_id.cmp(&b.subject_id))
}

/// Sort scores by urgency.
pub fn rank(scores: &mut [CompositeScore]) {
    scores.sort_by(compare_for_ranking);
}

/// Fusion engine holding the weight tables and per-subject versions.
#[derive(Debug)]
pub struct FusionEngine {
    config: FusionConfig,
    tables: HashMap<Context, WeightTable>,
    fallback: WeightTable,
    versions: HashMap<String, u64>,
}

impl FusionEngine {
    /// Contexts missing from `tables` use the built-in weights.
    pub fn new(config: FusionConfig, mut tables: HashMap<Context, WeightTable>) -> Self {
        for context in Context::ALL {
            tables
                .entry(context)
                .or_insert_with(|| WeightTable::defaults_for(context));
        }
        Self {
            config,
            tables,
            fallback: WeightTable::new([(DEVIATION_SIGNAL, 1.0)]),
            versions: HashMap::new(),
        }
    }

    /// Continue a subject's version counter after a restart.
    pub fn seed_version(&mut self, subject_id: &str, version: u64) {
        let current = self.versions.entry(subject_id.to_string()).or_insert(0);
        *current = (*current).max(version);
    }

    /// Fuse a deviation and sub-signals into a composite score.
    pub fn fuse(
        &mut self,
        subject_id: &str,
        timestamp: DateTime<Utc>,
        context: Context,
        deviation: &Deviation,
        signals: &[SubSignal],
    ) -> CompositeScore {
        let table = self.tables.get(&context).unwrap_or(&self.fallback);
        let mut breakdown = Vec::with_capacity(signals.len() + 1);

        breakdown.push(self.deviation_contribution(table, deviation));

        // Worst case wins among duplicates
        let mut by_name: BTreeMap<&str, &SubSignal> = BTreeMap::new();
        for signal in signals {
            let value = effective_value(signal);
            match by_name.get(signal.name.as_str()) {
                Some(existing) if effective_value(existing) >= value => {}
                _ => {
                    by_name.insert(signal.name.as_str(), signal);
                }
            }
        }

        for (name, weight) in table.iter() {
            if name == DEVIATION_SIGNAL {
                continue;
            }
            let contribution = match by_name.remove(name) {
                Some(signal) => contribution_from(signal, weight),
                None => Contribution {
                    name: name.to_string(),
                    source: "unavailable".to_string(),
                    value: NEUTRAL_VALUE,
                    weight,
                    confidence: 0.0,
                    status: ContributionStatus::Degraded {
                        reason: "sub-signal missing".to_string(),
                    },
                    notes: Vec::new(),
                },
            };
            breakdown.push(contribution);
        }

        // Kept for explainability only
        for signal in by_name.into_values() {
            breakdown.push(contribution_from(signal, 0.0));
        }

        let total_weight: f64 = breakdown.iter().map(|c| c.weight).sum();
        let value = breakdown.iter().map(Contribution::weighted).sum::<f64>();
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { NEUTRAL_VALUE };
        let confidence = if total_weight > 0.0 {
            (breakdown.iter().map(|c| c.weight * c.confidence).sum::<f64>() / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let version = self.versions.entry(subject_id.to_string()).or_insert(0);
        *version += 1;

        CompositeScore {
            subject_id: subject_id.to_string(),
            timestamp,
            context,
            value,
            confidence,
            version: *version,
            breakdown,
        }
    }

    fn deviation_contribution(&self, table: &WeightTable, deviation: &Deviation) -> Contribution {
        let weight = table.weight(DEVIATION_SIGNAL).unwrap_or(0.0);
        match deviation {
            Deviation::Provisional { samples, required } => Contribution {
                name: DEVIATION_SIGNAL.to_string(),
                source: "baseline".to_string(),
                value: NEUTRAL_VALUE,
                weight,
                confidence: if *required == 0 {
                    1.0
                } else {
                    (*samples as f64 / *required as f64).min(1.0)
                },
                status: ContributionStatus::Provisional,
                notes: vec![format!("baseline provisional ({samples}/{required} samples)")],
            },
            Deviation::Measured { .. } => {
                let max_abs_z = deviation.max_abs_z().unwrap_or(0.0);
                let notes = deviation
                    .worst_feature()
                    .map(|(name, d)| vec![format!("{name} z={:.2} (baseline {:.2})", d.z, d.baseline_mean)])
                    .unwrap_or_default();
                Contribution {
                    name: DEVIATION_SIGNAL.to_string(),
                    source: "baseline".to_string(),
                    value: self.config.deviation_risk(max_abs_z),
                    weight,
                    confidence: 1.0,
                    status: ContributionStatus::Ok,
                    notes,
                }
            }
        }
    }
}

fn effective_value(signal: &SubSignal) -> f64 {
    if signal.is_degraded() || !signal.value.is_finite() {
        NEUTRAL_VALUE
    } else {
        signal.value.clamp(0.0, 1.0)
    }
}

fn contribution_from(signal: &SubSignal, weight: f64) -> Contribution {
    let status = match &signal.status {
        SignalStatus::Ok if signal.value.is_finite() => ContributionStatus::Ok,
        SignalStatus::Ok => ContributionStatus::Degraded {
            reason: "non-finite value".to_string(),
        },
        SignalStatus::Degraded { reason } => ContributionStatus::Degraded { reason: reason.clone() },
    };
    let confidence = if signal.confidence.is_finite() {
        signal.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Contribution {
        name: signal.name.clone(),
        source: signal.source.clone(),
        value: effective_value(signal),
        weight,
        confidence,
        status,
        notes: signal.notes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::baseline::FeatureDeviation;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn measured(z: f64) -> Deviation {
        let mut features = BTreeMap::new();
        features.insert(
            "gait_speed".to_string(),
            FeatureDeviation {
                z,
                baseline_mean: 1.2,
                baseline_std: 0.1,
                tail_probability: 0.0,
            },
        );
        Deviation::Measured { features }
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default(), HashMap::new())
    }

    #[test]
    fn test_elderly_spike_fuses_above_critical() {
        let mut engine = engine();
        let signals = vec![
            SubSignal::new(FALL_RISK, "fall_model", 0.8),
            SubSignal::new(ACTIVITY_RISK, "activity_rules", 0.0),
        ];
        let score = engine.fuse("S1", at(0), Context::Elderly, &measured(-5.0), &signals);
        assert!((score.value - 0.82).abs() < 1e-9);
        assert_eq!(score.version, 1);
        assert_eq!(score.contribution(DEVIATION_SIGNAL).unwrap().value, 1.0);
    }

    #[test]
    fn test_missing_signal_is_neutral_and_degraded() {
        let mut engine = engine();
        let signals = vec![SubSignal::new(ZONE_SAFETY, "zone_rules", 0.0)];
        let score = engine.fuse("W1", at(0), Context::Workplace, &measured(0.0), &signals);

        let ppe = score.contribution(PPE_COMPLIANCE).unwrap();
        assert!(ppe.is_degraded());
        assert_eq!(ppe.value, NEUTRAL_VALUE);
        assert!((score.value - 0.2).abs() < 1e-9);
        assert_eq!(score.degraded().count(), 1);
    }

    #[test]
    fn test_provisional_baseline_is_neutral() {
        let mut engine = engine();
        let deviation = Deviation::Provisional {
            samples: 3,
            required: 10,
        };
        let score = engine.fuse("R1", at(0), Context::Rehab, &deviation, &[]);
        let dev = score.contribution(DEVIATION_SIGNAL).unwrap();
        assert_eq!(dev.status, ContributionStatus::Provisional);
        assert!((dev.confidence - 0.3).abs() < 1e-12);
        assert!((score.value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_duplicates_and_unweighted_signals() {
        let mut engine = engine();
        let signals = vec![
            SubSignal::new(FALL_RISK, "model_a", 0.2),
            SubSignal::new(FALL_RISK, "model_b", 0.9),
            SubSignal::new("heart_rate_risk", "hr_model", 0.7),
        ];
        let score = engine.fuse("S1", at(0), Context::Elderly, &measured(0.0), &signals);
        assert_eq!(score.contribution(FALL_RISK).unwrap().source, "model_b");
        let extra = score.contribution("heart_rate_risk").unwrap();
        assert_eq!(extra.weight, 0.0);
        assert_eq!(score.breakdown.len(), 4);
    }

    #[test]
    fn test_value_bounded_for_extreme_inputs() {
        let mut engine = engine();
        let mut seed = 3u64;
        for i in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let a = (seed >> 40) as f64 / (1u64 << 24) as f64;
            let b = 1.0 - a;
            let signals = vec![
                SubSignal::new(FALL_RISK, "m", a),
                SubSignal::new(ACTIVITY_RISK, "r", b),
                SubSignal::new("extra", "x", f64::NAN),
            ];
            let z = (i as f64 - 100.0) / 5.0;
            let score = engine.fuse("S1", at(i), Context::Elderly, &measured(z), &signals);
            assert!((0.0..=1.0).contains(&score.value));
            assert_eq!(score.version, i as u64 + 1);
        }
    }

    #[test]
    fn test_weight_table_validation() {
        for context in Context::ALL {
            assert!(WeightTable::defaults_for(context).validate(context).is_ok());
        }
        let bad = WeightTable::new([(DEVIATION_SIGNAL, 0.7), (FALL_RISK, 0.4)]);
        assert!(matches!(
            bad.validate(Context::Elderly),
            Err(ConfigError::InvalidWeights { .. })
        ));
        let negative = WeightTable::new([(DEVIATION_SIGNAL, 1.5), (FALL_RISK, -0.5)]);
        assert!(negative.validate(Context::Elderly).is_err());
    }

    #[test]
    fn test_ranking_tie_breaks() {
        let mut tables = HashMap::new();
        tables.insert(
            Context::Elderly,
            WeightTable::new([(DEVIATION_SIGNAL, 0.5), (FALL_RISK, 0.25), (ACTIVITY_RISK, 0.25)]),
        );
        let mut engine = FusionEngine::new(FusionConfig::default(), tables);
        let spiky = [SubSignal::new(FALL_RISK, "m", 1.0), SubSignal::new(ACTIVITY_RISK, "r", 0.0)];
        let flat = [SubSignal::new(FALL_RISK, "m", 0.5), SubSignal::new(ACTIVITY_RISK, "r", 0.5)];

        // All four fuse to 0.25
        let a = engine.fuse("A", at(0), Context::Elderly, &measured(0.0), &flat);
        let b = engine.fuse("B", at(0), Context::Elderly, &measured(0.0), &spiky);
        let c = engine.fuse("C", at(5), Context::Elderly, &measured(0.0), &flat);
        let d = engine.fuse("D", at(5), Context::Elderly, &measured(0.0), &flat);
        assert_eq!(a.value, b.value);

        let mut scores = vec![a, d, c, b];
        rank(&mut scores);
        let order: Vec<&str> = scores.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "D", "A"]);
    }

    fn row(name: &str, value: f64, weight: f64, status: ContributionStatus) -> Contribution {
        Contribution {
            name: name.to_string(),
            source: "test".to_string(),
            value,
            weight,
            confidence: 1.0,
            status,
            notes: Vec::new(),
        }
    }

    fn workplace(subject: &str, breakdown: Vec<Contribution>) -> CompositeScore {
        CompositeScore {
            subject_id: subject.to_string(),
            timestamp: at(0),
            context: Context::Workplace,
            value: 0.2,
            confidence: 1.0,
            version: 1,
            breakdown,
        }
    }

    #[test]
    fn test_ranking_ignores_placeholders_and_deviation() {
        let missing_ppe = workplace(
            "A",
            vec![
                row(DEVIATION_SIGNAL, 0.9, 0.2, ContributionStatus::Ok),
                row(
                    PPE_COMPLIANCE,
                    NEUTRAL_VALUE,
                    0.4,
                    ContributionStatus::Degraded {
                        reason: "no reading".to_string(),
                    },
                ),
                row(ZONE_SAFETY, 0.0, 0.4, ContributionStatus::Ok),
            ],
        );
        let real_signal = workplace(
            "B",
            vec![
                row(DEVIATION_SIGNAL, 0.0, 0.2, ContributionStatus::Ok),
                row(PPE_COMPLIANCE, 0.1, 0.4, ContributionStatus::Ok),
                row(ZONE_SAFETY, 0.4, 0.4, ContributionStatus::Ok),
            ],
        );
        assert_eq!(missing_ppe.worst_signal(), 0.0);
        assert_eq!(real_signal.worst_signal(), 0.4);

        let mut scores = vec![missing_ppe, real_signal];
        rank(&mut scores);
        assert_eq!(scores[0].subject_id, "B");
    }
}
