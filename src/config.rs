//! Configuration for the motion risk engine.
//!
//! Every policy knob (weights, thresholds, baseline window, queue sizes) is
//! supplied here and checked by [`Config::validate`] before the engine
//! starts. An invalid policy is fatal.

use crate::core::baseline::BaselineConfig;
use crate::core::classify::Context;
use crate::core::escalation::Thresholds;
use crate::core::fusion::{FusionConfig, WeightTable};
use crate::core::normalize::NormalizerConfig;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory name used under the platform config and data dirs.
const APP_DIR: &str = "motion-risk-engine";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub baseline: BaselineConfig,
    pub normalizer: NormalizerConfig,
    pub fusion: FusionConfig,

    /// Weight table and thresholds per context
    pub contexts: BTreeMap<Context, ContextPolicy>,

    /// Known subjects keyed by id
    pub registry: BTreeMap<String, SubjectProfile>,

    pub sink: SinkConfig,
    pub engine: EngineConfig,

    /// IANA timezone used for daily activity summaries
    pub timezone: String,

    /// Path for storing engine statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            baseline: BaselineConfig::default(),
            normalizer: NormalizerConfig::default(),
            fusion: FusionConfig::default(),
            contexts: Context::ALL
                .into_iter()
                .map(|c| (c, ContextPolicy::defaults_for(c)))
                .collect(),
            registry: BTreeMap::new(),
            sink: SinkConfig::default(),
            engine: EngineConfig::default(),
            timezone: "UTC".to_string(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config = serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        if let Some(dir) = &self.sink.store_dir {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Check the whole policy. Any error here must stop startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for context in Context::ALL {
            let policy = self.contexts.get(&context).ok_or(ConfigError::MissingContext(context))?;
            policy.thresholds.validate(context)?;
            policy.weights.validate(context)?;
        }

        let b = &self.baseline;
        if b.window.is_zero() {
            return Err(invalid("baseline.window", "must be greater than zero"));
        }
        if b.bucket_count == 0 {
            return Err(invalid("baseline.bucket_count", "must be at least 1"));
        }
        if b.min_samples == 0 {
            return Err(invalid("baseline.min_samples", "must be at least 1"));
        }
        if !(b.max_z.is_finite() && b.max_z > 0.0) {
            return Err(invalid("baseline.max_z", "must be a positive number"));
        }
        if !(b.min_std.is_finite() && b.min_std > 0.0) {
            return Err(invalid("baseline.min_std", "must be a positive number"));
        }

        let alpha = self.normalizer.smoothing_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(invalid("normalizer.smoothing_alpha", "must be in (0, 1]"));
        }

        self.fusion.validate()?;

        if self.engine.workers == 0 {
            return Err(invalid("engine.workers", "must be at least 1"));
        }
        if self.engine.shard_capacity == 0 {
            return Err(invalid("engine.shard_capacity", "must be at least 1"));
        }
        if self.sink.queue_capacity == 0 {
            return Err(invalid("sink.queue_capacity", "must be at least 1"));
        }
        if self.sink.retry_base_ms == 0 || self.sink.retry_max_ms < self.sink.retry_base_ms {
            return Err(invalid("sink.retry_base_ms", "need 0 < retry_base_ms <= retry_max_ms"));
        }

        self.tz()?;
        Ok(())
    }

    /// Parsed timezone for daily summaries.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| invalid("timezone", &format!("unknown timezone {}", self.timezone)))
    }

    pub fn thresholds(&self) -> HashMap<Context, Thresholds> {
        self.contexts.iter().map(|(c, p)| (*c, p.thresholds)).collect()
    }

    pub fn weight_tables(&self) -> HashMap<Context, WeightTable> {
        self.contexts.iter().map(|(c, p)| (*c, p.weights.clone())).collect()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Fusion weights and escalation thresholds for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPolicy {
    pub weights: WeightTable,
    pub thresholds: Thresholds,
}

impl ContextPolicy {
    pub fn defaults_for(context: Context) -> Self {
        Self {
            weights: WeightTable::defaults_for(context),
            thresholds: Thresholds::defaults_for(context),
        }
    }
}

/// Registry entry for a known subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectProfile {
    /// Role the subject is enrolled under
    pub role: Option<Context>,
}

/// Sink write-behind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Bounded queue length before non-alert records are dropped
    pub queue_capacity: usize,
    /// First retry delay after a failed write
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay
    pub retry_max_ms: u64,
    /// How long shutdown keeps draining the queue
    #[serde(with = "duration_serde")]
    pub drain_timeout: Duration,
    /// Directory for the file-backed store
    pub store_dir: Option<PathBuf>,
    /// Remote document store, used instead of `store_dir` when set
    pub remote: Option<RemoteStoreConfig>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retry_base_ms: 100,
            retry_max_ms: 10_000,
            drain_timeout: Duration::from_secs(5),
            store_dir: None,
            remote: None,
        }
    }
}

/// Remote document store endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    pub base_url: String,
    /// Bearer token
    pub api_key: Option<String>,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker shards
    pub workers: usize,
    /// Pending samples per shard
    pub shard_capacity: usize,
    /// Time a single scorer may take before it is logged
    pub scorer_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shard_capacity: 1024,
            scorer_budget_ms: 50,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("invalid threshold config for {context}: {reason}")]
    InvalidThreshold { context: Context, reason: String },
    #[error("invalid weight table for {context}: {reason}")]
    InvalidWeights { context: Context, reason: String },
    #[error("no policy configured for context {0}")]
    MissingContext(Context),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Serde support for Duration as whole seconds.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
