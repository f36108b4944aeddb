use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balancer::BalancingStrategy;
use crate::pool::{AffinityHint, PoolConfig};
use crate::preload::PreloadConfig;
use crate::recovery::RecoveryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level JSON configuration for the fabric daemon. Every section has
/// serviceable defaults so a minimal file can be empty braces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub logging: LoggingConfig,
    pub thread_pool: ThreadPoolSection,
    pub security: SecuritySection,
    pub recovery: RecoverySection,
    pub preload: PreloadSection,
    pub load_balancer: BalancerSection,
    pub kernels: KernelsSection,
    pub cache: CacheSection,
}

impl FabricConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        let config: FabricConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thread_pool.validate()?;
        self.recovery.validate()?;
        self.preload.validate()?;
        self.load_balancer.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console_level: String,
    pub file_level: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: u64,
    pub max_files: u32,
    pub pattern: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console_level: "info".into(),
            file_level: "debug".into(),
            log_file: None,
            max_file_size: 5 * 1024 * 1024,
            max_files: 3,
            pattern: None,
        }
    }
}

/// `max_threads` accepts either a number or `"auto"` (hardware concurrency).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadCount {
    Auto(String),
    Count(usize),
}

impl Default for ThreadCount {
    fn default() -> Self {
        ThreadCount::Auto("auto".into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolSection {
    pub min_threads: usize,
    pub max_threads: ThreadCount,
    pub queue_size: usize,
    pub stack_size: usize,
    pub affinity: AffinityHint,
}

impl Default for ThreadPoolSection {
    fn default() -> Self {
        Self {
            min_threads: 2,
            max_threads: ThreadCount::default(),
            queue_size: 256,
            stack_size: 2 * 1024 * 1024,
            affinity: AffinityHint::None,
        }
    }
}

impl ThreadPoolSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ThreadCount::Auto(word) = &self.max_threads {
            if word != "auto" {
                return Err(ConfigError::Invalid {
                    field: "thread_pool.max_threads",
                    reason: format!("expected a count or \"auto\", got \"{word}\""),
                });
            }
        }
        self.resolve().validate().map_err(|err| ConfigError::Invalid {
            field: "thread_pool",
            reason: err.to_string(),
        })
    }

    pub fn resolve(&self) -> PoolConfig {
        let max_threads = match &self.max_threads {
            ThreadCount::Count(count) => *count,
            ThreadCount::Auto(_) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        };
        PoolConfig {
            min_threads: self.min_threads.min(max_threads.max(1)),
            max_threads: max_threads.max(1),
            queue_size: self.queue_size,
            stack_size: self.stack_size,
            affinity: self.affinity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub policy: String,
    pub audit_enabled: bool,
    pub encryption_enabled: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            policy: "standard".into(),
            audit_enabled: false,
            encryption_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_recovery_points: usize,
    pub checkpoint_interval_ms: Option<u64>,
    pub auto_recovery: bool,
    pub state_validation: bool,
    pub compression: bool,
    pub storage_path: PathBuf,
    pub retention_period_ms: Option<u64>,
    pub max_point_size: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_recovery_points: 10,
            checkpoint_interval_ms: None,
            auto_recovery: false,
            state_validation: true,
            compression: false,
            storage_path: PathBuf::from("recovery_points"),
            retention_period_ms: None,
            max_point_size: 0,
        }
    }
}

impl RecoverySection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve().validate().map_err(|err| ConfigError::Invalid {
            field: "recovery",
            reason: err.to_string(),
        })
    }

    pub fn resolve(&self) -> RecoveryConfig {
        RecoveryConfig {
            max_recovery_points: self.max_recovery_points,
            checkpoint_interval: self.checkpoint_interval_ms.map(Duration::from_millis),
            auto_recovery: self.auto_recovery,
            state_validation: self.state_validation,
            compression: self.compression,
            storage_path: self.storage_path.clone(),
            retention_period: self.retention_period_ms.map(Duration::from_millis),
            max_point_size: self.max_point_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadSection {
    pub max_queue_size: usize,
    pub max_concurrent_tasks: usize,
    pub prediction_threshold: f64,
    pub adaptive_prediction: bool,
    pub metrics_collection: bool,
}

impl Default for PreloadSection {
    fn default() -> Self {
        let defaults = PreloadConfig::default();
        Self {
            max_queue_size: defaults.max_queue_size,
            max_concurrent_tasks: defaults.max_concurrent_tasks,
            prediction_threshold: defaults.prediction_threshold,
            adaptive_prediction: defaults.adaptive_prediction,
            metrics_collection: defaults.metrics_collection,
        }
    }
}

impl PreloadSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve().validate().map_err(|err| ConfigError::Invalid {
            field: "preload",
            reason: err.to_string(),
        })
    }

    pub fn resolve(&self) -> PreloadConfig {
        PreloadConfig {
            max_queue_size: self.max_queue_size,
            max_concurrent_tasks: self.max_concurrent_tasks,
            prediction_threshold: self.prediction_threshold,
            adaptive_prediction: self.adaptive_prediction,
            metrics_collection: self.metrics_collection,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceWeightsSection {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub energy: f64,
}

impl Default for ResourceWeightsSection {
    fn default() -> Self {
        Self {
            cpu: 0.3,
            memory: 0.25,
            network: 0.25,
            energy: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThresholdsSection {
    pub resource: f64,
    pub workload: f64,
}

impl Default for AdaptiveThresholdsSection {
    fn default() -> Self {
        Self {
            resource: 0.8,
            workload: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSection {
    pub strategy: String,
    pub resource_weights: ResourceWeightsSection,
    pub adaptive_thresholds: AdaptiveThresholdsSection,
}

impl Default for BalancerSection {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::HybridAdaptive.as_str().into(),
            resource_weights: ResourceWeightsSection::default(),
            adaptive_thresholds: AdaptiveThresholdsSection::default(),
        }
    }
}

impl BalancerSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Unknown strategy names are tolerated at runtime (fallback to
        // hybrid_adaptive with a warning) but thresholds must be sane.
        for (field, value) in [
            ("load_balancer.adaptive_thresholds.resource", self.adaptive_thresholds.resource),
            ("load_balancer.adaptive_thresholds.workload", self.adaptive_thresholds.workload),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside [0, 1]"),
                });
            }
        }
        let weights = &self.resource_weights;
        if weights.cpu < 0.0 || weights.memory < 0.0 || weights.network < 0.0 || weights.energy < 0.0
        {
            return Err(ConfigError::Invalid {
                field: "load_balancer.resource_weights",
                reason: "weights must be non-negative".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelGroup {
    pub count: usize,
    pub id_prefix: String,
}

impl Default for KernelGroup {
    fn default() -> Self {
        Self {
            count: 0,
            id_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelsSection {
    pub core: KernelGroup,
    pub micro: KernelGroup,
    pub orchestration: KernelGroup,
}

impl Default for KernelsSection {
    fn default() -> Self {
        Self {
            core: KernelGroup {
                count: 2,
                id_prefix: "core".into(),
            },
            micro: KernelGroup {
                count: 1,
                id_prefix: "micro".into(),
            },
            orchestration: KernelGroup {
                count: 0,
                id_prefix: "orch".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicCacheSection {
    pub initial_size: usize,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub eviction_policy: String,
}

impl Default for DynamicCacheSection {
    fn default() -> Self {
        Self {
            initial_size: 128,
            max_size: 4096,
            ttl_ms: 0,
            eviction_policy: "lru".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub dynamic: DynamicCacheSection,
}

impl CacheSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dynamic.eviction_policy != "lru" {
            return Err(ConfigError::Invalid {
                field: "cache.dynamic.eviction_policy",
                reason: format!("unsupported policy \"{}\"", self.dynamic.eviction_policy),
            });
        }
        if self.dynamic.initial_size == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.dynamic.initial_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.dynamic.max_size < self.dynamic.initial_size {
            return Err(ConfigError::Invalid {
                field: "cache.dynamic.max_size",
                reason: "must be >= initial_size".into(),
            });
        }
        Ok(())
    }
}
