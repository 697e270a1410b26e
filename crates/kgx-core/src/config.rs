//! KGX Configuration Management
//!
//! Handles configuration from TOML files and environment variables with
//! sensible defaults for development. `validate()` is the fatal gate the
//! engine runs before any work starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sentinel value that disables the cluster-persistence floor
pub const PERSISTENCE_DISABLED: f32 = -1.0;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent worker loops
    pub num_workers: usize,

    /// Total pipeline attempts per batch before the worker gives up
    pub max_retries: usize,

    /// Fixed back-off between pipeline attempts, in milliseconds
    pub retry_interval_ms: u64,

    /// Batches processed between throttle sleeps
    pub message_throttle_limit: usize,

    /// Throttle sleep bounding the downstream publish rate, in milliseconds
    pub message_throttle_delay_ms: u64,

    /// State queue capacity and the listener's safety-valve limit
    pub max_state_transitions: usize,

    /// Whether the cluster/filter stages run at all
    pub enable_filtering: bool,

    /// Entity-confidence floor applied by the score filter
    pub score_threshold: f32,

    /// Pair-attention floor applied by the score filter
    pub attention_score_threshold: f32,

    /// Cosine-similarity floor for treating two embeddings as identical
    pub similarity_threshold: f32,

    /// Clustering parameters
    pub cluster: ClusterConfig,

    /// Fixed entity / predicate constraint search
    pub constraint: ConstraintConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            max_retries: 3,
            retry_interval_ms: 500,
            message_throttle_limit: 1,
            message_throttle_delay_ms: 50,
            max_state_transitions: 1000,
            enable_filtering: true,
            score_threshold: 0.5,
            attention_score_threshold: 0.1,
            similarity_threshold: 0.999,
            cluster: ClusterConfig::default(),
            constraint: ConstraintConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Apply environment-variable overrides (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        if let Ok(workers) = std::env::var("KGX_NUM_WORKERS") {
            self.num_workers = workers.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KGX_NUM_WORKERS".to_string(),
                value: workers,
            })?;
        }
        if let Ok(retries) = std::env::var("KGX_MAX_RETRIES") {
            self.max_retries = retries.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KGX_MAX_RETRIES".to_string(),
                value: retries,
            })?;
        }
        if let Ok(level) = std::env::var("KGX_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Retry back-off as a duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Throttle sleep as a duration
    pub fn message_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.message_throttle_delay_ms)
    }

    /// Validate the configuration.
    ///
    /// Errors here are fatal: the engine refuses to start work on a
    /// misconfigured instance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "num_workers".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_retries".to_string(),
                value: "0".to_string(),
            });
        }
        if self.message_throttle_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "message_throttle_limit".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_state_transitions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_state_transitions".to_string(),
                value: "0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "score_threshold".to_string(),
                value: self.score_threshold.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.attention_score_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "attention_score_threshold".to_string(),
                value: self.attention_score_threshold.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "similarity_threshold".to_string(),
                value: self.similarity_threshold.to_string(),
            });
        }

        self.cluster.validate()?;
        self.constraint.validate()?;

        Ok(())
    }
}

/// Density clustering parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Minimum cluster size accepted by the condensed hierarchy
    pub min_cluster_size: usize,

    /// Neighbor count used for core distances
    pub min_samples: usize,

    /// Persistence floor for cluster survival; `-1.0` disables the filter
    pub cluster_persistence_threshold: f32,

    /// Projected embedding dimensionality
    pub projection_dim: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            min_samples: 2,
            cluster_persistence_threshold: PERSISTENCE_DISABLED,
            projection_dim: 8,
        }
    }
}

impl ClusterConfig {
    /// Whether the persistence floor is active
    pub fn persistence_filter_enabled(&self) -> bool {
        self.cluster_persistence_threshold >= 0.0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_cluster_size < 2 {
            return Err(ConfigError::InvalidValue {
                key: "cluster.min_cluster_size".to_string(),
                value: self.min_cluster_size.to_string(),
            });
        }
        if self.min_samples == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cluster.min_samples".to_string(),
                value: "0".to_string(),
            });
        }
        if self.projection_dim == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cluster.projection_dim".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Fixed entity / fixed predicate search configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    /// Entities the search is confined to
    pub fixed_entities: Vec<String>,

    /// Example entities used to seed type inference for fixed entities
    pub sample_entities: Vec<String>,

    /// Predicates the search is confined to (synonym-expanded at match time)
    pub fixed_relationships: Vec<String>,

    /// Example predicates used to seed type inference for fixed predicates
    pub sample_relationships: Vec<String>,

    /// Whether the constraint extractors replace the general recognizer
    pub is_confined_search: bool,
}

impl ConstraintConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.is_confined_search && self.fixed_entities.is_empty() {
            return Err(ConfigError::MissingRequired(
                "constraint.fixed_entities (required when is_confined_search is set)".to_string(),
            ));
        }
        for entity in &self.fixed_entities {
            if entity.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "constraint.fixed_entities".to_string(),
                    value: entity.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_workers, 2);
        assert!(!config.cluster.persistence_filter_enabled());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_range_checked() {
        let config = EngineConfig {
            score_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confined_search_requires_entities() {
        let config = EngineConfig {
            constraint: ConstraintConfig {
                is_confined_search: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_persistence_sentinel() {
        let cluster = ClusterConfig {
            cluster_persistence_threshold: PERSISTENCE_DISABLED,
            ..Default::default()
        };
        assert!(!cluster.persistence_filter_enabled());

        let cluster = ClusterConfig {
            cluster_persistence_threshold: 0.2,
            ..Default::default()
        };
        assert!(cluster.persistence_filter_enabled());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_src = r#"
            num_workers = 4
            score_threshold = 0.7

            [cluster]
            min_cluster_size = 5
            min_samples = 3

            [constraint]
            fixed_entities = ["Acme Corp"]
            is_confined_search = true
        "#;

        let config: EngineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.cluster.min_cluster_size, 5);
        assert!(config.constraint.is_confined_search);
        // Unspecified fields keep defaults
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }
}
