//! Configuration types for swarm runs and the distributed exchange.

use serde::{Deserialize, Serialize};

fn default_record_fields() -> Vec<String> {
    vec!["states".into(), "actions".into(), "dt".into()]
}

/// Scoring and balancing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkersConfig {
    /// Exponent on the normalized reward; biases toward exploitation.
    pub reward_scale: f32,
    /// Exponent on the normalized diversity; biases toward exploration.
    pub distance_scale: f32,
    /// Guard value for near-zero denominators.
    pub eps: f32,
    /// Whether lower rewards are better.
    pub minimize: bool,
    /// Seed for companion draws and clone decisions. Random when unset.
    pub seed: Option<u64>,
}

impl Default for WalkersConfig {
    fn default() -> Self {
        Self {
            reward_scale: 1.0,
            distance_scale: 1.0,
            eps: 1e-8,
            minimize: false,
            seed: None,
        }
    }
}

/// History recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Whether to record accepted transitions at all.
    pub enabled: bool,
    /// Whether to drop branches no live walker traces through.
    pub prune: bool,
    /// Field names recorded with each transition.
    pub record_fields: Vec<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prune: true,
            record_fields: default_record_fields(),
        }
    }
}

/// Top-level configuration of one swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Number of walkers; fixed for the lifetime of a run.
    pub n_walkers: usize,
    /// Epoch budget before the run is exhausted.
    pub max_epochs: usize,
    /// Stop early once the best reward crosses this value.
    pub reward_limit: Option<f32>,
    /// Scoring and balancing parameters.
    pub walkers: WalkersConfig,
    /// History recording parameters.
    pub tree: TreeConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            n_walkers: 32,
            max_epochs: 100,
            reward_limit: None,
            walkers: WalkersConfig::default(),
            tree: TreeConfig::default(),
        }
    }
}

impl SwarmConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_walkers == 0 {
            return Err(ConfigError::InvalidWalkerCount);
        }
        if self.max_epochs == 0 {
            return Err(ConfigError::InvalidEpochBudget);
        }
        for (name, value) in [
            ("reward_scale", self.walkers.reward_scale),
            ("distance_scale", self.walkers.distance_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidScale(format!("{name} = {value}")));
            }
        }
        if !(self.walkers.eps > 0.0) {
            return Err(ConfigError::InvalidScale(format!(
                "eps = {}",
                self.walkers.eps
            )));
        }
        Ok(())
    }
}

/// Import/export behavior of one swarm in a distributed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Walkers accepted from the server per exchange step.
    pub n_import: usize,
    /// Walkers handed to the server per exchange step.
    pub n_export: usize,
    /// Offer the imported best walker to the local best tracker.
    pub import_best: bool,
    /// Force the local best walker into every export batch.
    pub export_best: bool,
    /// Local epochs run per exchange step.
    pub epochs_per_exchange: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            n_import: 2,
            n_export: 2,
            import_best: true,
            export_best: true,
            epochs_per_exchange: 1,
        }
    }
}

impl ExchangeConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_export == 0 {
            return Err(ConfigError::InvalidExchange(
                "n_export must be non-zero".into(),
            ));
        }
        if self.epochs_per_exchange == 0 {
            return Err(ConfigError::InvalidExchange(
                "epochs_per_exchange must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parameter-server buffer behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of buffered export batches.
    pub max_len: usize,
    /// Walkers sampled into each returned import batch.
    pub n_import: usize,
    /// Whether lower rewards are better.
    pub minimize: bool,
    /// Stamp the global best into every returned import batch.
    pub add_global_best: bool,
    /// Seed for import sampling. Random when unset.
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_len: 20,
            n_import: 2,
            minimize: false,
            add_global_best: true,
            seed: None,
        }
    }
}

impl ServerConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_len == 0 {
            return Err(ConfigError::InvalidServer("max_len must be non-zero".into()));
        }
        if self.n_import == 0 {
            return Err(ConfigError::InvalidServer(
                "n_import must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of a distributed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Number of independently running swarms.
    pub n_swarms: usize,
    /// Exchange steps per swarm; the run completes after
    /// `max_iters * n_swarms` steps in total.
    pub max_iters: usize,
    /// Maximum number of export batches buffered by the server.
    pub max_len: usize,
    /// Stamp the global best into every import batch.
    pub add_global_best: bool,
    /// Per-swarm import/export behavior.
    pub exchange: ExchangeConfig,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            n_swarms: 2,
            max_iters: 10,
            max_len: 20,
            add_global_best: true,
            exchange: ExchangeConfig::default(),
        }
    }
}

impl DistributedConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_swarms == 0 {
            return Err(ConfigError::InvalidDistributed(
                "n_swarms must be non-zero".into(),
            ));
        }
        if self.max_iters == 0 {
            return Err(ConfigError::InvalidDistributed(
                "max_iters must be non-zero".into(),
            ));
        }
        if self.max_len == 0 {
            return Err(ConfigError::InvalidDistributed(
                "max_len must be non-zero".into(),
            ));
        }
        self.exchange.validate()
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Walker count must be non-zero")]
    InvalidWalkerCount,
    #[error("Epoch budget must be non-zero")]
    InvalidEpochBudget,
    #[error("Invalid scoring parameter: {0}")]
    InvalidScale(String),
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("Invalid model parameter: {0}")]
    InvalidModel(String),
    #[error("Invalid exchange configuration: {0}")]
    InvalidExchange(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServer(String),
    #[error("Invalid distributed configuration: {0}")]
    InvalidDistributed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SwarmConfig::default().validate().is_ok());
        assert!(ExchangeConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
        assert!(DistributedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_swarm_configs() {
        let config = SwarmConfig {
            n_walkers: 0,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWalkerCount)
        ));

        let config = SwarmConfig {
            max_epochs: 0,
            ..SwarmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEpochBudget)
        ));

        let config = SwarmConfig {
            walkers: WalkersConfig {
                reward_scale: -1.0,
                ..WalkersConfig::default()
            },
            ..SwarmConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidScale(_))));
    }

    #[test]
    fn test_invalid_distributed_configs() {
        let config = DistributedConfig {
            n_swarms: 0,
            ..DistributedConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DistributedConfig {
            exchange: ExchangeConfig {
                n_export: 0,
                ..ExchangeConfig::default()
            },
            ..DistributedConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_roundtrip() {
        let config: SwarmConfig = serde_json::from_str(r#"{"n_walkers": 8}"#).unwrap();
        assert_eq!(config.n_walkers, 8);
        assert_eq!(config.max_epochs, 100);

        let text = serde_json::to_string(&config).unwrap();
        let back: SwarmConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.n_walkers, 8);
    }
}
