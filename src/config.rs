use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::vm_type::{CloudConfig, Quantity, VmType};

/// A duration expressed the way the operator writes it in YAML: a handful of
/// named components rather than a single unit, e.g. `{ hours: 2 }` or
/// `{ minutes: 10, seconds: 30 }`. Missing components default to zero.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct DurationSpec {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: i64,
}

impl DurationSpec {
    pub fn to_duration(self) -> Duration {
        Duration::days(self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes)
            + Duration::seconds(self.seconds)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct VmTypeConfig {
    pub tags: Vec<String>,
    pub config: CloudConfig,
    pub quantity: Quantity,
}

impl From<VmTypeConfig> for VmType {
    fn from(raw: VmTypeConfig) -> Self {
        VmType::new(raw.tags, raw.config, raw.quantity)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub github_organization: String,
    pub github_token: String,

    /// Name of the OpenStack cloud profile, resolved via `clouds.yaml`.
    pub cloud: String,

    pub redis_url: String,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,

    pub extra_runner_timer: DurationSpec,
    pub timeout_runner_timer: DurationSpec,

    pub runner_pool: Vec<VmTypeConfig>,
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("runner pool {index} ({tags:?}) has min ({min}) greater than max ({max})")]
    InvalidQuantity {
        index: usize,
        tags: Vec<String>,
        min: u32,
        max: u32,
    },

    #[error("runner pool {index} has no tags")]
    EmptyTags { index: usize },

    #[error("runner_pool must not be empty")]
    EmptyPool,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config"))
            .add_source(config::Environment::with_prefix("RUNNER_POOL").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runner_pool.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        for (index, pool) in self.runner_pool.iter().enumerate() {
            if pool.tags.is_empty() {
                return Err(ConfigError::EmptyTags { index });
            }
            if pool.quantity.min > pool.quantity.max {
                return Err(ConfigError::InvalidQuantity {
                    index,
                    tags: pool.tags.clone(),
                    min: pool.quantity.min,
                    max: pool.quantity.max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(tags: Vec<&str>, min: u32, max: u32) -> VmTypeConfig {
        VmTypeConfig {
            tags: tags.into_iter().map(String::from).collect(),
            config: CloudConfig {
                image: "img".into(),
                flavor: "flv".into(),
                network: "net".into(),
                key_name: "key".into(),
                runner_user: "runner".into(),
                runner_group: "runner".into(),
            },
            quantity: Quantity { min, max },
        }
    }

    fn base_config(pools: Vec<VmTypeConfig>) -> Config {
        Config {
            github_organization: "acme".into(),
            github_token: "tok".into(),
            cloud: "default".into(),
            redis_url: "redis://localhost".into(),
            tick_interval_secs: 30,
            http_bind_addr: "0.0.0.0:3000".into(),
            extra_runner_timer: DurationSpec {
                hours: 2,
                ..Default::default()
            },
            timeout_runner_timer: DurationSpec {
                minutes: 10,
                ..Default::default()
            },
            runner_pool: pools,
        }
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let cfg = base_config(vec![pool(vec!["small"], 5, 2)]);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidQuantity { .. })));
    }

    #[test]
    fn rejects_empty_pool_list() {
        let cfg = base_config(vec![]);
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyPool)));
    }

    #[test]
    fn rejects_untagged_pool() {
        let cfg = base_config(vec![pool(vec![], 0, 1)]);
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyTags { .. })));
    }

    #[test]
    fn accepts_well_formed_pools() {
        let cfg = base_config(vec![pool(vec!["small"], 1, 4), pool(vec!["large"], 0, 2)]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duration_spec_combines_components() {
        let spec = DurationSpec {
            days: 0,
            hours: 1,
            minutes: 30,
            seconds: 0,
        };
        assert_eq!(spec.to_duration(), Duration::minutes(90));
    }
}
