//! Runtime configuration for the dispatch framework.
//!
//! Spec.md §6 lists these as compile-time knobs (`MAX_ACTIVE`,
//! `STAGING_SIZE`, `POOL_*_SIZE/COUNT`, ...). Since this is a library
//! rather than a fixed embedded image, the knobs are exposed as
//! constructor parameters on [`Config`] instead, loadable from a TOML file
//! at the platform config directory the same way the teacher's
//! `Config::load`/`save` works.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One fixed-size block pool: `(block_size, block_count, margin)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSpec {
    pub block_size: usize,
    pub block_count: usize,
    pub margin: usize,
}

/// Knobs for the ISR relay (spec.md §6: `RELAY_*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    pub main_buffer_size: usize,
    pub overflow_buffer_size: usize,
    /// Wall-clock threshold above which the relay's adaptive batch sizer
    /// grows; below it, the batch shrinks. Mirrors the tick thresholds of
    /// `original_source/ports/rt-thread/qf_isr_relay.c`.
    #[serde(with = "humantime_serde")]
    pub batch_grow_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub batch_shrink_threshold: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            main_buffer_size: 32,
            overflow_buffer_size: 16,
            batch_grow_threshold: Duration::from_millis(5),
            batch_shrink_threshold: Duration::from_millis(1),
        }
    }
}

/// Top-level framework configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Maximum AO priority (spec.md `MAX_ACTIVE`).
    pub max_active: u8,
    /// Size of the pub/sub table (spec.md `MAX_PUB_SIG`).
    pub max_pub_sig: u32,
    /// Staging-ring capacity per priority level (spec.md `STAGING_SIZE`).
    pub staging_size: usize,
    /// Cap on `retry_count` before forced drop (spec.md `MAX_RETRY`).
    pub max_retry: u8,
    /// Ordered (ascending block size) pool specs.
    pub pools: Vec<PoolSpec>,
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_active: 63,
            max_pub_sig: 256,
            staging_size: 32,
            max_retry: 3,
            pools: vec![
                PoolSpec {
                    block_size: 16,
                    block_count: 64,
                    margin: 4,
                },
                PoolSpec {
                    block_size: 64,
                    block_count: 32,
                    margin: 2,
                },
                PoolSpec {
                    block_size: 256,
                    block_count: 8,
                    margin: 1,
                },
            ],
            relay: RelayConfig::default(),
        }
    }
}

impl Config {
    /// Loads config from TOML at the platform config dir, falling back to
    /// (and persisting) defaults if absent or unparsable.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            match toml::from_str::<Config>(&text) {
                Ok(cfg) => Ok(cfg),
                Err(_) => {
                    let default_config = Config::default();
                    default_config.save()?;
                    Ok(default_config)
                }
            }
        } else {
            let default_config = Config::default();
            default_config.save()?;
            Ok(default_config)
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, toml_str)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = ProjectDirs::from("org", "example", "ao-dispatch")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.staging_size, 32);
        assert_eq!(cfg.max_retry, 3);
        assert_eq!(cfg.relay.main_buffer_size, 32);
        assert_eq!(cfg.relay.overflow_buffer_size, 16);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
