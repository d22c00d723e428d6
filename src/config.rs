//! Pool definition configuration.
//!
//! The CLI creates pools from a YAML definition file. Each entry names a
//! root subnet and its allocation bounds; the file-level hold-down period
//! applies to every pool in the store.

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use log::info;
use serde::{Deserialize, Serialize};

use crate::addr::IpSubnet;
use crate::pool::RootConfig;

/// Top-level configuration structure that mirrors the YAML definition file.
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Grace period before freed subnets become allocatable again
    /// (e.g. "1day", "12h").
    #[serde(default = "default_hold_down_period", with = "humantime_serde")]
    pub hold_down_period: Duration,
    /// Pool roots to create.
    pub pools: Vec<PoolDefinition>,
}

/// Definition of a single pool root.
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolDefinition {
    /// The address range this pool covers, e.g. "10.0.0.0/16".
    pub subnet: IpSubnet,
    /// (Optional) Human-readable pool label
    pub description: Option<String>,
    /// (Optional) Prefix length used when a request names none
    pub prefix_length_default: Option<u8>,
    /// (Optional) Coarsest allocatable prefix length (default: 24)
    pub prefix_length_minimum: Option<u8>,
    /// (Optional) Finest allocatable prefix length (default: 28)
    pub prefix_length_maximum: Option<u8>,
}

fn default_hold_down_period() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl PoolsConfig {
    /// Validate the definitions: bounds must be ordered, defaults must
    /// fall within them, and every size must fit inside the root subnet.
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(eyre!("configuration defines no pools"));
        }
        for pool in &self.pools {
            let config = pool.root_config(self.hold_down_period);
            let root_prefix = pool.subnet.prefix_length();
            let minimum = config.prefix_length_minimum.unwrap_or(root_prefix);
            let maximum = config
                .prefix_length_maximum
                .unwrap_or(pool.subnet.family().max_prefix_length());
            if minimum > maximum {
                return Err(eyre!(
                    "pool {}: minimum prefix length /{} exceeds maximum /{}",
                    pool.subnet,
                    minimum,
                    maximum
                ));
            }
            if minimum < root_prefix {
                return Err(eyre!(
                    "pool {}: minimum prefix length /{} is coarser than the pool itself",
                    pool.subnet,
                    minimum
                ));
            }
            if let Some(default) = config.prefix_length_default {
                if default < minimum || default > maximum {
                    return Err(eyre!(
                        "pool {}: default prefix length /{} is outside [/{}, /{}]",
                        pool.subnet,
                        default,
                        minimum,
                        maximum
                    ));
                }
            }
        }
        Ok(())
    }
}

impl PoolDefinition {
    /// Allocation bounds for the pool root, with the standard defaults
    /// filled in. The file-level hold-down period is recorded on every
    /// root so later invocations against the stored state honor it.
    pub fn root_config(&self, hold_down_period: Duration) -> RootConfig {
        let defaults = RootConfig::default();
        RootConfig {
            prefix_length_default: self.prefix_length_default,
            prefix_length_minimum: self
                .prefix_length_minimum
                .or(defaults.prefix_length_minimum),
            prefix_length_maximum: self
                .prefix_length_maximum
                .or(defaults.prefix_length_maximum),
            hold_down_period: Some(hold_down_period),
        }
    }
}

/// Load and validate a pool definition file.
pub fn load_config(config_path: &Path) -> Result<PoolsConfig> {
    info!("Loading pool definitions from: {:?}", config_path);

    let file = std::fs::File::open(config_path)
        .wrap_err_with(|| format!("failed to open '{}'", config_path.display()))?;
    let config: PoolsConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("failed to parse '{}'", config_path.display()))?;

    config.validate()?;
    info!("Loaded {} pool definitions", config.pools.len());

    Ok(config)
}
