//! Configuration management for tilesim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (TILESIM_SCHEDULER, TILESIM_WORKERS, TILESIM_SUSPEND)
//! 2. Project-local config file (`./tilesim.toml`)
//! 3. User config file (`~/.config/tilesim/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tilesim.toml
//!
//! # round-robin, shared-work or work-stealing
//! scheduler = "work-stealing"
//! worker_threads = 4
//!
//! columns = 4
//! rows = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::device::dma::DEFAULT_COMMAND_DEPTH;
use crate::device::router::{DEFAULT_QUEUE_DEPTH, MAX_QUEUE_DEPTH, MIN_QUEUE_DEPTH};
use crate::device::LayoutParams;
use crate::pool::{PoolConfig, SchedulerPolicy};

/// A configured value the runtime cannot work with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} = {value} is outside {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
}

/// Check a router port FIFO depth.
pub fn check_router_depth(depth: usize) -> Result<usize, ConfigError> {
    check_range("router_queue_depth", depth, MIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH)
}

/// Check a DMA command queue depth. Any non-zero depth works.
pub fn check_dma_depth(depth: usize) -> Result<usize, ConfigError> {
    check_range("dma_queue_depth", depth, 1, usize::MAX)
}

fn check_range(name: &'static str, value: usize, min: usize, max: usize) -> Result<usize, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// tilesim configuration. Unset fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Task pool scheduling policy.
    pub scheduler: Option<SchedulerPolicy>,

    /// Worker threads. Defaults to the available parallelism.
    pub worker_threads: Option<usize>,

    /// Idle workers sleep instead of spinning.
    pub suspend_on_idle: Option<bool>,

    /// Array width.
    pub columns: Option<u8>,

    /// Array height.
    pub rows: Option<u8>,

    /// FIFO depth of every router port.
    pub router_queue_depth: Option<usize>,

    /// Command queue depth of every DMA engine.
    pub dma_queue_depth: Option<usize>,

    /// Bytes of tile-shared memory per tile.
    pub tile_memory_size: Option<u32>,

    /// Bytes reserved for the kernel closure image.
    pub closure_size: Option<u32>,

    /// Offset where global variables start.
    pub reserved_memory: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tilesim.toml`
    /// 3. User config `~/.config/tilesim/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();
        config.drop_invalid();

        config
    }

    /// Check every value that has a restricted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(depth) = self.router_queue_depth {
            check_router_depth(depth)?;
        }
        if let Some(depth) = self.dma_queue_depth {
            check_dma_depth(depth)?;
        }
        Ok(())
    }

    /// Reset out-of-range values to their defaults.
    fn drop_invalid(&mut self) {
        if let Some(Err(e)) = self.router_queue_depth.map(check_router_depth) {
            log::warn!("Ignoring {}, using {}", e, DEFAULT_QUEUE_DEPTH);
            self.router_queue_depth = None;
        }
        if let Some(Err(e)) = self.dma_queue_depth.map(check_dma_depth) {
            log::warn!("Ignoring {}, using {}", e, DEFAULT_COMMAND_DEPTH);
            self.dma_queue_depth = None;
        }
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    pub fn scheduler(&self) -> SchedulerPolicy {
        self.scheduler.unwrap_or_default()
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| PoolConfig::default().threads)
    }

    pub fn suspend_on_idle(&self) -> bool {
        self.suspend_on_idle.unwrap_or(true)
    }

    pub fn columns(&self) -> u8 {
        self.columns.unwrap_or(2)
    }

    pub fn rows(&self) -> u8 {
        self.rows.unwrap_or(2)
    }

    pub fn router_queue_depth(&self) -> usize {
        self.router_queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH)
    }

    pub fn dma_queue_depth(&self) -> usize {
        self.dma_queue_depth.unwrap_or(DEFAULT_COMMAND_DEPTH)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.scheduler(), self.worker_threads())
            .with_suspend(self.suspend_on_idle())
    }

    pub fn layout_params(&self) -> LayoutParams {
        let defaults = LayoutParams::default();
        LayoutParams {
            tile_size: defaults.tile_size,
            tile_memory_size: self.tile_memory_size.unwrap_or(defaults.tile_memory_size),
            closure_size: self.closure_size.unwrap_or(defaults.closure_size),
            reserved_memory: self.reserved_memory.unwrap_or(defaults.reserved_memory),
        }
    }

    /// Load user configuration from ~/.config/tilesim/config.toml
    fn load_user_config() -> Option<Self> {
        Self::load_from_file(&Self::user_config_path()?)
    }

    /// Load project-local configuration from ./tilesim.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tilesim.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tilesim.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            scheduler,
            worker_threads,
            suspend_on_idle,
            columns,
            rows,
            router_queue_depth,
            dma_queue_depth,
            tile_memory_size,
            closure_size,
            reserved_memory
        );
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TILESIM_SCHEDULER") {
            match value.parse() {
                Ok(policy) => {
                    log::info!("Using TILESIM_SCHEDULER from environment: {}", policy);
                    self.scheduler = Some(policy);
                }
                Err(e) => log::warn!("Ignoring TILESIM_SCHEDULER: {}", e),
            }
        }
        if let Ok(value) = std::env::var("TILESIM_WORKERS") {
            match value.parse() {
                Ok(n) => {
                    log::info!("Using TILESIM_WORKERS from environment: {}", n);
                    self.worker_threads = Some(n);
                }
                Err(e) => log::warn!("Ignoring TILESIM_WORKERS={}: {}", value, e),
            }
        }
        if let Ok(value) = std::env::var("TILESIM_SUSPEND") {
            match parse_flag(&value) {
                Some(flag) => self.suspend_on_idle = Some(flag),
                None => log::warn!("Ignoring TILESIM_SUSPEND={}: expected a boolean", value),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tilesim").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tilesim configuration
# Place this file at ~/.config/tilesim/config.toml or ./tilesim.toml

# Scheduling policy: round-robin, shared-work or work-stealing
scheduler = "work-stealing"

# Worker threads (defaults to the number of CPUs)
# worker_threads = 4

# Sleep idle workers instead of spinning
# suspend_on_idle = true

# Array size
columns = 2
rows = 2

# Queue depths
# router_queue_depth = 4    (4 to 16)
# dma_queue_depth = 8

# Per-tile memory map
# tile_memory_size = 4096
# closure_size = 256
# reserved_memory = 31744
"#
        .to_string()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler(), SchedulerPolicy::WorkStealing);
        assert_eq!(config.columns(), 2);
        assert_eq!(config.router_queue_depth(), DEFAULT_QUEUE_DEPTH);
        assert!(config.suspend_on_idle());
        assert_eq!(config.layout_params(), LayoutParams::default());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            scheduler: Some(SchedulerPolicy::RoundRobin),
            columns: Some(4),
            rows: Some(1),
            ..Default::default()
        };

        let overlay = Config {
            scheduler: Some(SchedulerPolicy::SharedWork),
            rows: None,
            worker_threads: Some(3),
            ..Default::default()
        };

        base.merge(overlay);

        assert_eq!(base.scheduler, Some(SchedulerPolicy::SharedWork));
        assert_eq!(base.columns, Some(4));
        assert_eq!(base.rows, Some(1));
        assert_eq!(base.worker_threads, Some(3));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.scheduler, Some(SchedulerPolicy::WorkStealing));
        assert_eq!(config.columns, Some(2));
    }

    #[test]
    fn test_layout_overrides() {
        let config: Config = toml::from_str("tile_memory_size = 512\nclosure_size = 64").unwrap();
        let params = config.layout_params();
        assert_eq!(params.tile_memory_size, 512);
        assert_eq!(params.closure_size, 64);
        assert_eq!(params.reserved_memory, LayoutParams::default().reserved_memory);
    }

    #[test]
    fn test_queue_depths_are_checked() {
        let config: Config = toml::from_str("router_queue_depth = 0").unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                name: "router_queue_depth",
                value: 0,
                min: MIN_QUEUE_DEPTH,
                max: MAX_QUEUE_DEPTH,
            })
        );

        let config: Config = toml::from_str("router_queue_depth = 17").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("router_queue_depth = 16\ndma_queue_depth = 1").unwrap();
        assert_eq!(config.validate(), Ok(()));

        let mut config: Config = toml::from_str("router_queue_depth = 2\ndma_queue_depth = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { name: "router_queue_depth", .. })
        ));
        config.drop_invalid();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.router_queue_depth(), DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.dma_queue_depth(), DEFAULT_COMMAND_DEPTH);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
