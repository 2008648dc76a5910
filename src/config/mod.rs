//! Configuration management for modhost
//!
//! Handles configuration loading (JSON or TOML), defaults, and environment
//! overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::utils::env::{env_int, env_opt};

pub const MODULES_DIR_ENV: &str = "MODHOST_MODULES_DIR";
pub const DATA_DIR_ENV: &str = "MODHOST_DATA_DIR";
pub const LOAD_TIMEOUT_ENV: &str = "MODHOST_LOAD_TIMEOUT_SECS";

/// Module system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Directory scanned for module directories
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Root for per-module data directories
    #[serde(default = "default_modules_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds a module gets to report its load
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// Milliseconds a worker gets to exit after being asked to unload
    #[serde(default = "default_unload_grace_ms")]
    pub unload_grace_ms: u64,

    /// List of enabled modules (empty = auto-discover all)
    #[serde(default)]
    pub enabled_modules: Vec<String>,

    /// Module-specific configuration overrides
    #[serde(default)]
    pub module_configs: HashMap<String, HashMap<String, String>>,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_modules_data_dir() -> PathBuf {
    PathBuf::from("data/modules")
}

fn default_load_timeout_secs() -> u64 {
    30
}

fn default_unload_grace_ms() -> u64 {
    5_000
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            data_dir: default_modules_data_dir(),
            load_timeout_secs: default_load_timeout_secs(),
            unload_grace_ms: default_unload_grace_ms(),
            enabled_modules: Vec::new(),
            module_configs: HashMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"modhost=debug"`; `RUST_LOG` wins
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub modules: ModuleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Load configuration from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => anyhow::bail!("unsupported config format: {:?}", other),
        };
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `MODHOST_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_opt(MODULES_DIR_ENV) {
            self.modules.modules_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_opt(DATA_DIR_ENV) {
            self.modules.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_int::<u64>(LOAD_TIMEOUT_ENV) {
            self.modules.load_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.modules.load_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "load_timeout_secs must be greater than 0"
            ));
        }
        Ok(())
    }
}
