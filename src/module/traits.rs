//! Module system traits and interfaces
//!
//! Defines the lifecycle trait that worker binaries implement, the context
//! they receive, and the error types shared by the host and its workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::module::bus::{AccessScope, BusError, MessageBus};
use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};

/// Module lifecycle state, driven by the registry
///
/// `Discovered → CheckingDependencies → Spawning → Loading → Loaded | Failed`,
/// with `Unloaded` once a loaded module has been stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleState {
    /// Known to the registry, not yet attempted
    #[default]
    Discovered,
    /// Declared dependencies are being checked
    CheckingDependencies,
    /// A worker process is being started
    Spawning,
    /// Worker is running the module's load hook
    Loading,
    /// Module reported a successful load
    Loaded,
    /// Load failed; see the descriptor's `load_error`
    Failed,
    /// Module was loaded and has been stopped
    Unloaded,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Discovered => "discovered",
            ModuleState::CheckingDependencies => "checking-dependencies",
            ModuleState::Spawning => "spawning",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::Failed => "failed",
            ModuleState::Unloaded => "unloaded",
        };
        f.write_str(name)
    }
}

/// Why a module is not loaded
///
/// Persisted on the descriptor as `loadError`; the `kind` tag keeps it
/// machine-readable for collaborators that surface it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LoadError {
    #[error("missing dependency: {}", .dependency.as_deref().unwrap_or("unresolved"))]
    DependencyMissing { dependency: Option<String> },

    #[error("dependency {dependency} unmet: {reason}")]
    DependencyUnmet { dependency: String, reason: String },

    #[error("dependency {dependency} failed to load")]
    DependencyFailed { dependency: String },

    #[error("worker exited before completing load (exit code {code:?})")]
    WorkerCrash { code: Option<i32> },

    #[error("module did not settle within {timeout_ms}ms")]
    LoadTimeout { timeout_ms: u64 },

    #[error("{name}: {message}")]
    ModuleFailure { name: String, message: String },

    #[error("failed to start worker: {message}")]
    SpawnFailed { message: String },
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("IPC communication error: {0}")]
    IpcError(String),

    #[error("Module initialization failed: {0}")]
    InitializationError(String),

    #[error("Module operation failed: {0}")]
    OperationError(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Module worker already running: {0}")]
    AlreadyRunning(String),

    #[error("Module not loaded: {0}")]
    NotLoaded(String),

    #[error("Invalid module manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid worker bootstrap: {0}")]
    InvalidBootstrap(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ModuleError {
    /// Short variant name, used when the error is reported across the bus
    pub fn kind(&self) -> &'static str {
        match self {
            ModuleError::IpcError(_) => "IpcError",
            ModuleError::InitializationError(_) => "InitializationError",
            ModuleError::OperationError(_) => "OperationError",
            ModuleError::ModuleNotFound(_) => "ModuleNotFound",
            ModuleError::AlreadyInstalled(_) => "AlreadyInstalled",
            ModuleError::AlreadyRunning(_) => "AlreadyRunning",
            ModuleError::NotLoaded(_) => "NotLoaded",
            ModuleError::InvalidManifest(_) => "InvalidManifest",
            ModuleError::InvalidBootstrap(_) => "InvalidBootstrap",
            ModuleError::SerializationError(_) => "SerializationError",
            ModuleError::Bus(_) => "BusError",
        }
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}

/// Module trait implemented by worker binaries
///
/// The dispatcher inside the worker process calls `load` once, publishes the
/// outcome to the coordinator, and calls `unload` when the coordinator asks
/// the module to stop.
#[async_trait]
pub trait Module: Send + 'static {
    /// Load the module
    ///
    /// Register bus listeners here. The returned value travels back to the
    /// coordinator in the load-complete report.
    async fn load(&mut self, context: &ModuleContext) -> Result<Option<Value>, ModuleError>;

    /// Release resources before the worker exits
    async fn unload(&mut self, _context: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Context handed to a module's lifecycle hooks
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Module ID (unique identifier for this module instance)
    pub module_id: ModuleId,
    /// Descriptor the worker was bootstrapped with
    pub descriptor: ModuleDescriptor,
    /// Module data directory (where module can store its state)
    pub data_dir: PathBuf,
    /// Module configuration (manifest config merged with host overrides)
    pub config: HashMap<String, String>,
    /// This process's bus
    pub bus: MessageBus,
}

impl ModuleContext {
    /// Create a new module context
    pub fn new(descriptor: ModuleDescriptor, data_dir: PathBuf, bus: MessageBus) -> Self {
        Self {
            module_id: descriptor.id.clone(),
            config: descriptor.config.clone(),
            descriptor,
            data_dir,
            bus,
        }
    }

    /// Get a configuration value
    pub fn get_config(&self, key: &str) -> Option<&String> {
        self.config.get(key)
    }

    /// Get a configuration value with default
    pub fn get_config_or(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .map(|s| s.as_str())
            .unwrap_or(default)
            .to_string()
    }

    /// Call metadata carrying the scopes granted to this module
    pub fn call_scope(&self) -> AccessScope {
        self.descriptor.call_scope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_is_machine_readable() {
        let error = LoadError::DependencyMissing {
            dependency: Some("storage".to_string()),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "dependencyMissing");
        assert_eq!(json["dependency"], "storage");
        assert_eq!(error.to_string(), "missing dependency: storage");

        let generic = LoadError::DependencyMissing { dependency: None };
        assert_eq!(generic.to_string(), "missing dependency: unresolved");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ModuleState::Spawning.to_string(), "spawning");
        assert_eq!(
            serde_json::to_value(ModuleState::CheckingDependencies).unwrap(),
            "checking-dependencies"
        );
    }
}
