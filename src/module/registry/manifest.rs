//! Module manifest parsing
//!
//! Handles parsing `module.toml` manifests.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::module::traits::ModuleError;

/// Manifest file name looked up in every module directory
pub const MANIFEST_FILE: &str = "module.toml";

/// Module manifest (module.toml structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name
    pub name: String,
    /// Module version (semantic versioning)
    #[serde(default)]
    pub version: Option<String>,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Worker binary (relative to the module directory, or absolute)
    pub entry_point: String,
    /// Required modules (module id to version range)
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Scopes granted to the module's own bus calls
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub content_element: Option<String>,
    #[serde(default)]
    pub content_import: Option<String>,
    #[serde(default)]
    pub app_dir: Option<String>,
    /// Free-form module configuration
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
}

impl ModuleManifest {
    /// Load manifest from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to read manifest file: {}", e))
        })?;
        Self::parse(&contents)
    }

    /// Parse manifest TOML
    pub fn parse(contents: &str) -> Result<Self, ModuleError> {
        let manifest: ModuleManifest = toml::from_str(contents).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to parse manifest TOML: {}", e))
        })?;

        if manifest.name.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Module name cannot be empty".to_string(),
            ));
        }
        if manifest.entry_point.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Entry point cannot be empty".to_string(),
            ));
        }

        Ok(manifest)
    }

    /// Configuration flattened to string values
    ///
    /// Strings are taken as-is; other values use their TOML rendering.
    pub fn flat_config(&self) -> HashMap<String, String> {
        self.config
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect()
    }
}
