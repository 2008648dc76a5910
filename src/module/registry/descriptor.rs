//! Module descriptors
//!
//! One descriptor per known module. Created at discovery or install;
//! `is_loaded`, `load_error` and `state` are written only by the registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::module::bus::{AccessScope, ScopeSet};
use crate::module::traits::{LoadError, ModuleState};

/// Module identifier (the module's directory name)
pub type ModuleId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub id: ModuleId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Dependency module id to version range
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub is_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_error: Option<LoadError>,
    #[serde(default)]
    pub state: ModuleState,
    #[serde(default)]
    pub installed_dir: PathBuf,
    /// Worker binary; empty for modules hosted in-process
    #[serde(default)]
    pub entry_point: PathBuf,
    /// Scopes granted to the module's own calls
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_import: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_dir: Option<String>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<ModuleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: None,
            dependencies: BTreeMap::new(),
            is_loaded: false,
            load_error: None,
            state: ModuleState::Discovered,
            installed_dir: PathBuf::new(),
            entry_point: PathBuf::new(),
            scopes: Vec::new(),
            config: HashMap::new(),
            icon: None,
            content_element: None,
            content_import: None,
            app_dir: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>, range: impl Into<String>) -> Self {
        self.dependencies.insert(id.into(), range.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Scopes the module's worker link is allowed to claim
    pub fn granted_scopes(&self) -> ScopeSet {
        self.scopes.iter().cloned().collect()
    }

    /// Call metadata for requests and events this module sends
    pub fn call_scope(&self) -> AccessScope {
        AccessScope {
            scopes: Some(self.granted_scopes()),
            user: None,
        }
    }

    /// Forget the outcome of any previous load attempt
    pub(crate) fn reset(&mut self) {
        self.is_loaded = false;
        self.load_error = None;
        self.state = ModuleState::Discovered;
    }
}
