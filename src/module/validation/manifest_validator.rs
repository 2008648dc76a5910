//! Manifest validation
//!
//! Checks a parsed `module.toml` for structure before it becomes a
//! descriptor: identifier formats, version and range syntax, scope tokens.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::module::registry::manifest::ModuleManifest;
use crate::module::registry::version::{parse_version, VersionRange};

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Manifest is valid
    Valid,
    /// Manifest is invalid with specific errors
    Invalid(Vec<String>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Manifest validator
pub struct ManifestValidator {
    max_id_len: usize,
    max_name_len: usize,
    max_scopes: usize,
}

impl ManifestValidator {
    /// Create a new manifest validator
    pub fn new() -> Self {
        Self {
            max_id_len: 64,
            max_name_len: 128,
            max_scopes: 256,
        }
    }

    /// Validate a module manifest
    pub fn validate(&self, manifest: &ModuleManifest) -> ValidationResult {
        let mut errors = Vec::new();

        if manifest.name.trim().is_empty() {
            errors.push("Module name cannot be empty".to_string());
        } else if manifest.name.chars().count() > self.max_name_len
            || manifest.name.chars().any(char::is_control)
        {
            errors.push(format!("Invalid module name: {:?}", manifest.name));
        }

        if let Some(version) = &manifest.version {
            if parse_version(version).is_err() {
                errors.push(format!(
                    "Invalid version format: {} (expected semantic versioning)",
                    version
                ));
            }
        }

        if manifest.entry_point.trim().is_empty() {
            errors.push("Entry point cannot be empty".to_string());
        }

        if let Err(dep_errors) = self.validate_dependencies(&manifest.dependencies) {
            errors.extend(dep_errors);
        }

        if let Err(scope_errors) = self.validate_scopes(&manifest.scopes) {
            errors.extend(scope_errors);
        }

        if errors.is_empty() {
            debug!("Manifest validation passed for module: {}", manifest.name);
            ValidationResult::Valid
        } else {
            warn!(
                "Manifest validation failed for module {}: {:?}",
                manifest.name, errors
            );
            ValidationResult::Invalid(errors)
        }
    }

    /// Module ids (directory names) and dependency names
    ///
    /// Alphanumeric start, then alphanumerics, dashes, underscores and dots.
    pub fn is_valid_id(&self, id: &str) -> bool {
        if id.is_empty() || id.len() > self.max_id_len {
            return false;
        }

        if !id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return false;
        }

        id.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    fn validate_dependencies(&self, dependencies: &BTreeMap<String, String>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (dep_name, dep_range) in dependencies {
            if !self.is_valid_id(dep_name) {
                errors.push(format!("Invalid dependency name: {}", dep_name));
            }
            if let Err(e) = VersionRange::parse(dep_range) {
                errors.push(format!(
                    "Invalid version range {:?} for dependency {}: {}",
                    dep_range, dep_name, e
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_scopes(&self, scopes: &[String]) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if scopes.len() > self.max_scopes {
            errors.push(format!("Too many scopes: {}", scopes.len()));
        }
        for scope in scopes {
            if scope.is_empty() || scope.chars().any(char::is_whitespace) {
                errors.push(format!("Invalid scope: {:?}", scope));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}
