//! Module discovery
//!
//! Scans the modules directory. Every sub-directory holding a `module.toml`
//! is one module, identified by the directory name.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};
use crate::module::registry::manifest::{ModuleManifest, MANIFEST_FILE};
use crate::module::traits::ModuleError;
use crate::module::validation::{ManifestValidator, ValidationResult};

/// Discovered module information
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    pub id: ModuleId,
    /// Module directory path
    pub directory: PathBuf,
    /// Module manifest
    pub manifest: ModuleManifest,
    /// Path to module binary
    pub binary_path: PathBuf,
}

impl DiscoveredModule {
    pub fn into_descriptor(self) -> ModuleDescriptor {
        let config = self.manifest.flat_config();
        let manifest = self.manifest;
        ModuleDescriptor {
            id: self.id,
            name: manifest.name,
            version: manifest.version,
            dependencies: manifest.dependencies,
            installed_dir: self.directory,
            entry_point: self.binary_path,
            scopes: manifest.scopes,
            config,
            icon: manifest.icon,
            content_element: manifest.content_element,
            content_import: manifest.content_import,
            app_dir: manifest.app_dir,
            ..ModuleDescriptor::new("", "")
        }
    }
}

/// Module discovery scanner
pub struct ModuleDiscovery {
    /// Base directory to scan for modules
    modules_dir: PathBuf,
    validator: ManifestValidator,
}

impl ModuleDiscovery {
    /// Create a new module discovery scanner
    pub fn new<P: AsRef<Path>>(modules_dir: P) -> Self {
        Self {
            modules_dir: modules_dir.as_ref().to_path_buf(),
            validator: ManifestValidator::new(),
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Discover all modules in the modules directory
    ///
    /// Directories with a missing, unreadable or invalid manifest are skipped
    /// with a warning. Results are ordered by module id.
    pub fn discover_modules(&self) -> Result<Vec<DiscoveredModule>, ModuleError> {
        info!("Discovering modules in {:?}", self.modules_dir);

        if !self.modules_dir.exists() {
            debug!("Modules directory does not exist, creating: {:?}", self.modules_dir);
            fs::create_dir_all(&self.modules_dir).map_err(|e| {
                ModuleError::OperationError(format!("Failed to create modules directory: {}", e))
            })?;
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.modules_dir).map_err(|e| {
            ModuleError::OperationError(format!("Failed to read modules directory: {}", e))
        })?;

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                ModuleError::OperationError(format!("Failed to read directory entry: {}", e))
            })?;

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(MANIFEST_FILE).exists() {
                debug!("No {} found in {:?}, skipping", MANIFEST_FILE, path);
                continue;
            }

            match self.inspect(&path) {
                Ok(module) => modules.push(module),
                Err(e) => warn!("Skipping module in {:?}: {}", path, e),
            }
        }

        modules.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Discovered {} modules", modules.len());
        Ok(modules)
    }

    /// Discover a specific module by id
    pub fn discover_module(&self, module_id: &str) -> Result<DiscoveredModule, ModuleError> {
        let module_dir = self.modules_dir.join(module_id);
        if !module_dir.join(MANIFEST_FILE).exists() {
            return Err(ModuleError::ModuleNotFound(format!(
                "Module {} not found (no {} in {:?})",
                module_id, MANIFEST_FILE, module_dir
            )));
        }
        self.inspect(&module_dir)
    }

    /// Read and validate the module in `module_dir`
    pub fn inspect(&self, module_dir: &Path) -> Result<DiscoveredModule, ModuleError> {
        let id = module_dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ModuleError::InvalidManifest(format!("Unusable module directory: {:?}", module_dir))
            })?;
        if !self.validator.is_valid_id(&id) {
            return Err(ModuleError::InvalidManifest(format!(
                "Invalid module id: {}",
                id
            )));
        }

        let manifest = ModuleManifest::from_file(module_dir.join(MANIFEST_FILE))?;
        if let ValidationResult::Invalid(errors) = self.validator.validate(&manifest) {
            return Err(ModuleError::InvalidManifest(errors.join("; ")));
        }

        let binary_path = self.find_module_binary(module_dir, &manifest.entry_point);
        Ok(DiscoveredModule {
            id,
            directory: module_dir.to_path_buf(),
            manifest,
            binary_path,
        })
    }

    /// Find module binary path
    ///
    /// Falls back to `<module_dir>/<entry_point>` when no candidate exists;
    /// spawning then reports the missing binary.
    fn find_module_binary(&self, module_dir: &Path, entry_point: &str) -> PathBuf {
        let candidates = [
            module_dir.join(entry_point),
            module_dir.join("target").join("release").join(entry_point),
            module_dir.join("target").join("debug").join(entry_point),
            self.modules_dir.join(entry_point),
        ];

        for candidate in &candidates {
            if candidate.is_file() && is_executable(candidate) {
                return candidate.clone();
            }
        }

        debug!(
            "No executable for entry_point {} in {:?}",
            entry_point, module_dir
        );
        module_dir.join(entry_point)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(root: &Path, id: &str, manifest: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn test_discovery_skips_invalid_modules() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(
            tmp.path(),
            "storage",
            "name = \"Storage\"\nversion = \"1.0.0\"\nentry_point = \"storage\"\n",
        );
        write_module(
            tmp.path(),
            "gallery",
            "name = \"Gallery\"\nentry_point = \"gallery\"\n[dependencies]\nstorage = \"^1\"\n",
        );
        write_module(tmp.path(), "broken", "name = \"Broken\"\n");
        fs::create_dir_all(tmp.path().join("not-a-module")).unwrap();

        let discovery = ModuleDiscovery::new(tmp.path());
        let modules = discovery.discover_modules().unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gallery", "storage"]);

        let descriptor = modules[0].clone().into_descriptor();
        assert_eq!(descriptor.name, "Gallery");
        assert_eq!(descriptor.dependencies["storage"], "^1");
        assert_eq!(descriptor.installed_dir, tmp.path().join("gallery"));
        assert!(!descriptor.is_loaded);
    }

    #[test]
    fn test_missing_modules_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("modules");
        let discovery = ModuleDiscovery::new(&dir);
        assert!(discovery.discover_modules().unwrap().is_empty());
        assert!(dir.is_dir());
    }

    #[test]
    fn test_discover_module_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        write_module(tmp.path(), "clock", "name = \"Clock\"\nentry_point = \"clock\"\n");
        let discovery = ModuleDiscovery::new(tmp.path());
        assert_eq!(discovery.discover_module("clock").unwrap().id, "clock");
        assert!(matches!(
            discovery.discover_module("nope"),
            Err(ModuleError::ModuleNotFound(_))
        ));
    }
}
