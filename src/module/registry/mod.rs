//! Module registry and discovery
//!
//! Handles module discovery, manifest parsing, version ranges, and the
//! dependency-ordered load loop.

pub mod descriptor;
pub mod discovery;
pub mod graph;
pub mod latch;
pub mod manifest;
pub mod module_registry;
pub mod version;

pub use descriptor::{ModuleDescriptor, ModuleId};
pub use discovery::{DiscoveredModule, ModuleDiscovery};
pub use graph::{DependencyGraph, GraphNode};
pub use latch::{LoadLatch, Settlement};
pub use manifest::{ModuleManifest, MANIFEST_FILE};
pub use module_registry::{
    LoadSummary, ModuleHooks, ModuleRegistry, RegistryEvent, RegistryOptions,
};
pub use version::{parse_version, VersionRange};
