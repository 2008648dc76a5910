//! modhost - process-isolated module host
//!
//! A coordinator process discovers modules on disk, starts each one in its
//! own worker process in dependency order, and links every process through a
//! single scoped message bus.
//!
//! ## Design Principles
//!
//! 1. **Crash Containment**: a module failure never takes the host down
//! 2. **Scoped Access**: every bus registration and call carries its scopes
//! 3. **Concurrent Loading**: independent modules load side by side
//! 4. **Single Writer**: only the registry mutates module descriptors

pub mod config;
pub mod module;
pub mod utils;

pub use config::{HostConfig, LoggingConfig, ModuleConfig};
pub use module::{
    AccessScope, BusError, LoadError, Module, ModuleContext, ModuleDescriptor, ModuleError,
    ModuleRegistry, ModuleState, MessageBus, RegistryOptions,
};
