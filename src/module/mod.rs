//! Process-isolated module host
//!
//! Every module runs in its own worker process and talks to the coordinator
//! only through the message bus.
//!
//! ## Architecture
//!
//! - **Message bus**: topic-keyed events, requests and subscriber
//!   notifications, gated by scopes, spanning the coordinator and its workers
//! - **Registry**: descriptors, dependency checks, and the load loop that
//!   starts independent modules concurrently
//! - **Supervision**: one worker per module; a crash is contained to that
//!   module and surfaced as a registry event
//! - **Dispatcher**: the worker-side half that loads a module and reports back

pub mod bus;
pub mod dispatcher;
pub mod process;
pub mod registry;
pub mod traits;
pub mod validation;

pub use bus::{AccessScope, BusError, MessageBus};
pub use dispatcher::{run_worker, LoadReport, ModuleDispatcher, WorkerBootstrap};
pub use process::{InProcessSupervisor, ProcessSupervisor, Supervisor};
pub use registry::{
    LoadSummary, ModuleDescriptor, ModuleDiscovery, ModuleHooks, ModuleId, ModuleRegistry,
    RegistryEvent, RegistryOptions,
};
pub use traits::{LoadError, Module, ModuleContext, ModuleError, ModuleState};
pub use validation::{ManifestValidator, ValidationResult};
