//! Worker supervision
//!
//! Spawning, monitoring and stopping the worker that hosts each loaded module.

pub mod in_process;
pub mod monitor;
pub mod spawner;
pub mod supervisor;

pub use in_process::{InProcessSupervisor, ModuleFactory};
pub use monitor::ProcessMonitor;
pub use spawner::ProcessSupervisor;
pub use supervisor::{ProcessExit, Supervisor, WorkerProcessHandle, WorkerState};
