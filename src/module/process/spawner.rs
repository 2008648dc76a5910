//! Worker process spawning
//!
//! One OS process per module. The worker's stdin/stdout carry its bus link;
//! stderr is inherited so worker logs land next to the host's.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::module::bus::{FramedTransport, MessageBus};
use crate::module::dispatcher::{WorkerBootstrap, BOOTSTRAP_ENV};
use crate::module::process::monitor::ProcessMonitor;
use crate::module::process::supervisor::{
    retire, ProcessExit, StopRequest, Supervisor, WorkerProcessHandle, WorkerState,
    WorkerTable,
};
use crate::module::registry::descriptor::ModuleDescriptor;
use crate::module::traits::ModuleError;

/// Spawns and supervises worker processes
pub struct ProcessSupervisor {
    bus: MessageBus,
    /// Base directory for module data
    data_dir: PathBuf,
    table: Arc<WorkerTable>,
}

impl ProcessSupervisor {
    pub fn new<P: AsRef<Path>>(bus: MessageBus, data_dir: P) -> Self {
        Self {
            bus,
            data_dir: data_dir.as_ref().to_path_buf(),
            table: Arc::new(WorkerTable::new()),
        }
    }

    /// Absolute path of a module's worker binary
    fn binary_path(descriptor: &ModuleDescriptor) -> PathBuf {
        if descriptor.entry_point.is_absolute() {
            descriptor.entry_point.clone()
        } else {
            descriptor.installed_dir.join(&descriptor.entry_point)
        }
    }

    async fn launch(&self, descriptor: &ModuleDescriptor, generation: u64) -> Result<(), ModuleError> {
        let module_id = descriptor.id.clone();
        info!("Spawning module process: {}", module_id);

        let binary_path = Self::binary_path(descriptor);
        if descriptor.entry_point.as_os_str().is_empty() || !binary_path.is_file() {
            return Err(ModuleError::ModuleNotFound(format!(
                "Module binary not found: {:?}",
                binary_path
            )));
        }

        let module_data_dir = self.data_dir.join(&module_id);
        std::fs::create_dir_all(&module_data_dir).map_err(|e| {
            ModuleError::InitializationError(format!(
                "Failed to create module data directory: {}",
                e
            ))
        })?;

        let bootstrap = serde_json::to_string(&WorkerBootstrap {
            descriptor: descriptor.clone(),
            data_dir: module_data_dir,
        })?;

        let mut command = Command::new(&binary_path);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .env(BOOTSTRAP_ENV, bootstrap)
            .env("MODULE_NAME", &descriptor.name);
        if descriptor.installed_dir.is_dir() {
            command.current_dir(&descriptor.installed_dir);
        }

        // Module config as environment variables
        for (key, value) in &descriptor.config {
            command.env(format!("MODULE_CONFIG_{}", key.to_uppercase()), value);
        }

        debug!("Spawning process: {:?}", binary_path);
        let mut child = command.spawn().map_err(|e| {
            ModuleError::InitializationError(format!("Failed to spawn module process: {}", e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModuleError::IpcError("missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ModuleError::IpcError("missing stdout pipe".to_string()))?;

        let (transport, inbound) = FramedTransport::spawn(stdout, stdin);
        let drained = self
            .bus
            .attach_peer(
                module_id.clone(),
                descriptor.granted_scopes(),
                transport,
                inbound,
            )
            .await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let pid = child.id();
        self.table.launched(&module_id, generation, pid, stop_tx);

        let monitor = ProcessMonitor::new(module_id.clone(), generation, child, stop_rx);
        let bus = self.bus.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let exit = monitor.run().await;
            retire(&bus, drained, &table, exit).await;
        });

        info!("Module {} process started (pid {:?})", module_id, pid);
        Ok(())
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn spawn(&self, descriptor: &ModuleDescriptor) -> Result<u64, ModuleError> {
        let generation = self.table.reserve(&descriptor.id)?;
        if let Err(e) = self.launch(descriptor, generation).await {
            self.table.abandon(&descriptor.id, generation);
            return Err(e);
        }
        Ok(generation)
    }

    async fn stop(&self, module_id: &str, grace: Duration) -> Option<ProcessExit> {
        self.table
            .stop(module_id, StopRequest { grace: Some(grace) })
            .await
    }

    async fn kill(&self, module_id: &str) -> Option<ProcessExit> {
        self.table.stop(module_id, StopRequest { grace: None }).await
    }

    fn mark_running(&self, module_id: &str) {
        self.table.set_state(module_id, WorkerState::Running);
    }

    fn worker_state(&self, module_id: &str) -> Option<WorkerState> {
        self.table.state(module_id)
    }

    fn workers(&self) -> Vec<WorkerProcessHandle> {
        self.table.handles()
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.table.subscribe()
    }
}
