//! In-process workers
//!
//! Hosts modules compiled into the host binary. Each module runs as a tokio
//! task with its own worker bus, linked to the coordinator over an in-memory
//! transport, so it goes through exactly the same load protocol as a worker
//! process. A panic during load counts as a crash.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::module::bus::{memory_pair, MessageBus};
use crate::module::dispatcher::{ModuleDispatcher, WorkerBootstrap};
use crate::module::process::supervisor::{
    retire, ProcessExit, StopRequest, Supervisor, WorkerProcessHandle, WorkerState,
    WorkerTable,
};
use crate::module::registry::descriptor::ModuleDescriptor;
use crate::module::traits::{Module, ModuleError};

/// Builds a fresh module instance for every spawn
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

pub struct InProcessSupervisor {
    bus: MessageBus,
    data_dir: PathBuf,
    factories: RwLock<HashMap<String, ModuleFactory>>,
    table: Arc<WorkerTable>,
}

enum Outcome {
    Finished(Result<Result<(), ModuleError>, JoinError>),
    Stop(Option<StopRequest>),
}

fn exit_code(joined: &Result<Result<(), ModuleError>, JoinError>) -> Option<i32> {
    match joined {
        Ok(Ok(())) => Some(0),
        Ok(Err(_)) => Some(1),
        Err(_) => None,
    }
}

impl InProcessSupervisor {
    pub fn new<P: AsRef<Path>>(bus: MessageBus, data_dir: P) -> Self {
        Self {
            bus,
            data_dir: data_dir.as_ref().to_path_buf(),
            factories: RwLock::new(HashMap::new()),
            table: Arc::new(WorkerTable::new()),
        }
    }

    /// Make module `module_id` spawnable
    pub fn register<F>(&self, module_id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module_id.into(), Arc::new(factory));
    }

    fn factory(&self, module_id: &str) -> Option<ModuleFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module_id)
            .cloned()
    }

    async fn launch(&self, descriptor: &ModuleDescriptor, generation: u64) -> Result<(), ModuleError> {
        let module_id = descriptor.id.clone();
        let factory = self.factory(&module_id).ok_or_else(|| {
            ModuleError::ModuleNotFound(format!("no in-process factory for {}", module_id))
        })?;

        let ((coordinator_side, coordinator_inbound), (worker_side, worker_inbound)) =
            memory_pair();
        let drained = self
            .bus
            .attach_peer(
                module_id.clone(),
                descriptor.granted_scopes(),
                coordinator_side,
                coordinator_inbound,
            )
            .await?;

        let bootstrap = WorkerBootstrap {
            descriptor: descriptor.clone(),
            data_dir: self.data_dir.join(&module_id),
        };
        let worker_bus = MessageBus::worker(worker_side, worker_inbound);
        let dispatcher = ModuleDispatcher::new(factory(), bootstrap, worker_bus);
        let mut task = tokio::spawn(dispatcher.run());

        let (stop_tx, mut stop_rx) = oneshot::channel::<StopRequest>();
        self.table.launched(&module_id, generation, None, stop_tx);

        let bus = self.bus.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                joined = &mut task => Outcome::Finished(joined),
                request = &mut stop_rx => Outcome::Stop(request.ok()),
            };

            let (joined, killed) = match outcome {
                Outcome::Finished(joined) => (joined, false),
                Outcome::Stop(Some(StopRequest { grace })) => {
                    let finished = match grace {
                        Some(grace) => timeout(grace, &mut task).await.ok(),
                        None => None,
                    };
                    let joined = match finished {
                        Some(joined) => joined,
                        None => {
                            task.abort();
                            (&mut task).await
                        }
                    };
                    (joined, true)
                }
                Outcome::Stop(None) => ((&mut task).await, false),
            };

            if let Err(e) = &joined {
                if e.is_panic() {
                    warn!("In-process module {} panicked", module_id);
                }
            }
            let exit = ProcessExit {
                module_id: module_id.clone(),
                generation,
                code: exit_code(&joined),
                killed,
            };
            info!("In-process module {} finished (code {:?})", module_id, exit.code);
            retire(&bus, drained, &table, exit).await;
        });
        Ok(())
    }
}

#[async_trait]
impl Supervisor for InProcessSupervisor {
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
