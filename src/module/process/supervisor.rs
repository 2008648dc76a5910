//! Worker supervision interface
//!
//! The registry drives workers only through [`Supervisor`], so the same load
//! loop runs over real OS processes ([`super::ProcessSupervisor`]) and over
//! tokio tasks ([`super::InProcessSupervisor`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;
use tracing::debug;

use crate::module::bus::{MessageBus, PeerDrained};
use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};
use crate::module::traits::ModuleError;

const EXIT_CHANNEL_CAPACITY: usize = 256;
/// How long a dead worker's link may keep delivering queued messages
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A worker went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExit {
    pub module_id: ModuleId,
    /// Worker instance that exited, as returned by [`Supervisor::spawn`]
    pub generation: u64,
    /// Exit code; `None` when terminated by a signal or a panic
    pub code: Option<i32>,
    /// The exit followed a stop or kill request
    pub killed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Spawning,
    Loading,
    Running,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcessHandle {
    pub module_id: ModuleId,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// Start a worker for `descriptor`; returns its generation once it is
    /// attached to the bus
    ///
    /// Generations are never reused, so an exit can always be told apart from
    /// the exit of a later worker for the same module.
    async fn spawn(&self, descriptor: &ModuleDescriptor) -> Result<u64, ModuleError>;

    /// Give the worker `grace` to exit on its own, then terminate it
    async fn stop(&self, module_id: &str, grace: Duration) -> Option<ProcessExit>;

    /// Terminate the worker now
    async fn kill(&self, module_id: &str) -> Option<ProcessExit>;

    /// The worker's module finished loading
    fn mark_running(&self, module_id: &str);

    fn worker_state(&self, module_id: &str) -> Option<WorkerState>;

    fn workers(&self) -> Vec<WorkerProcessHandle>;

    /// Every worker exit, requested or not
    fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit>;
}

/// Sent to a worker's monitor task to end it
#[derive(Debug, Clone, Copy)]
pub(crate) struct StopRequest {
    /// `None` kills without waiting
    pub grace: Option<Duration>,
}

struct WorkerEntry {
    generation: u64,
    pid: Option<u32>,
    state: WorkerState,
    stop: Option<oneshot::Sender<StopRequest>>,
    /// Stop requested before the worker finished spawning
    deferred_stop: Option<StopRequest>,
    done: watch::Sender<Option<ProcessExit>>,
}

/// Bookkeeping shared by the supervisors: one entry per live worker
pub(crate) struct WorkerTable {
    entries: Mutex<HashMap<ModuleId, WorkerEntry>>,
    exits: broadcast::Sender<ProcessExit>,
    next_generation: AtomicU64,
}

impl WorkerTable {
    pub fn new() -> Self {
        let (exits, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            exits,
            next_generation: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<ModuleId, WorkerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for a new worker; fails while one is alive
    pub fn reserve(&self, module_id: &str) -> Result<u64, ModuleError> {
        let mut entries = self.entries();
        if entries.contains_key(module_id) {
            return Err(ModuleError::AlreadyRunning(module_id.to_string()));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (done, _) = watch::channel(None);
        entries.insert(
            module_id.to_string(),
            WorkerEntry {
                generation,
                pid: None,
                state: WorkerState::Spawning,
                stop: None,
                deferred_stop: None,
                done,
            },
        );
        Ok(generation)
    }

    /// The worker is up; its monitor listens on the other end of `stop`
    pub fn launched(
        &self,
        module_id: &str,
        generation: u64,
        pid: Option<u32>,
        stop: oneshot::Sender<StopRequest>,
    ) {
        let mut entries = self.entries();
        let Some(entry) = entries
            .get_mut(module_id)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };
        entry.pid = pid;
        entry.state = WorkerState::Loading;
        match entry.deferred_stop.take() {
            Some(request) => {
                let _ = stop.send(request);
            }
            None => entry.stop = Some(stop),
        }
    }

    /// Spawning failed; release the slot
    pub fn abandon(&self, module_id: &str, generation: u64) {
        let mut entries = self.entries();
        if entries
            .get(module_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            if let Some(entry) = entries.remove(module_id) {
                entry.done.send_replace(Some(ProcessExit {
                    module_id: module_id.to_string(),
                    generation,
                    code: None,
                    killed: entry.deferred_stop.is_some(),
                }));
            }
        }
    }

    pub fn set_state(&self, module_id: &str, state: WorkerState) {
        if let Some(entry) = self.entries().get_mut(module_id) {
            entry.state = state;
        }
    }

    pub fn state(&self, module_id: &str) -> Option<WorkerState> {
        self.entries().get(module_id).map(|entry| entry.state)
    }

    pub fn handles(&self) -> Vec<WorkerProcessHandle> {
        let mut handles: Vec<WorkerProcessHandle> = self
            .entries()
            .iter()
            .map(|(id, entry)| WorkerProcessHandle {
                module_id: id.clone(),
                pid: entry.pid,
                state: entry.state,
            })
            .collect();
        handles.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        handles
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessExit> {
        self.exits.subscribe()
    }

    /// Ask the worker to stop and wait for its exit
    ///
    /// `None` if no worker is registered under `module_id`.
    pub async fn stop(&self, module_id: &str, request: StopRequest) -> Option<ProcessExit> {
        let mut done = {
            let mut entries = self.entries();
            let entry = entries.get_mut(module_id)?;
            match entry.stop.take() {
                Some(stop) => {
                    let _ = stop.send(request);
                }
                None if entry.state == WorkerState::Spawning => {
                    entry.deferred_stop.get_or_insert(request);
                }
                None => debug!("Stop for {} already in progress", module_id),
            }
            entry.done.subscribe()
        };
        let exit = match done.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit
    }

    /// Record a worker's exit and publish it
    pub fn exited(&self, exit: ProcessExit) {
        let entry = {
            let mut entries = self.entries();
            match entries.get(&exit.module_id) {
                Some(entry) if entry.generation == exit.generation => {
                    entries.remove(&exit.module_id)
                }
                _ => None,
            }
        };
        let _ = self.exits.send(exit.clone());
        if let Some(entry) = entry {
            entry.done.send_replace(Some(exit));
        }
    }
}

/// Retire a finished worker
///
/// Messages the worker queued before dying (a failed load report, say) are
/// handled before its link is dropped and the exit is published.
pub(crate) async fn retire(
    bus: &MessageBus,
    drained: PeerDrained,
    table: &WorkerTable,
    exit: ProcessExit,
) {
    if timeout(DRAIN_TIMEOUT, drained).await.is_err() {
        debug!("Link to {} still open after exit", exit.module_id);
    }
    bus.detach_peer(&exit.module_id).await;
    table.exited(exit);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(id: &str, generation: u64, killed: bool) -> ProcessExit {
        ProcessExit {
            module_id: id.to_string(),
            generation,
            code: Some(0),
            killed,
        }
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let table = WorkerTable::new();
        let generation = table.reserve("m").unwrap();
        assert!(matches!(
            table.reserve("m"),
            Err(ModuleError::AlreadyRunning(_))
        ));
        assert_eq!(table.state("m"), Some(WorkerState::Spawning));

        table.abandon("m", generation);
        assert!(table.state("m").is_none());
        assert!(table.reserve("m").is_ok());
    }

    #[tokio::test]
    async fn test_stop_waits_for_exit() {
        let table = std::sync::Arc::new(WorkerTable::new());
        let generation = table.reserve("m").unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        table.launched("m", generation, Some(42), stop_tx);
        assert_eq!(table.state("m"), Some(WorkerState::Loading));

        let mut exits = table.subscribe();
        let monitor = {
            let table = table.clone();
            tokio::spawn(async move {
                let request = stop_rx.await.unwrap();
                assert!(request.grace.is_none());
                table.exited(exit("m", generation, true));
            })
        };

        let exit = table.stop("m", StopRequest { grace: None }).await.unwrap();
        assert!(exit.killed);
        monitor.await.unwrap();
        assert_eq!(exits.recv().await.unwrap().module_id, "m");
        assert!(table.stop("m", StopRequest { grace: None }).await.is_none());
    }

    #[test]
    fn test_stale_exit_keeps_new_worker() {
        let table = WorkerTable::new();
        let first = table.reserve("m").unwrap();
        table.abandon("m", first);
        let _second = table.reserve("m").unwrap();
        table.exited(exit("m", first, false));
        assert_eq!(table.state("m"), Some(WorkerState::Spawning));
    }
}
