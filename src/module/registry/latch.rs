//! Settle-once completion latch for in-flight loads
//!
//! Three things can end a load attempt: the worker's load report, the worker
//! process exiting, and the load timeout. Whichever reaches the latch first
//! settles it; every later attempt is a no-op that reports `false`.
//!
//! Only the exit of the worker started for this load counts. The latch learns
//! that worker's generation once the spawn returns; exits seen before then are
//! held back and matched when it does.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

use crate::module::dispatcher::LoadReport;
use crate::module::process::ProcessExit;

#[derive(Debug, Clone)]
pub enum Settlement {
    Reported(LoadReport),
    Exited(ProcessExit),
    TimedOut,
}

#[derive(Debug, Default)]
struct Worker {
    generation: Option<u64>,
    early_exits: Vec<ProcessExit>,
}

#[derive(Debug)]
pub struct LoadLatch {
    tx: Mutex<Option<oneshot::Sender<Settlement>>>,
    worker: Mutex<Worker>,
    late_exit: Mutex<Option<ProcessExit>>,
}

impl LoadLatch {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        let latch = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Worker::default()),
            late_exit: Mutex::new(None),
        });
        (latch, rx)
    }

    /// Settle the latch; `false` if it was already settled
    pub fn settle(&self, settlement: Settlement) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => {
                let _ = tx.send(settlement);
                true
            }
            None => false,
        }
    }

    /// Tie the latch to the worker started for this load
    ///
    /// Returns that worker's exit if it was already seen.
    pub fn bind(&self, generation: u64) -> Option<ProcessExit> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        worker.generation = Some(generation);
        std::mem::take(&mut worker.early_exits)
            .into_iter()
            .find(|exit| exit.generation == generation)
    }

    /// Whether `exit` is the exit of this load's worker
    ///
    /// Before [`LoadLatch::bind`] the answer is `false` and the exit is kept
    /// for `bind` to match.
    pub fn owns(&self, exit: &ProcessExit) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.generation {
            Some(generation) => exit.generation == generation,
            None => {
                worker.early_exits.push(exit.clone());
                false
            }
        }
    }

    /// Remember an exit seen after settlement, while the load is finalized
    pub fn record_late_exit(&self, exit: ProcessExit) {
        *self.late_exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(exit);
    }

    pub fn take_late_exit(&self) -> Option<ProcessExit> {
        self.late_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
