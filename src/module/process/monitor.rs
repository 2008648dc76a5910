//! Worker process monitoring
//!
//! One monitor per worker process: it waits for the child to exit or for a
//! stop request, terminates the child when asked, and reports the exit.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::module::process::supervisor::{ProcessExit, StopRequest};
use crate::module::registry::descriptor::ModuleId;

/// Watches a single worker process
pub struct ProcessMonitor {
    module_id: ModuleId,
    generation: u64,
    child: Child,
    stop: oneshot::Receiver<StopRequest>,
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Stop(Option<StopRequest>),
}

impl ProcessMonitor {
    pub(crate) fn new(
        module_id: ModuleId,
        generation: u64,
        child: Child,
        stop: oneshot::Receiver<StopRequest>,
    ) -> Self {
        Self {
            module_id,
            generation,
            child,
            stop,
        }
    }

    /// Run until the worker is gone
    pub async fn run(mut self) -> ProcessExit {
        let outcome = tokio::select! {
            status = self.child.wait() => Outcome::Exited(status),
            request = &mut self.stop => Outcome::Stop(request.ok()),
        };

        let (status, killed) = match outcome {
            Outcome::Exited(status) => (status, false),
            Outcome::Stop(Some(request)) => (self.terminate(request.grace).await, true),
            // Nobody can stop this worker any more; wait it out
            Outcome::Stop(None) => (self.child.wait().await, false),
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait for module {} process: {}", self.module_id, e);
                None
            }
        };
        if killed {
            info!("Module {} process stopped (code {:?})", self.module_id, code);
        } else {
            warn!("Module {} process exited (code {:?})", self.module_id, code);
        }

        ProcessExit {
            module_id: self.module_id,
            generation: self.generation,
            code,
            killed,
        }
    }

    /// Wait out the grace period, ask politely, then kill
    async fn terminate(&mut self, grace: Option<Duration>) -> io::Result<ExitStatus> {
        if let Some(grace) = grace {
            if let Ok(status) = timeout(grace, self.child.wait()).await {
                return status;
            }
            if self.signal_terminate() {
                if let Ok(status) = timeout(grace, self.child.wait()).await {
                    return status;
                }
            }
            warn!(
                "Module {} did not exit within {:?}, killing",
                self.module_id, grace
            );
        }

        debug!("Killing module process: {}", self.module_id);
        if let Err(e) = self.child.start_kill() {
            debug!("Failed to kill module process {}: {}", self.module_id, e);
        }
        self.child.wait().await
    }

    #[cfg(all(unix, feature = "nix"))]
    fn signal_terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return false;
        };
        match i32::try_from(pid) {
            Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => true,
                Err(e) => {
                    debug!("SIGTERM to module {} failed: {}", self.module_id, e);
                    false
                }
            },
            Err(_) => false,
        }
    }

    #[cfg(not(all(unix, feature = "nix")))]
    fn signal_terminate(&self) -> bool {
        false
    }
}
