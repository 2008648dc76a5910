//! Worker-side module dispatcher
//!
//! Runs inside a worker process (or an in-process worker task). It loads the
//! module, reports the outcome to the coordinator on [`LOAD_COMPLETE_TOPIC`],
//! then keeps the module alive until the coordinator asks it to unload or
//! the link to the coordinator goes away.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::module::bus::{event_listener, AccessScope, FramedTransport, MessageBus};
use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};
use crate::module::traits::{LoadError, Module, ModuleContext, ModuleError};

/// Topic every worker publishes its load report on
pub const LOAD_COMPLETE_TOPIC: &str = "modhost.module.loaded";

/// Environment variable carrying the [`WorkerBootstrap`] JSON
pub const BOOTSTRAP_ENV: &str = "MODHOST_BOOTSTRAP";

/// Topic the coordinator uses to ask one module to unload
pub fn unload_topic(module_id: &str) -> String {
    format!("modhost.unload.{}", module_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    pub name: String,
    pub message: String,
}

/// Load-complete report: `{moduleId, err?, result?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub module_id: ModuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ReportedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl LoadReport {
    pub fn success(module_id: impl Into<ModuleId>, result: Option<Value>) -> Self {
        Self {
            module_id: module_id.into(),
            err: None,
            result,
        }
    }

    pub fn failure(module_id: impl Into<ModuleId>, error: &ModuleError) -> Self {
        Self {
            module_id: module_id.into(),
            err: Some(ReportedError {
                name: error.kind().to_string(),
                message: error.to_string(),
            }),
            result: None,
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, LoadError> {
        match self.err {
            Some(err) => Err(LoadError::ModuleFailure {
                name: err.name,
                message: err.message,
            }),
            None => Ok(self.result),
        }
    }
}

/// Everything a fresh worker knows about the module it hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerBootstrap {
    pub descriptor: ModuleDescriptor,
    pub data_dir: PathBuf,
}

impl WorkerBootstrap {
    pub fn from_json(json: &str) -> Result<Self, ModuleError> {
        serde_json::from_str(json).map_err(|e| ModuleError::InvalidBootstrap(e.to_string()))
    }

    /// Read the bootstrap from [`BOOTSTRAP_ENV`]
    pub fn from_env() -> Result<Self, ModuleError> {
        let json = std::env::var(BOOTSTRAP_ENV).map_err(|_| {
            ModuleError::InvalidBootstrap(format!("{} is not set", BOOTSTRAP_ENV))
        })?;
        Self::from_json(&json)
    }
}

pub struct ModuleDispatcher {
    module: Box<dyn Module>,
    context: ModuleContext,
}

impl ModuleDispatcher {
    pub fn new(module: Box<dyn Module>, bootstrap: WorkerBootstrap, bus: MessageBus) -> Self {
        Self {
            module,
            context: ModuleContext::new(bootstrap.descriptor, bootstrap.data_dir, bus),
        }
    }

    /// Load, report, serve until asked to stop, unload
    pub async fn run(mut self) -> Result<(), ModuleError> {
        let module_id = self.context.module_id.clone();
        let bus = self.context.bus.clone();

        // Registered before loading so it is in place before the report
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let stop_tx = Arc::new(Mutex::new(Some(stop_tx)));
        bus.add_event_listener(
            &unload_topic(&module_id),
            AccessScope::system(),
            event_listener(move |_| {
                let tx = stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            }),
        )
        .await?;

        let outcome = self.module.load(&self.context).await;
        let report = match &outcome {
            Ok(result) => LoadReport::success(module_id.clone(), result.clone()),
            Err(e) => LoadReport::failure(module_id.clone(), e),
        };
        bus.send_event(
            LOAD_COMPLETE_TOPIC,
            self.context.call_scope(),
            vec![serde_json::to_value(&report)?],
        )
        .await?;

        if let Err(e) = outcome {
            error!("Module {} failed to load: {}", module_id, e);
            return Err(e);
        }
        info!("Module {} loaded", module_id);

        tokio::select! {
            _ = stop_rx => info!("Module {} asked to unload", module_id),
            _ = bus.closed() => warn!("Module {} lost its coordinator link", module_id),
        }

        self.module.unload(&self.context).await?;
        info!("Module {} unloaded", module_id);
        Ok(())
    }
}

/// Entry point for worker binaries
///
/// Reads the bootstrap from the environment, links a worker bus to the
/// coordinator over stdin/stdout and runs the dispatcher to completion.
/// Logging must already be initialized; see [`init_worker_logging`].
pub async fn run_worker(module: Box<dyn Module>) -> Result<(), ModuleError> {
    let bootstrap = WorkerBootstrap::from_env()?;
    let (transport, inbound) = FramedTransport::spawn(tokio::io::stdin(), tokio::io::stdout());
    let bus = MessageBus::worker(transport, inbound);
    ModuleDispatcher::new(module, bootstrap, bus).run().await
}

/// Worker logging named after the module in the bootstrap, if present
pub fn init_worker_logging() {
    let name = std::env::var("MODULE_NAME").unwrap_or_else(|_| "module".to_string());
    crate::utils::init_module_logging(&name, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_wire_shape() {
        let ok = LoadReport::success("gallery", Some(json!({"items": 3})));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"moduleId": "gallery", "result": {"items": 3}})
        );

        let failed = LoadReport::failure(
            "gallery",
            &ModuleError::InitializationError("no disk".to_string()),
        );
        let wire = serde_json::to_value(&failed).unwrap();
        assert_eq!(wire["err"]["name"], "InitializationError");
        match failed.into_result() {
            Err(LoadError::ModuleFailure { name, message }) => {
                assert_eq!(name, "InitializationError");
                assert!(message.contains("no disk"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bootstrap_roundtrip() {
        let bootstrap = WorkerBootstrap {
            descriptor: ModuleDescriptor::new("gallery", "Gallery"),
            data_dir: PathBuf::from("/var/lib/modhost/gallery"),
        };
        let json = serde_json::to_string(&bootstrap).unwrap();
        assert!(json.contains("\"dataDir\""));
        assert_eq!(WorkerBootstrap::from_json(&json).unwrap(), bootstrap);
        assert!(matches!(
            WorkerBootstrap::from_json("{}"),
            Err(ModuleError::InvalidBootstrap(_))
        ));
    }

    #[test]
    fn test_unload_topic() {
        assert_eq!(unload_topic("gallery"), "modhost.unload.gallery");
    }
}
