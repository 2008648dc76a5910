//! Echo module worker for modhost
//!
//! Answers `echo.<module id>` requests with the params it was sent.
//! The `mode` config entry selects misbehaviour for exercising the host:
//!
//! - `crash`: exit with code 3 while loading
//! - `crash-later`: load, then exit with code 4 shortly after
//! - `fail`: report a load failure
//! - `hang`: never finish loading
//!
//! With `call` set to a topic, the module sends that request while loading
//! and returns the answer as its load result.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

use modhost::module::bus::{request_handler, AccessScope};
use modhost::module::dispatcher::{init_worker_logging, run_worker};
use modhost::module::{Module, ModuleContext, ModuleError};

struct EchoModule;

#[async_trait]
impl Module for EchoModule {
    async fn load(&mut self, context: &ModuleContext) -> Result<Option<Value>, ModuleError> {
        let mode = context.get_config_or("mode", "echo");
        info!("Echo module {} loading in mode {}", context.module_id, mode);

        match mode.as_str() {
            "crash" => std::process::exit(3),
            "fail" => {
                return Err(ModuleError::InitializationError(
                    "configured to fail".to_string(),
                ))
            }
            "hang" => std::future::pending::<()>().await,
            "crash-later" => {
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    std::process::exit(4);
                });
            }
            _ => {}
        }

        let module_id = context.module_id.clone();
        context
            .bus
            .add_request_listener(
                &format!("echo.{}", context.module_id),
                AccessScope::unrestricted(),
                request_handler(move |request| {
                    let module_id = module_id.clone();
                    async move { Ok(json!({ "from": module_id, "params": request.params })) }
                }),
            )
            .await?;

        let result = match context.get_config("call") {
            Some(topic) => {
                let answer = context
                    .bus
                    .send_request(topic, context.call_scope(), vec![json!(context.module_id)])
                    .await?;
                json!({ "called": topic, "answer": answer })
            }
            None => json!({ "mode": mode }),
        };
        Ok(Some(result))
    }

    async fn unload(&mut self, context: &ModuleContext) -> Result<(), ModuleError> {
        info!("Echo module {} unloading", context.module_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    init_worker_logging();

    let code = match run_worker(Box::new(EchoModule)).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Worker failed: {}", e);
            1
        }
    };
    std::process::exit(code);
}
