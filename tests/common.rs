//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use modhost::module::bus::{request_handler, AccessScope, MessageBus};
use modhost::module::process::InProcessSupervisor;
use modhost::module::registry::{ModuleRegistry, RegistryEvent, RegistryOptions};
use modhost::module::{Module, ModuleContext, ModuleDescriptor, ModuleError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Barrier};

/// Ordered record of lifecycle calls across all test modules
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// What a test module does when loaded
#[derive(Clone)]
pub enum Behavior {
    /// Register `svc.<id>` and load with `{"id": <id>}`
    Serve,
    /// Report a load failure
    Fail(&'static str),
    /// Panic inside `load`
    Panic,
    /// Never finish loading
    Hang,
    /// Wait for every other holder of the barrier before loading
    Rendezvous(Arc<Barrier>),
    /// Call `svc.<target>` while loading and return its answer
    Call(&'static str),
}

pub struct ScriptedModule {
    behavior: Behavior,
    log: CallLog,
}

#[async_trait]
impl Module for ScriptedModule {
    async fn load(&mut self, context: &ModuleContext) -> Result<Option<Value>, ModuleError> {
        self.log.push(format!("load:{}", context.module_id));
        match &self.behavior {
            Behavior::Serve => {}
            Behavior::Fail(message) => {
                return Err(ModuleError::InitializationError(message.to_string()))
            }
            Behavior::Panic => panic!("module {} blew up", context.module_id),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Rendezvous(barrier) => {
                barrier.wait().await;
            }
            Behavior::Call(target) => {
                let answer = context
                    .bus
                    .send_request(
                        &format!("svc.{}", target),
                        context.call_scope(),
                        vec![json!(context.module_id)],
                    )
                    .await?;
                return Ok(Some(answer));
            }
        }

        let module_id = context.module_id.clone();
        context
            .bus
            .add_request_listener(
                &format!("svc.{}", context.module_id),
                AccessScope::unrestricted(),
                request_handler(move |request| {
                    let module_id = module_id.clone();
                    async move { Ok(json!({ "served_by": module_id, "params": request.params })) }
                }),
            )
            .await?;
        Ok(Some(json!({ "id": context.module_id })))
    }

    async fn unload(&mut self, context: &ModuleContext) -> Result<(), ModuleError> {
        self.log.push(format!("unload:{}", context.module_id));
        Ok(())
    }
}

pub struct Harness {
    pub bus: MessageBus,
    pub supervisor: Arc<InProcessSupervisor>,
    pub registry: ModuleRegistry,
    pub log: CallLog,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(RegistryOptions {
            load_timeout: Duration::from_secs(5),
            unload_grace: Duration::from_secs(1),
            ..RegistryOptions::default()
        })
        .await
    }

    pub async fn with_options(options: RegistryOptions) -> Self {
        let bus = MessageBus::coordinator();
        let supervisor = Arc::new(InProcessSupervisor::new(
            bus.clone(),
            std::env::temp_dir().join("modhost-tests"),
        ));
        let registry = ModuleRegistry::new(bus.clone(), supervisor.clone(), options)
            .await
            .unwrap();
        Self {
            bus,
            supervisor,
            registry,
            log: CallLog::default(),
        }
    }

    /// Install `descriptor` and make it spawnable with `behavior`
    pub async fn add(&self, descriptor: ModuleDescriptor, behavior: Behavior) {
        let log = self.log.clone();
        self.supervisor.register(descriptor.id.clone(), move || {
            Box::new(ScriptedModule {
                behavior: behavior.clone(),
                log: log.clone(),
            }) as Box<dyn Module>
        });
        self.registry.add_descriptor(descriptor).await.unwrap();
    }

    pub async fn descriptor(&self, module_id: &str) -> ModuleDescriptor {
        self.registry.descriptor(module_id).await.unwrap()
    }
}

pub fn module(id: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(id, id).with_version("1.0.0")
}

/// Next registry event matching `pred`, or panic after `within`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<RegistryEvent>,
    within: Duration,
    pred: F,
) -> RegistryEvent
where
    F: Fn(&RegistryEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("registry event not seen in time")
}
