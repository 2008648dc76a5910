//! Module registry: descriptors and the dependency-ordered load loop
//!
//! The registry is the single writer of every descriptor's `is_loaded`,
//! `load_error` and `state`. A load loop owns one [`DependencyGraph`] for its
//! batch, dispatches every ready module concurrently, and recomputes the
//! ready set each time one settles. Failures never stop the loop; modules
//! that can never become ready are stamped as missing a dependency.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ModuleConfig;
use crate::module::bus::{event_listener, AccessScope, BusEvent, MessageBus, Origin};
use crate::module::dispatcher::{unload_topic, LoadReport, LOAD_COMPLETE_TOPIC};
use crate::module::process::{ProcessExit, Supervisor};
use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};
use crate::module::registry::discovery::ModuleDiscovery;
use crate::module::registry::graph::DependencyGraph;
use crate::module::registry::latch::{LoadLatch, Settlement};
use crate::module::registry::version::{parse_version, VersionRange};
use crate::module::traits::{LoadError, ModuleError, ModuleState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Upper bound on one module's load, from spawn to report
    pub load_timeout: Duration,
    /// Time a worker gets to exit after the unload event
    pub unload_grace: Duration,
    /// Scanned by [`ModuleRegistry::discover`]
    pub modules_dir: Option<PathBuf>,
    /// Only these module ids are picked up by discovery, when set
    pub enabled_modules: Option<Vec<String>>,
    /// Per-module config entries layered over the manifest's
    pub module_configs: HashMap<String, HashMap<String, String>>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            unload_grace: Duration::from_secs(5),
            modules_dir: None,
            enabled_modules: None,
            module_configs: HashMap::new(),
        }
    }
}

impl RegistryOptions {
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            unload_grace: Duration::from_millis(config.unload_grace_ms),
            modules_dir: Some(config.modules_dir.clone()),
            enabled_modules: (!config.enabled_modules.is_empty())
                .then(|| config.enabled_modules.clone()),
            module_configs: config.module_configs.clone(),
        }
    }
}

/// Notifications published by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    StateChanged {
        module_id: ModuleId,
        state: ModuleState,
    },
    Loaded {
        module_id: ModuleId,
        result: Option<Value>,
    },
    Failed {
        module_id: ModuleId,
        error: LoadError,
    },
    Unloaded {
        module_id: ModuleId,
    },
    /// A loaded module's worker died
    Crashed {
        module_id: ModuleId,
        code: Option<i32>,
    },
}

/// Post-load side effects (page registration and the like)
#[async_trait]
pub trait ModuleHooks: Send + Sync {
    async fn on_loaded(&self, _descriptor: &ModuleDescriptor, _result: Option<&Value>) {}

    async fn on_unloaded(&self, _descriptor: &ModuleDescriptor) {}
}

/// Outcome of one load loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub loaded: Vec<ModuleId>,
    pub failed: Vec<(ModuleId, LoadError)>,
}

impl LoadSummary {
    pub fn error_for(&self, module_id: &str) -> Option<&LoadError> {
        self.failed
            .iter()
            .find(|(id, _)| id == module_id)
            .map(|(_, error)| error)
    }
}

struct RegistryInner {
    descriptors: RwLock<Vec<ModuleDescriptor>>,
    bus: MessageBus,
    supervisor: Arc<dyn Supervisor>,
    /// Latches of loads waiting on their settlement
    pending: Mutex<HashMap<ModuleId, Arc<LoadLatch>>>,
    /// Modules owned by a running load loop
    claimed: Mutex<HashSet<ModuleId>>,
    /// Worker generation behind each loaded module
    running: Mutex<HashMap<ModuleId, u64>>,
    events: broadcast::Sender<RegistryEvent>,
    hooks: StdRwLock<Vec<Arc<dyn ModuleHooks>>>,
    options: RegistryOptions,
}

#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl ModuleRegistry {
    /// Create a registry on the coordinator bus
    ///
    /// Installs the load-report listener and starts routing worker exits.
    pub async fn new(
        bus: MessageBus,
        supervisor: Arc<dyn Supervisor>,
        options: RegistryOptions,
    ) -> Result<Self, ModuleError> {
        if !bus.is_coordinator() {
            return Err(ModuleError::InitializationError(
                "the registry needs the coordinator bus".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut exits = supervisor.subscribe_exits();
        let inner = Arc::new(RegistryInner {
            descriptors: RwLock::new(Vec::new()),
            bus: bus.clone(),
            supervisor,
            pending: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
            running: Mutex::new(HashMap::new()),
            events,
            hooks: StdRwLock::new(Vec::new()),
            options,
        });

        let weak = Arc::downgrade(&inner);
        bus.add_event_listener(
            LOAD_COMPLETE_TOPIC,
            AccessScope::unrestricted(),
            event_listener(move |event| {
                if let Some(inner) = weak.upgrade() {
                    ModuleRegistry { inner }.on_load_report(event);
                }
            }),
        )
        .await?;

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                match exits.recv().await {
                    Ok(exit) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ModuleRegistry { inner }.on_exit(exit).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Registry missed {} worker exit notifications", missed)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { inner })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.inner.supervisor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_hooks(&self, hooks: Arc<dyn ModuleHooks>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hooks);
    }

    pub async fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.inner.descriptors.read().await.clone()
    }

    pub async fn descriptor(&self, module_id: &str) -> Option<ModuleDescriptor> {
        self.inner
            .descriptors
            .read()
            .await
            .iter()
            .find(|d| d.id == module_id)
            .cloned()
    }

    // ---- install / discovery ----

    /// Register a module described in code
    pub async fn add_descriptor(&self, mut descriptor: ModuleDescriptor) -> Result<(), ModuleError> {
        let mut descriptors = self.inner.descriptors.write().await;
        if descriptors.iter().any(|d| d.id == descriptor.id) {
            return Err(ModuleError::AlreadyInstalled(descriptor.id));
        }
        descriptor.reset();
        debug!("Registered module {}", descriptor.id);
        descriptors.push(descriptor);
        Ok(())
    }

    /// Install the module found in `module_dir`
    pub async fn install(&self, module_dir: &Path) -> Result<ModuleDescriptor, ModuleError> {
        let root = module_dir.parent().unwrap_or(module_dir);
        let discovered = ModuleDiscovery::new(root).inspect(module_dir)?;
        let descriptor = self.apply_overrides(discovered.into_descriptor());
        self.add_descriptor(descriptor.clone()).await?;
        info!("Installed module {} from {:?}", descriptor.id, module_dir);
        Ok(descriptor)
    }

    /// Scan the modules directory; returns the ids of newly found modules
    pub async fn discover(&self) -> Result<Vec<ModuleId>, ModuleError> {
        let Some(modules_dir) = &self.inner.options.modules_dir else {
            return Err(ModuleError::OperationError(
                "no modules directory configured".to_string(),
            ));
        };

        let mut added = Vec::new();
        for module in ModuleDiscovery::new(modules_dir).discover_modules()? {
            if let Some(enabled) = &self.inner.options.enabled_modules {
                if !enabled.contains(&module.id) {
                    debug!("Module {} not enabled, skipping", module.id);
                    continue;
                }
            }
            let descriptor = self.apply_overrides(module.into_descriptor());
            let id = descriptor.id.clone();
            match self.add_descriptor(descriptor).await {
                Ok(()) => added.push(id),
                Err(ModuleError::AlreadyInstalled(_)) => debug!("Module {} already known", id),
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    fn apply_overrides(&self, mut descriptor: ModuleDescriptor) -> ModuleDescriptor {
        if let Some(overrides) = self.inner.options.module_configs.get(&descriptor.id) {
            descriptor
                .config
                .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        descriptor
    }

    /// Forget a module, unloading it (and its dependants) first
    pub async fn uninstall(&self, module_id: &str) -> Result<ModuleDescriptor, ModuleError> {
        if self.is_claimed(module_id) {
            return Err(ModuleError::OperationError(format!(
                "{} is being loaded",
                module_id
            )));
        }
        let loaded = self
            .descriptor(module_id)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(module_id.to_string()))?
            .is_loaded;
        if loaded {
            self.unload_module(module_id).await?;
        }

        let mut descriptors = self.inner.descriptors.write().await;
        let position = descriptors
            .iter()
            .position(|d| d.id == module_id)
            .ok_or_else(|| ModuleError::ModuleNotFound(module_id.to_string()))?;
        info!("Uninstalled module {}", module_id);
        Ok(descriptors.remove(position))
    }

    // ---- loading ----

    /// Load every module that is neither loaded nor already being loaded
    pub async fn load_all(&self) -> Result<LoadSummary, ModuleError> {
        let ids: Vec<ModuleId> = self
            .inner
            .descriptors
            .read()
            .await
            .iter()
            .filter(|d| !d.is_loaded)
            .map(|d| d.id.clone())
            .collect();
        self.load_modules(&ids).await
    }

    /// Load the given modules in dependency order
    ///
    /// Modules already loaded, or owned by another load loop, are skipped.
    pub async fn load_modules(&self, module_ids: &[ModuleId]) -> Result<LoadSummary, ModuleError> {
        let batch = {
            let mut descriptors = self.inner.descriptors.write().await;
            if let Some(unknown) = module_ids
                .iter()
                .find(|id| !descriptors.iter().any(|d| &d.id == *id))
            {
                return Err(ModuleError::ModuleNotFound(unknown.clone()));
            }

            let mut claimed = self.inner.claimed.lock().unwrap_or_else(PoisonError::into_inner);
            let mut batch = Vec::new();
            for descriptor in descriptors.iter_mut() {
                if !module_ids.contains(&descriptor.id)
                    || descriptor.is_loaded
                    || claimed.contains(&descriptor.id)
                {
                    continue;
                }
                claimed.insert(descriptor.id.clone());
                descriptor.load_error = None;
                descriptor.state = ModuleState::Discovered;
                batch.push(descriptor.clone());
            }
            batch
        };

        let ids: Vec<ModuleId> = batch.iter().map(|d| d.id.clone()).collect();
        info!("Loading {} modules", ids.len());
        let summary = self.drive(batch).await;

        let mut claimed = self.inner.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &ids {
            claimed.remove(id);
        }
        info!(
            "Load finished: {} loaded, {} failed",
            summary.loaded.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    fn is_claimed(&self, module_id: &str) -> bool {
        self.inner
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(module_id)
    }

    async fn drive(&self, batch: Vec<ModuleDescriptor>) -> LoadSummary {
        let known: HashSet<ModuleId> = self
            .inner
            .descriptors
            .read()
            .await
            .iter()
            .map(|d| d.id.clone())
            .collect();
        let mut graph = DependencyGraph::build(&batch, |name| known.contains(name));
        let mut in_flight: HashSet<ModuleId> = HashSet::new();
        let mut running = FuturesUnordered::new();
        let mut summary = LoadSummary::default();

        loop {
            for id in graph.ready(&in_flight) {
                debug!("Dispatching load of {}", id);
                in_flight.insert(id.clone());
                let registry = self.clone();
                running.push(async move {
                    let result = registry.load_one(&id).await;
                    (id, result)
                });
            }

            let Some((id, result)) = running.next().await else {
                break;
            };
            in_flight.remove(&id);
            graph.settle(&id);
            match result {
                Ok(()) => summary.loaded.push(id),
                Err(error) => summary.failed.push((id, error)),
            }
        }

        if !graph.is_empty() {
            for cycle in graph.cycles() {
                warn!("Dependency cycle: {}", cycle.join(" -> "));
            }
            for id in graph.remaining() {
                let dependency = batch
                    .iter()
                    .find(|d| d.id == id)
                    .and_then(|d| {
                        d.dependencies
                            .keys()
                            .find(|dep| !known.contains(*dep))
                            .or_else(|| d.dependencies.keys().find(|dep| graph.contains(dep)))
                    })
                    .cloned();
                let error = LoadError::DependencyMissing { dependency };
                self.fail(&id, error.clone()).await;
                summary.failed.push((id, error));
            }
        }

        summary
    }

    async fn load_one(&self, module_id: &str) -> Result<(), LoadError> {
        let Some(descriptor) = self.descriptor(module_id).await else {
            return Err(LoadError::SpawnFailed {
                message: format!("{} was uninstalled", module_id),
            });
        };

        self.set_state(module_id, ModuleState::CheckingDependencies)
            .await;
        if let Err(error) = self.check_dependencies(&descriptor).await {
            self.fail(module_id, error.clone()).await;
            return Err(error);
        }

        // The latch is in place before the worker exists, so neither an
        // early exit nor an early report can be missed
        self.set_state(module_id, ModuleState::Spawning).await;
        let (latch, mut rx) = LoadLatch::new();
        self.pending().insert(module_id.to_string(), latch.clone());

        let generation = match self.inner.supervisor.spawn(&descriptor).await {
            Ok(generation) => generation,
            Err(e) => {
                self.pending().remove(module_id);
                let error = LoadError::SpawnFailed {
                    message: e.to_string(),
                };
                self.fail(module_id, error.clone()).await;
                return Err(error);
            }
        };
        if let Some(exit) = latch.bind(generation) {
            latch.settle(Settlement::Exited(exit));
        }
        self.set_state(module_id, ModuleState::Loading).await;

        let load_timeout = self.inner.options.load_timeout;
        let settlement = match timeout(load_timeout, &mut rx).await {
            Ok(settlement) => settlement.unwrap_or(Settlement::TimedOut),
            Err(_) => {
                latch.settle(Settlement::TimedOut);
                rx.await.unwrap_or(Settlement::TimedOut)
            }
        };

        let outcome = match settlement {
            Settlement::Reported(report) => report.into_result(),
            Settlement::Exited(exit) => Err(LoadError::WorkerCrash { code: exit.code }),
            Settlement::TimedOut => Err(LoadError::LoadTimeout {
                timeout_ms: u64::try_from(load_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Err(error) => {
                self.pending().remove(module_id);
                self.inner.supervisor.kill(module_id).await;
                self.fail(module_id, error.clone()).await;
                Err(error)
            }
            Ok(result) => {
                let descriptor = self
                    .update(module_id, |d| {
                        d.is_loaded = true;
                        d.load_error = None;
                        d.state = ModuleState::Loaded;
                    })
                    .await;
                self.inner.supervisor.mark_running(module_id);
                let late_exit = {
                    let mut pending = self.pending();
                    pending.remove(module_id);
                    self.running().insert(module_id.to_string(), generation);
                    latch.take_late_exit()
                };

                info!("Module {} loaded", module_id);
                self.emit(RegistryEvent::StateChanged {
                    module_id: module_id.to_string(),
                    state: ModuleState::Loaded,
                });
                self.emit(RegistryEvent::Loaded {
                    module_id: module_id.to_string(),
                    result: result.clone(),
                });
                if let Some(descriptor) = &descriptor {
                    for hooks in self.hooks() {
                        hooks.on_loaded(descriptor, result.as_ref()).await;
                    }
                }

                if let Some(exit) = late_exit.filter(|exit| !exit.killed) {
                    self.mark_crashed(exit).await;
                }
                Ok(())
            }
        }
    }

    async fn check_dependencies(&self, descriptor: &ModuleDescriptor) -> Result<(), LoadError> {
        let descriptors = self.inner.descriptors.read().await;
        for (name, range) in &descriptor.dependencies {
            let Some(dependency) = descriptors.iter().find(|d| &d.id == name) else {
                return Err(LoadError::DependencyMissing {
                    dependency: Some(name.clone()),
                });
            };

            if !dependency.is_loaded {
                return Err(match dependency.load_error {
                    Some(_) => LoadError::DependencyFailed {
                        dependency: name.clone(),
                    },
                    None => LoadError::DependencyUnmet {
                        dependency: name.clone(),
                        reason: "not loaded".to_string(),
                    },
                });
            }

            let unmet = |reason: String| LoadError::DependencyUnmet {
                dependency: name.clone(),
                reason,
            };
            let range = VersionRange::parse(range)
                .map_err(|e| unmet(format!("invalid range {:?}: {}", range, e)))?;
            // Unversioned dependencies satisfy any range
            let Some(version) = dependency.version.as_deref() else {
                continue;
            };
            let version = parse_version(version)
                .map_err(|e| unmet(format!("unparseable version {:?}: {}", version, e)))?;
            if !range.matches(&version) {
                return Err(unmet(format!("version {} does not satisfy {}", version, range)));
            }
        }
        Ok(())
    }

    // ---- unloading ----

    /// Unload a module; loaded dependants are unloaded first
    pub async fn unload_module(&self, module_id: &str) -> Result<(), ModuleError> {
        let descriptor = self
            .descriptor(module_id)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(module_id.to_string()))?;
        if !descriptor.is_loaded {
            return Err(ModuleError::NotLoaded(module_id.to_string()));
        }
        for id in self.unload_order(&[module_id.to_string()]).await {
            self.unload_one(&id).await;
        }
        Ok(())
    }

    /// Unload then load a module, together with the dependants it took down
    pub async fn reload_module(&self, module_id: &str) -> Result<LoadSummary, ModuleError> {
        let descriptor = self
            .descriptor(module_id)
            .await
            .ok_or_else(|| ModuleError::ModuleNotFound(module_id.to_string()))?;
        let mut targets = vec![module_id.to_string()];
        if descriptor.is_loaded {
            targets = self.unload_order(&targets).await;
            for id in &targets {
                self.unload_one(id).await;
            }
        }
        self.load_modules(&targets).await
    }

    /// Unload everything, dependants first
    pub async fn shutdown(&self) {
        let loaded: Vec<ModuleId> = self
            .inner
            .descriptors
            .read()
            .await
            .iter()
            .filter(|d| d.is_loaded)
            .map(|d| d.id.clone())
            .collect();
        info!("Shutting down {} modules", loaded.len());
        for id in self.unload_order(&loaded).await {
            self.unload_one(&id).await;
        }
    }

    /// Loaded modules reachable from `roots` through dependants, in unload order
    async fn unload_order(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        fn visit(
            id: &str,
            loaded: &[ModuleDescriptor],
            seen: &mut HashSet<ModuleId>,
            order: &mut Vec<ModuleId>,
        ) {
            if !seen.insert(id.to_string()) {
                return;
            }
            for dependant in loaded.iter().filter(|d| d.dependencies.contains_key(id)) {
                visit(&dependant.id, loaded, seen, order);
            }
            if loaded.iter().any(|d| d.id == id) {
                order.push(id.to_string());
            }
        }

        let loaded: Vec<ModuleDescriptor> = self
            .inner
            .descriptors
            .read()
            .await
            .iter()
            .filter(|d| d.is_loaded)
            .cloned()
            .collect();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for root in roots {
            visit(root, &loaded, &mut seen, &mut order);
        }
        order
    }

    async fn unload_one(&self, module_id: &str) {
        let descriptor = {
            let mut descriptors = self.inner.descriptors.write().await;
            match descriptors.iter_mut().find(|d| d.id == module_id && d.is_loaded) {
                Some(d) => {
                    d.is_loaded = false;
                    d.state = ModuleState::Unloaded;
                    d.clone()
                }
                None => return,
            }
        };
        self.running().remove(module_id);

        info!("Unloading module {}", module_id);
        if let Err(e) = self
            .inner
            .bus
            .send_event(&unload_topic(module_id), AccessScope::system(), vec![])
            .await
        {
            warn!("Failed to send unload event to {}: {}", module_id, e);
        }
        let exit = self
            .inner
            .supervisor
            .stop(module_id, self.inner.options.unload_grace)
            .await;
        debug!("Module {} worker gone: {:?}", module_id, exit);

        for hooks in self.hooks() {
            hooks.on_unloaded(&descriptor).await;
        }
        self.emit(RegistryEvent::StateChanged {
            module_id: module_id.to_string(),
            state: ModuleState::Unloaded,
        });
        self.emit(RegistryEvent::Unloaded {
            module_id: module_id.to_string(),
        });
    }

    // ---- settlement sources ----

    fn on_load_report(&self, event: &BusEvent) {
        let Some(payload) = event.params.first() else {
            warn!("Load report without payload");
            return;
        };
        let report: LoadReport = match serde_json::from_value(payload.clone()) {
            Ok(report) => report,
            Err(e) => {
                warn!("Malformed load report: {}", e);
                return;
            }
        };

        match &event.origin {
            Origin::Peer(peer) if *peer == report.module_id => {}
            Origin::Local => {}
            other => {
                warn!(
                    "Ignoring load report for {} sent from {:?}",
                    report.module_id, other
                );
                return;
            }
        }

        let module_id = report.module_id.clone();
        let latch = self.pending().get(&module_id).cloned();
        match latch {
            Some(latch) => {
                if !latch.settle(Settlement::Reported(report)) {
                    debug!("Tardy load report from {} ignored", module_id);
                }
            }
            None => debug!("Load report from {} with no load in flight", module_id),
        }
    }

    async fn on_exit(&self, exit: ProcessExit) {
        {
            let pending = self.pending();
            if let Some(latch) = pending.get(&exit.module_id) {
                if !latch.owns(&exit) {
                    debug!(
                        "Exit of {} worker {} does not belong to the load in flight",
                        exit.module_id, exit.generation
                    );
                } else if !latch.settle(Settlement::Exited(exit.clone())) {
                    latch.record_late_exit(exit);
                }
                return;
            }
        }
        if !exit.killed {
            self.mark_crashed(exit).await;
        }
    }

    /// A loaded module's worker died on its own
    async fn mark_crashed(&self, exit: ProcessExit) {
        {
            let mut running = self.running();
            if running.get(&exit.module_id) != Some(&exit.generation) {
                debug!(
                    "Exit of retired {} worker {} ignored",
                    exit.module_id, exit.generation
                );
                return;
            }
            running.remove(&exit.module_id);
        }
        let error = LoadError::WorkerCrash { code: exit.code };
        let descriptor = {
            let mut descriptors = self.inner.descriptors.write().await;
            match descriptors
                .iter_mut()
                .find(|d| d.id == exit.module_id && d.is_loaded)
            {
                Some(d) => {
                    d.is_loaded = false;
                    d.load_error = Some(error.clone());
                    d.state = ModuleState::Failed;
                    d.clone()
                }
                None => return,
            }
        };

        error!("Module {} crashed (code {:?})", exit.module_id, exit.code);
        self.emit(RegistryEvent::StateChanged {
            module_id: exit.module_id.clone(),
            state: ModuleState::Failed,
        });
        self.emit(RegistryEvent::Crashed {
            module_id: exit.module_id.clone(),
            code: exit.code,
        });
        for hooks in self.hooks() {
            hooks.on_unloaded(&descriptor).await;
        }
    }

    // ---- bookkeeping ----

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<ModuleId, Arc<LoadLatch>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<ModuleId, u64>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> Vec<Arc<dyn ModuleHooks>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn update<F>(&self, module_id: &str, f: F) -> Option<ModuleDescriptor>
    where
        F: FnOnce(&mut ModuleDescriptor),
    {
        let mut descriptors = self.inner.descriptors.write().await;
        let descriptor = descriptors.iter_mut().find(|d| d.id == module_id)?;
        f(descriptor);
        Some(descriptor.clone())
    }

    async fn set_state(&self, module_id: &str, state: ModuleState) {
        if self.update(module_id, |d| d.state = state).await.is_some() {
            self.emit(RegistryEvent::StateChanged {
                module_id: module_id.to_string(),
                state,
            });
        }
    }

    async fn fail(&self, module_id: &str, error: LoadError) {
        warn!("Module {} failed to load: {}", module_id, error);
        self.update(module_id, |d| {
            d.is_loaded = false;
            d.load_error = Some(error.clone());
            d.state = ModuleState::Failed;
        })
        .await;
        self.emit(RegistryEvent::StateChanged {
            module_id: module_id.to_string(),
            state: ModuleState::Failed,
        });
        self.emit(RegistryEvent::Failed {
            module_id: module_id.to_string(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::process::InProcessSupervisor;

    async fn registry() -> ModuleRegistry {
        let bus = MessageBus::coordinator();
        let supervisor = Arc::new(InProcessSupervisor::new(bus.clone(), std::env::temp_dir()));
        ModuleRegistry::new(bus, supervisor, RegistryOptions::default())
            .await
            .unwrap()
    }

    fn exit(generation: u64) -> ProcessExit {
        ProcessExit {
            module_id: "a".to_string(),
            generation,
            code: Some(3),
            killed: false,
        }
    }

    fn report_from_worker(report: LoadReport) -> BusEvent {
        BusEvent {
            topic: LOAD_COMPLETE_TOPIC.to_string(),
            metadata: AccessScope::unrestricted(),
            params: vec![serde_json::to_value(&report).unwrap()],
            origin: Origin::Peer(report.module_id.clone()),
        }
    }

    #[tokio::test]
    async fn test_report_after_worker_exit_is_ignored() {
        let registry = registry().await;
        let (latch, rx) = LoadLatch::new();
        assert!(latch.bind(1).is_none());
        registry.pending().insert("a".to_string(), latch.clone());

        registry.on_exit(exit(1)).await;
        registry.on_load_report(&report_from_worker(LoadReport::success("a", None)));

        match rx.await.unwrap() {
            Settlement::Exited(exit) => assert_eq!(exit.code, Some(3)),
            other => panic!("unexpected settlement {:?}", other),
        }
        assert!(latch.take_late_exit().is_none());
    }

    #[tokio::test]
    async fn test_earlier_worker_exit_leaves_pending_load_alone() {
        let registry = registry().await;
        let (latch, mut rx) = LoadLatch::new();
        registry.pending().insert("a".to_string(), latch.clone());

        // Seen before the new worker's spawn returned, and again after
        registry.on_exit(exit(1)).await;
        assert!(latch.bind(2).is_none());
        registry.on_exit(exit(1)).await;
        assert!(rx.try_recv().is_err());

        registry.on_load_report(&report_from_worker(LoadReport::success("a", None)));
        assert!(matches!(rx.await.unwrap(), Settlement::Reported(_)));
    }

    #[tokio::test]
    async fn test_exit_of_replaced_worker_keeps_module_loaded() {
        let registry = registry().await;
        registry
            .add_descriptor(ModuleDescriptor::new("a", "a"))
            .await
            .unwrap();
        registry
            .update("a", |d| {
                d.is_loaded = true;
                d.state = ModuleState::Loaded;
            })
            .await;
        registry.running().insert("a".to_string(), 2);

        registry.on_exit(exit(1)).await;
        assert!(registry.descriptor("a").await.unwrap().is_loaded);

        registry.on_exit(exit(2)).await;
        let a = registry.descriptor("a").await.unwrap();
        assert!(!a.is_loaded);
        assert_eq!(a.load_error, Some(LoadError::WorkerCrash { code: Some(3) }));
    }
}
