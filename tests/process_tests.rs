//! Worker processes: the echo module binary under a real supervisor

mod common;

use common::wait_for_event;
use modhost::module::bus::{AccessScope, MessageBus};
use modhost::module::process::{ProcessSupervisor, Supervisor};
use modhost::module::registry::{ModuleRegistry, RegistryEvent, RegistryOptions};
use modhost::module::{LoadError, ModuleState};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ECHO_BIN: &str = env!("CARGO_BIN_EXE_modhost-echo-module");

fn write_module(root: &Path, id: &str, extra: &str) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("module.toml"),
        format!(
            "name = \"{id}\"\nversion = \"1.0.0\"\nentry_point = {bin:?}\n{extra}",
            id = id,
            bin = ECHO_BIN,
            extra = extra
        ),
    )
    .unwrap();
}

struct Host {
    _dirs: TempDir,
    bus: MessageBus,
    supervisor: Arc<ProcessSupervisor>,
    registry: ModuleRegistry,
}

async fn host(modules: &[(&str, &str)]) -> Host {
    let dirs = tempfile::tempdir().unwrap();
    let modules_dir = dirs.path().join("modules");
    for (id, extra) in modules {
        write_module(&modules_dir, id, extra);
    }

    let bus = MessageBus::coordinator();
    let supervisor = Arc::new(ProcessSupervisor::new(bus.clone(), dirs.path().join("data")));
    let registry = ModuleRegistry::new(
        bus.clone(),
        supervisor.clone(),
        RegistryOptions {
            load_timeout: Duration::from_secs(10),
            unload_grace: Duration::from_secs(2),
            modules_dir: Some(modules_dir),
            ..RegistryOptions::default()
        },
    )
    .await
    .unwrap();
    registry.discover().await.unwrap();

    Host {
        _dirs: dirs,
        bus,
        supervisor,
        registry,
    }
}

#[tokio::test]
async fn test_echo_workers_load_in_order_and_route_requests() {
    let host = host(&[
        ("server", ""),
        (
            "client",
            "[dependencies]\nserver = \"^1\"\n[config]\ncall = \"echo.server\"\n",
        ),
    ])
    .await;
    let mut events = host.registry.subscribe();

    let summary = host.registry.load_all().await.unwrap();
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);

    let event = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, RegistryEvent::Loaded { module_id, .. } if module_id == "client")
    })
    .await;
    assert_eq!(
        event,
        RegistryEvent::Loaded {
            module_id: "client".to_string(),
            result: Some(json!({
                "called": "echo.server",
                "answer": { "from": "server", "params": ["client"] }
            })),
        }
    );

    let reply = host
        .bus
        .send_request("echo.client", AccessScope::unrestricted(), vec![json!("hi")])
        .await
        .unwrap();
    assert_eq!(reply, json!({ "from": "client", "params": ["hi"] }));

    host.registry.shutdown().await;
    assert!(host.supervisor.workers().is_empty());
    assert_eq!(
        host.registry.descriptor("server").await.unwrap().state,
        ModuleState::Unloaded
    );
}

#[tokio::test]
async fn test_crash_during_load_fails_module_and_dependants() {
    let host = host(&[
        ("crasher", "[config]\nmode = \"crash\"\n"),
        ("dependant", "[dependencies]\ncrasher = \"*\"\n"),
    ])
    .await;

    let summary = host.registry.load_all().await.unwrap();
    assert_eq!(
        summary.error_for("crasher"),
        Some(&LoadError::WorkerCrash { code: Some(3) })
    );
    assert_eq!(
        summary.error_for("dependant"),
        Some(&LoadError::DependencyFailed {
            dependency: "crasher".to_string()
        })
    );
    assert!(host.bus.peer_ids().await.is_empty());
}

#[tokio::test]
async fn test_reported_failure_keeps_its_name() {
    let host = host(&[("failing", "[config]\nmode = \"fail\"\n")]).await;

    let summary = host.registry.load_all().await.unwrap();
    match summary.error_for("failing") {
        Some(LoadError::ModuleFailure { name, message }) => {
            assert_eq!(name, "InitializationError");
            assert!(message.contains("configured to fail"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_crash_after_load_is_surfaced() {
    let host = host(&[("flaky", "[config]\nmode = \"crash-later\"\n"), ("steady", "")]).await;
    let mut events = host.registry.subscribe();

    let summary = host.registry.load_all().await.unwrap();
    assert_eq!(summary.loaded.len(), 2);

    let event = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, RegistryEvent::Crashed { .. })
    })
    .await;
    assert_eq!(
        event,
        RegistryEvent::Crashed {
            module_id: "flaky".to_string(),
            code: Some(4)
        }
    );
    assert!(host.registry.descriptor("steady").await.unwrap().is_loaded);
    assert_eq!(
        host.registry.descriptor("flaky").await.unwrap().load_error,
        Some(LoadError::WorkerCrash { code: Some(4) })
    );

    host.registry.shutdown().await;
}

#[tokio::test]
async fn test_missing_binary_is_a_spawn_failure() {
    let dirs = tempfile::tempdir().unwrap();
    let module_dir = dirs.path().join("ghost");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join("module.toml"),
        "name = \"ghost\"\nentry_point = \"does-not-exist\"\n",
    )
    .unwrap();

    let bus = MessageBus::coordinator();
    let supervisor = Arc::new(ProcessSupervisor::new(bus.clone(), dirs.path().join("data")));
    let registry = ModuleRegistry::new(bus, supervisor.clone(), RegistryOptions::default())
        .await
        .unwrap();
    registry.install(&module_dir).await.unwrap();

    let summary = registry.load_all().await.unwrap();
    assert!(matches!(
        summary.error_for("ghost"),
        Some(LoadError::SpawnFailed { .. })
    ));
    assert_eq!(supervisor.worker_state("ghost"), None);
}
