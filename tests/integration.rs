//! Integration tests for llamactl-core.
//!
//! These drive the registry, activator, and proxy against a real spawned
//! child process (`tests/mock_server`, a tiny stand-in backend that binds
//! the port it's given and answers 200 OK to everything) rather than
//! mocking `ChildHandle`. Grounded in the teacher's `tests/integration.rs`,
//! which does the same against its own `tests/mock_server` helper binary.
//!
//! `tests/mock_server` is a separate, non-workspace package (mirroring the
//! teacher's layout); build it once with
//! `cargo build --release --manifest-path tests/mock_server/Cargo.toml`
//! before running these.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use llamactl_core::activator::Activator;
use llamactl_core::api::Dispatcher;
use llamactl_core::config::{BackendKind, Config};
use llamactl_core::download::DownloadEngine;
use llamactl_core::error::ErrorKind;
use llamactl_core::instance::{InstanceOptions, InstanceStatus, OptionValue};
use llamactl_core::proxy::ProxyServer;
use llamactl_core::registry::Registry;
use llamactl_core::store::InMemoryInstanceStore;

/// Path to the prebuilt mock backend binary, mirroring the teacher's
/// `mock_server_path()` convention of a path into a sibling, separately
/// built Cargo project.
fn mock_backend_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/mock_server/target/release/mock-backend")
}

fn test_config(cache_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.cache_dir.cache_dir = cache_dir.join("models").to_string_lossy().to_string();
    config.cache_dir.log_dir = cache_dir.join("logs").to_string_lossy().to_string();
    config
}

fn mock_options(on_demand: bool, idle_timeout_minutes: u64) -> InstanceOptions {
    InstanceOptions {
        backend: BackendKind::LlamaCpp,
        command_override: Some(mock_backend_path().to_string_lossy().to_string()),
        on_demand_start: on_demand,
        idle_timeout_minutes,
        ..Default::default()
    }
}

fn new_registry(config: Config) -> Arc<Registry> {
    Arc::new(Registry::new(
        Arc::new(config),
        Arc::new(InMemoryInstanceStore::new()),
        None,
    ))
}

/// Binds an ephemeral port synchronously and returns its address, then
/// drops the listener so `ProxyServer::run` can rebind it. Small race in
/// theory; in practice nothing else claims a freshly-closed loopback port
/// before the next line runs.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    listener.local_addr().expect("local addr")
}

#[tokio::test]
async fn create_start_stop_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));

    registry.create("llama-a", mock_options(false, 0)).unwrap();
    let view = registry.start("llama-a").await.unwrap();
    assert_eq!(view.status, InstanceStatus::Ready);
    assert!(view.port.is_some());

    let view = registry.stop("llama-a").await.unwrap();
    assert_eq!(view.status, InstanceStatus::Stopped);
    assert!(view.port.is_none());
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));

    registry.create("llama-a", mock_options(false, 0)).unwrap();
    let err = registry.create("llama-a", mock_options(false, 0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrDuplicate);
}

#[tokio::test]
async fn delete_requires_stopped_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));

    registry.create("llama-a", mock_options(false, 0)).unwrap();
    registry.start("llama-a").await.unwrap();

    let err = registry.delete("llama-a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrRunning);

    registry.stop("llama-a").await.unwrap();
    registry.delete("llama-a").await.unwrap();
    assert_eq!(registry.get("llama-a").unwrap_err().kind, ErrorKind::ErrNotFound);
}

#[tokio::test]
async fn max_instances_quota_is_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.server.max_instances = 1;
    let registry = new_registry(config);

    registry.create("llama-a", mock_options(false, 0)).unwrap();
    let err = registry.create("llama-b", mock_options(false, 0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrQuotaInstances);
}

#[tokio::test]
async fn on_demand_activation_starts_a_stopped_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    registry.create("llama-a", mock_options(true, 0)).unwrap();

    let activator = Activator::new(Arc::clone(&registry));
    let view = activator.ensure_ready("llama-a").await.unwrap();
    assert_eq!(view.status, InstanceStatus::Ready);
}

#[tokio::test]
async fn activation_fails_fast_when_on_demand_start_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    registry.create("llama-a", mock_options(false, 0)).unwrap();

    let activator = Activator::new(Arc::clone(&registry));
    let err = activator.ensure_ready("llama-a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrNotRunning);
}

#[tokio::test]
async fn lru_eviction_makes_room_under_running_cap() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.server.max_running_instances = 1;
    config.server.enable_lru_eviction = true;
    let registry = new_registry(config);

    registry.create("llama-a", mock_options(true, 60)).unwrap();
    registry.create("llama-b", mock_options(true, 60)).unwrap();

    let activator = Activator::new(Arc::clone(&registry));
    activator.ensure_ready("llama-a").await.unwrap();
    assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Ready);

    // llama-a is the only idle-eviction candidate, so activating llama-b
    // must evict it to stay within max_running_instances=1.
    let view_b = activator.ensure_ready("llama-b").await.unwrap();
    assert_eq!(view_b.status, InstanceStatus::Ready);
    assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn running_cap_without_eviction_candidate_rejects_activation() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.server.max_running_instances = 1;
    config.server.enable_lru_eviction = false;
    let registry = new_registry(config);

    // idle_timeout_minutes=0 means llama-a is never an eviction candidate.
    registry.create("llama-a", mock_options(true, 0)).unwrap();
    registry.create("llama-b", mock_options(true, 0)).unwrap();

    let activator = Activator::new(Arc::clone(&registry));
    activator.ensure_ready("llama-a").await.unwrap();

    let err = activator.ensure_ready("llama-b").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrRunningCap);
}

#[tokio::test]
async fn auto_restart_recovers_a_crashing_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.server.on_demand_start_timeout_secs = 2;
    let registry = new_registry(config);

    let mut options = mock_options(false, 0);
    options.auto_restart = true;
    options.max_restarts = 3;
    options.restart_delay_seconds = 1;
    let mut env = HashMap::new();
    env.insert("FAIL_IMMEDIATELY".to_string(), "1".to_string());
    options
        .backend_options
        .insert("environment".to_string(), OptionValue::Map(env));

    registry.create("llama-a", options).unwrap();

    // The mock backend exits instantly, so the port never opens and
    // start() times out waiting for readiness.
    let err = registry.start("llama-a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrReadinessTimeout);

    // maybe_schedule_restart() fires in the background on that failure;
    // give it a beat to move past `error` into a restart attempt.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = registry.get("llama-a").unwrap().status;
    assert!(matches!(
        status,
        InstanceStatus::Restarting | InstanceStatus::Starting | InstanceStatus::Error | InstanceStatus::Failed
    ));
}

#[tokio::test]
async fn proxy_forwards_requests_to_the_backing_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    registry.create("llama-a", mock_options(false, 0)).unwrap();
    registry.start("llama-a").await.unwrap();

    let activator = Arc::new(Activator::new(Arc::clone(&registry)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(registry.config()),
        Arc::new(DownloadEngine::new(tmp.path().join("models"), "test")),
    ));

    let addr = free_addr().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = ProxyServer::new(addr, Arc::clone(&registry), activator, dispatcher, shutdown_rx);
    let proxy_handle = tokio::spawn(proxy.run());

    // Give the listener a moment to actually rebind the freed port.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/api/v1/instances/llama-a/proxy/hello"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("/hello"));

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), proxy_handle).await;
}

#[tokio::test]
async fn proxy_rejects_unknown_instance_with_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    let activator = Arc::new(Activator::new(Arc::clone(&registry)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(registry.config()),
        Arc::new(DownloadEngine::new(tmp.path().join("models"), "test")),
    ));

    let addr = free_addr().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = ProxyServer::new(addr, Arc::clone(&registry), activator, dispatcher, shutdown_rx);
    let proxy_handle = tokio::spawn(proxy.run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/api/v1/instances/does-not-exist/proxy/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), proxy_handle).await;
}

#[tokio::test]
async fn download_job_rejects_repo_without_owner_segment() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(DownloadEngine::new(tmp.path().to_path_buf(), "test"));
    let err = engine.start_download("no-slash-here", None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrManifestMalformed);
}

#[tokio::test]
async fn download_job_can_be_cancelled_before_it_resolves_a_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(DownloadEngine::new(tmp.path().to_path_buf(), "test"));
    let job = engine.start_download("owner/repo", Some("v1")).unwrap();
    assert_eq!(job.tag, "v1");

    engine.cancel_job(&job.id).unwrap();
    // The job's own HTTP attempt fails against no real network in a
    // sandboxed test environment anyway; cancellation just needs to be
    // observable and not panic the job-tracking machinery.
    let fetched = engine.get_job(&job.id).unwrap();
    assert_eq!(fetched.id, job.id);
}

#[tokio::test]
async fn update_restarts_a_running_instance_with_new_options() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    registry.create("llama-a", mock_options(false, 0)).unwrap();
    registry.start("llama-a").await.unwrap();

    let mut updated = mock_options(false, 0);
    updated.idle_timeout_minutes = 42;
    let view = registry.update("llama-a", updated).await.unwrap();

    assert_eq!(view.status, InstanceStatus::Ready);
    assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Ready);
}

#[tokio::test]
async fn invalid_instance_name_is_rejected_before_anything_is_created() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = new_registry(test_config(tmp.path()));
    let err = registry.create("has a space", mock_options(false, 0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ErrInvalidName);
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn boot_load_auto_restarts_only_previously_ready_instances() {
    use llamactl_core::store::{InstanceRecord, InstanceStore};

    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(tmp.path()));
    let store = Arc::new(InMemoryInstanceStore::new());

    // Pre-seed the store as if a previous process had crashed while one
    // instance was `ready` (auto_restart=true) and another was `error`
    // (auto_restart=true too) — only the `ready` one should come back.
    let mut ready_options = mock_options(false, 0);
    ready_options.auto_restart = true;
    store
        .save(&InstanceRecord {
            name: "llama-a".to_string(),
            options: ready_options,
            status: InstanceStatus::Ready,
            port: None,
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let mut error_options = mock_options(false, 0);
    error_options.auto_restart = true;
    store
        .save(&InstanceRecord {
            name: "llama-b".to_string(),
            options: error_options,
            status: InstanceStatus::Error,
            port: None,
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let registry = Arc::new(Registry::new(config, store, None));
    registry.load().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Ready);
    assert_eq!(registry.get("llama-b").unwrap().status, InstanceStatus::Stopped);

    registry.stop("llama-a").await.ok();
}
