//! Instance Registry (C4) — owns the set of instances keyed by name,
//! enforces quotas, persists records, and drives start/stop/restart
//! transitions through the collaborators a transition needs (port
//! allocator, process runner, docker manager).
//!
//! Grounded in the teacher's `ProcessManager`: a concurrent map of
//! per-instance state guarded by per-entry locks, plus a shared
//! `RwLock`-guarded map for fast listing. Generalized from the teacher's
//! fixed one-backend-per-host config to named, created/destroyed instances
//! with persisted records and quota checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::docker::SharedDockerManager;
use crate::error::{self, Error};
use crate::instance::{
    self, validate_name, Instance, InstanceOptions, InstanceStatus, ReadyEvent,
};
use crate::port::PortAllocator;
use crate::process::{assemble_command_line, spawn_local, spawn_log_drain, ChildHandle, ExitReason, RotatingWriter};
use crate::store::{InstanceRecord, InstanceStore};

/// A read-only view of one instance, for API responses and registry
/// callers that shouldn't reach into `Instance` internals directly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceView {
    pub name: String,
    pub options: InstanceOptions,
    pub status: InstanceStatus,
    pub port: Option<u16>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub restart_count: u32,
}

/// Owns every instance, the port pool, and the persistence layer.
pub struct Registry {
    instances: DashMap<String, Arc<Instance>>,
    config: Arc<Config>,
    ports: Arc<PortAllocator>,
    store: Arc<dyn InstanceStore>,
    docker: Option<SharedDockerManager>,
}

impl Registry {
    pub fn new(config: Arc<Config>, store: Arc<dyn InstanceStore>, docker: Option<SharedDockerManager>) -> Self {
        let ports = Arc::new(PortAllocator::new(config.server.port_range_low, config.server.port_range_high));
        Self {
            instances: DashMap::new(),
            config,
            ports,
            store,
            docker,
        }
    }

    pub fn ports(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }

    /// Boot-time load: re-register ports, re-hydrate records, and
    /// auto-start the ones whose last-persisted status was `ready` and
    /// `auto_restart` is true (DESIGN.md Open Question #3 — `error`/`failed`
    /// records stay `stopped` until a user intervenes).
    pub async fn load(self: &Arc<Self>) -> anyhow::Result<()> {
        let records = self.store.load_all()?;
        let mut to_autostart = Vec::new();

        for record in records {
            // Explicit (non-auto) ports are a static reservation across
            // instances; check-and-release since nothing is actually
            // running yet (every loaded instance starts `stopped`).
            if record.options.port != 0 {
                if let Err(e) = self.ports.acquire_specific(record.options.port) {
                    error!(name = %record.name, port = record.options.port, error = %e, "port conflict on boot, skipping instance");
                    continue;
                }
                self.ports.release(record.options.port);
            }

            let instance = Arc::new(Instance::new(record.name.clone(), record.options.clone()));
            // Boot always starts from `stopped`; a persisted `ready` status
            // just means "eligible for auto-restart below", not "still running".
            instance.set_status(InstanceStatus::Stopped);
            self.instances.insert(record.name.clone(), Arc::clone(&instance));

            if record.status == InstanceStatus::Ready && record.options.auto_restart {
                to_autostart.push(record.name.clone());
            }
        }

        for name in to_autostart {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = registry.start(&name).await {
                    warn!(name, error = %e, "boot-time auto-restart failed");
                }
            });
        }

        Ok(())
    }

    pub fn list(&self) -> Vec<InstanceView> {
        self.instances.iter().map(|e| view_of(e.value())).collect()
    }

    pub fn get(&self, name: &str) -> Result<InstanceView, Error> {
        self.instances
            .get(name)
            .map(|e| view_of(e.value()))
            .ok_or_else(|| error::not_found(format!("instance '{name}' does not exist")))
    }

    fn instance_handle(&self, name: &str) -> Result<Arc<Instance>, Error> {
        self.instances
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| error::not_found(format!("instance '{name}' does not exist")))
    }

    pub fn create(&self, name: &str, mut options: InstanceOptions) -> Result<InstanceView, Error> {
        validate_name(name)?;
        options.validate()?;

        if self.instances.contains_key(name) {
            return Err(error::duplicate(format!("instance '{name}' already exists")));
        }

        if self.config.server.max_instances >= 0 && self.instances.len() as i64 >= self.config.server.max_instances {
            return Err(error::quota_instances("max_instances quota reached"));
        }

        if options.port != 0 {
            self.ports.acquire_specific(options.port)?;
            self.ports.release(options.port); // held only once the instance actually starts
        }

        let instance = Arc::new(Instance::new(name.to_string(), options));
        self.instances.insert(name.to_string(), Arc::clone(&instance));
        self.persist(&instance);

        Ok(view_of(&instance))
    }

    pub async fn update(&self, name: &str, mut options: InstanceOptions) -> Result<InstanceView, Error> {
        options.validate()?;
        let instance = self.instance_handle(name)?;
        let was_running = instance.status().counts_as_running();

        if was_running {
            self.stop(name).await?;
        }

        *instance.options.write() = options;
        self.persist(&instance);

        if was_running {
            self.start(name).await?;
        }

        Ok(view_of(&instance))
    }

    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        let instance = self.instance_handle(name)?;
        if instance.status() != InstanceStatus::Stopped {
            return Err(error::running(format!("instance '{name}' must be stopped before delete")));
        }
        instance.cancel_pending_restart();
        self.instances.remove(name);
        if let Err(e) = self.store.remove(name) {
            warn!(name, error = %e, "failed to remove persisted instance record");
        }
        Ok(())
    }

    fn persist(&self, instance: &Instance) {
        let record = InstanceRecord {
            name: instance.name.clone(),
            options: instance.options_snapshot(),
            status: instance.status(),
            port: instance.port(),
            created_at: instance.created_at,
        };
        if let Err(e) = self.store.save(&record) {
            error!(name = %instance.name, error = %e, "failed to persist instance record");
        }
    }

    /// `start()`: stopped → starting → (ready|failed). Concurrent calls on
    /// an already-starting instance are serialized by `transition_lock` and
    /// converge on the same in-flight attempt's outcome.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<InstanceView, Error> {
        let instance = self.instance_handle(name)?;
        let _guard = instance.transition_lock.lock().await;

        match instance.status() {
            InstanceStatus::Ready => return Ok(view_of(&instance)),
            InstanceStatus::Starting | InstanceStatus::Restarting => {
                let mut rx = instance.subscribe_ready();
                drop(_guard);
                match rx.recv().await {
                    Ok(ReadyEvent::Ready) => return Ok(view_of(&instance)),
                    _ => return Err(error::readiness_timeout(format!("instance '{name}' failed to become ready"))),
                }
            }
            _ => {}
        }

        if self.config.server.max_running_instances >= 0 {
            let running = self.count_running();
            if running >= self.config.server.max_running_instances as usize {
                return Err(error::running_cap("max_running_instances reached"));
            }
        }

        self.start_locked(&instance).await
    }

    /// The actual starting→ready/failed transition, assumed to run with
    /// `transition_lock` already held by the caller (registry::start or
    /// the activator, which acquires the cap under its own lock first).
    pub async fn start_locked(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<InstanceView, Error> {
        instance.set_status(InstanceStatus::Starting);
        let options = instance.options_snapshot();

        let port = if options.port != 0 {
            self.ports.acquire_specific(options.port)?;
            options.port
        } else {
            self.ports.acquire()?
        };
        *instance.port.lock() = Some(port);

        if let Err(e) = self.spawn_backend(instance, &options, port).await {
            self.ports.release(port);
            *instance.port.lock() = None;
            instance.set_status(InstanceStatus::Error);
            instance.notify_failed(e.message.clone());
            self.persist(instance);
            self.maybe_schedule_restart(instance);
            return Err(e);
        }

        self.persist(instance);

        let backend = options.backend;
        let readiness_path = self.config.backend_config(backend).readiness_path.clone();
        let deadline = Duration::from_secs(self.config.server.on_demand_start_timeout_secs);

        let became_ready = tokio::time::timeout(deadline, async {
            loop {
                if instance::probe_ready(port, backend, readiness_path.as_deref()).await {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .unwrap_or(false);

        if became_ready {
            instance.set_status(InstanceStatus::Ready);
            instance.touch();
            instance.restart_count.store(0, std::sync::atomic::Ordering::SeqCst);
            instance.notify_ready();
            self.persist(instance);
            self.spawn_supervisor(Arc::clone(instance));
            if options.idle_timeout_minutes > 0 {
                self.spawn_idle_timer(Arc::clone(instance));
            }
            Ok(view_of(instance))
        } else {
            instance.set_status(InstanceStatus::Error);
            self.stop_child(instance).await;
            self.ports.release(port);
            *instance.port.lock() = None;
            instance.notify_failed("readiness probe timed out");
            self.persist(instance);
            self.maybe_schedule_restart(instance);
            Err(error::readiness_timeout(format!(
                "instance '{}' did not become ready within {}s",
                instance.name, self.config.server.on_demand_start_timeout_secs
            )))
        }
    }

    async fn spawn_backend(&self, instance: &Instance, options: &InstanceOptions, port: u16) -> Result<(), Error> {
        let backend_config = self.config.backend_config(options.backend);

        if options.docker_enabled {
            let docker = self.docker.clone().ok_or_else(|| {
                error::spawn("docker_enabled=true but no docker manager is configured")
            })?;
            let (_, args, env) = assemble_command_line(options, backend_config, port);
            let container_id = docker
                .start_container(&backend_config.docker, &instance.name, port, &args, &env)
                .await
                .map_err(|e| error::spawn(format!("docker start failed: {e}")))?;
            let log_shutdown = docker.stream_logs(container_id.clone(), instance.name.clone());
            *instance.child.lock().await = Some(ChildHandle::Docker {
                container_id,
                docker,
                log_shutdown: Some(log_shutdown),
            });
            return Ok(());
        }

        let (program, args, env) = assemble_command_line(options, backend_config, port);
        let log_dir = std::path::PathBuf::from(&self.config.cache_dir.log_dir);
        let mut child = spawn_local(&program, &args, &env, None)?;

        let max_bytes = self.config.log_rotation.max_size_mb * 1024 * 1024;
        let compress = self.config.log_rotation.compress && self.config.log_rotation.enabled;
        let log_path = log_dir.join(format!("{}.log", instance.name));

        if let Some(stdout) = child.stdout.take() {
            if let Ok(writer) = RotatingWriter::open(log_path.clone(), max_bytes, compress).await {
                spawn_log_drain(instance.name.clone(), tokio::io::BufReader::new(stdout), writer);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            if let Ok(writer) = RotatingWriter::open(log_path, max_bytes, compress).await {
                spawn_log_drain(instance.name.clone(), tokio::io::BufReader::new(stderr), writer);
            }
        }

        *instance.child.lock().await = Some(ChildHandle::Local(child));
        Ok(())
    }

    /// Waits for unexpected exit while `ready` and raises the exit event.
    fn spawn_supervisor(self: &Arc<Self>, instance: Arc<Instance>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let reason = {
                let mut guard = instance.child.lock().await;
                match guard.as_mut() {
                    Some(handle) => handle.wait().await,
                    None => return,
                }
            };

            if instance.status() != InstanceStatus::Ready {
                // Expected — this exit was caused by `stop()`.
                return;
            }

            match reason {
                ExitReason::Exited(status) => {
                    warn!(name = %instance.name, status, "instance exited unexpectedly while ready");
                    let _guard = instance.transition_lock.lock().await;
                    if instance.status() != InstanceStatus::Ready {
                        return;
                    }
                    instance.set_status(InstanceStatus::Error);
                    if let Some(port) = instance.port() {
                        registry.ports.release(port);
                    }
                    *instance.port.lock() = None;
                    registry.persist(&instance);
                    registry.maybe_schedule_restart(&instance);
                }
                ExitReason::Stopped => {}
            }
        });
    }

    fn spawn_idle_timer(self: &Arc<Self>, instance: Arc<Instance>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let minutes = instance.options_snapshot().idle_timeout_minutes;
                if minutes == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                if instance.status() != InstanceStatus::Ready {
                    return;
                }
                if instance.idle_since().elapsed() >= Duration::from_secs(minutes * 60) {
                    info!(name = %instance.name, "idle timeout reached, stopping instance");
                    let _ = registry.stop(&instance.name).await;
                    return;
                }
            }
        });
    }

    /// Error → restarting (if `auto_restart` and `restarts < max_restarts`)
    /// → starting, after `restart_delay_seconds`. Exceeding the cap → failed.
    fn maybe_schedule_restart(self: &Arc<Self>, instance: &Arc<Instance>) {
        let options = instance.options_snapshot();
        if !options.auto_restart {
            return;
        }
        let count = instance.restart_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if options.max_restarts != 0 && count > options.max_restarts {
            instance.set_status(InstanceStatus::Failed);
            self.persist(instance);
            return;
        }

        instance.set_status(InstanceStatus::Restarting);
        self.persist(instance);

        let flag = instance::CancelFlag::new();
        *instance.restart_cancel.lock() = Some(flag.clone());

        let registry = Arc::clone(self);
        let instance = Arc::clone(instance);
        let delay = Duration::from_secs(options.restart_delay_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.is_cancelled() {
                return;
            }
            let _guard = instance.transition_lock.lock().await;
            if instance.status() != InstanceStatus::Restarting {
                return;
            }
            drop(_guard);
            if let Err(e) = registry.start_locked(&instance).await {
                warn!(name = %instance.name, error = %e, "scheduled restart failed");
            }
        });
    }

    /// `stop()`: any non-terminal → stopped. Signals the process, waits up
    /// to a deadline, frees the port, cancels timers. Guarantees no further
    /// automatic start occurs once this returns.
    pub async fn stop(&self, name: &str) -> Result<InstanceView, Error> {
        let instance = self.instance_handle(name)?;
        let _guard = instance.transition_lock.lock().await;

        if instance.status() == InstanceStatus::Stopped {
            return Err(error::not_running(format!("instance '{name}' is already stopped")));
        }

        instance.cancel_pending_restart();
        self.stop_child(&instance).await;

        if let Some(port) = instance.port() {
            self.ports.release(port);
        }
        *instance.port.lock() = None;
        instance.set_status(InstanceStatus::Stopped);
        self.persist(&instance);
        Ok(view_of(&instance))
    }

    async fn stop_child(&self, instance: &Instance) {
        let mut guard = instance.child.lock().await;
        if let Some(mut handle) = guard.take() {
            handle.signal_stop(Duration::from_secs(10)).await;
        }
    }

    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<InstanceView, Error> {
        if self.instance_handle(name)?.status() != InstanceStatus::Stopped {
            self.stop(name).await?;
        }
        self.start(name).await
    }

    pub async fn logs(&self, name: &str, n_lines: usize) -> Result<String, Error> {
        let _instance = self.instance_handle(name)?;
        let log_path = std::path::PathBuf::from(&self.config.cache_dir.log_dir).join(format!("{name}.log"));
        let contents = tokio::fs::read_to_string(&log_path)
            .await
            .unwrap_or_default();
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(n_lines);
        Ok(lines[start..].join("\n"))
    }

    pub fn count_running(&self) -> usize {
        self.instances
            .iter()
            .filter(|e| e.value().status().counts_as_running())
            .count()
    }

    /// Ready instances eligible for LRU eviction (idle_timeout_minutes > 0),
    /// oldest last-request-time first — used by the activator (C5).
    pub fn lru_eviction_candidates(&self) -> Vec<Arc<Instance>> {
        let mut candidates: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .filter(|e| {
                let i = e.value();
                i.status() == InstanceStatus::Ready && i.options_snapshot().idle_timeout_minutes > 0
            })
            .map(|e| Arc::clone(e.value()))
            .collect();
        candidates.sort_by_key(|i| i.idle_since());
        candidates
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Graceful shutdown: signal stop to every instance in parallel, one
    /// per-instance deadline, waiting for each to exit before returning.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::new();
        for name in names {
            if let Ok(instance) = self.instance_handle(&name) {
                if instance.status() == InstanceStatus::Stopped {
                    continue;
                }
                tasks.push(tokio::spawn(async move {
                    instance.cancel_pending_restart();
                    let mut guard = instance.child.lock().await;
                    if let Some(mut handle) = guard.take() {
                        handle.signal_stop(Duration::from_secs(10)).await;
                    }
                }));
            }
        }
        for t in tasks {
            let _ = t.await;
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

fn view_of(instance: &Instance) -> InstanceView {
    InstanceView {
        name: instance.name.clone(),
        options: instance.options_snapshot(),
        status: instance.status(),
        port: instance.port(),
        created_at: instance.created_at,
        restart_count: instance.restart_count.load(std::sync::atomic::Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::store::InMemoryInstanceStore;

    fn make_registry() -> Arc<Registry> {
        let config = Arc::new(Config::default());
        let store = Arc::new(InMemoryInstanceStore::new());
        Arc::new(Registry::new(config, store, None))
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let registry = make_registry();
        registry.create("llama-a", InstanceOptions::default()).unwrap();
        let err = registry.create("llama-a", InstanceOptions::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrDuplicate);
    }

    #[test]
    fn create_rejects_invalid_name() {
        let registry = make_registry();
        let err = registry.create("bad;name", InstanceOptions::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrInvalidName);
    }

    #[test]
    fn create_enforces_max_instances_quota() {
        let mut config = Config::default();
        config.server.max_instances = 1;
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = Arc::new(Registry::new(Arc::new(config), store, None));
        registry.create("a", InstanceOptions::default()).unwrap();
        let err = registry.create("b", InstanceOptions::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrQuotaInstances);
    }

    #[tokio::test]
    async fn delete_requires_stopped_status() {
        let registry = make_registry();
        registry.create("llama-a", InstanceOptions::default()).unwrap();
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Ready);
        let err = registry.delete("llama-a").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrRunning);
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Stopped);
        registry.delete("llama-a").await.unwrap();
        assert!(registry.get("llama-a").is_err());
    }

    #[tokio::test]
    async fn stop_twice_returns_not_running_on_second_call() {
        let registry = make_registry();
        registry.create("llama-a", InstanceOptions::default()).unwrap();
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Ready);
        registry.stop("llama-a").await.unwrap();
        let err = registry.stop("llama-a").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrNotRunning);
        assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Stopped);
    }

    #[test]
    fn docker_enabled_mutually_exclusive_with_command_override_surfaces_as_invalid_options() {
        let registry = make_registry();
        let options = InstanceOptions {
            backend: BackendKind::LlamaCpp,
            docker_enabled: true,
            command_override: Some("/bin/true".to_string()),
            ..Default::default()
        };
        let err = registry.create("llama-a", options).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrInvalidOptions);
    }
}
