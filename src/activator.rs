//! On-Demand Activator (C5) — serializes concurrent requests that arrive
//! while an instance is starting, and evicts an LRU idle instance when the
//! running cap is reached.
//!
//! Grounded in the teacher's `ensure_backend_ready`/`wait_for_ready`
//! (`src/proxy.rs`): a broadcast-channel single-flight wait with a timeout.
//! Generalized with victim selection under the registry lock, per spec.md
//! §4.5, which the teacher's single-backend-per-host model never needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{self, Error};
use crate::instance::InstanceStatus;
use crate::registry::{InstanceView, Registry};

/// Ensures **at-most-one concurrent start per instance name** and
/// **at-most-one victim selection per activation**, by funneling every
/// concurrent activation of the same name through one `tokio::sync::Mutex`
/// entry (created on first use, per name).
pub struct Activator {
    registry: Arc<Registry>,
    in_flight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Activator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            in_flight: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn slot_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.in_flight.lock().await;
        Arc::clone(map.entry(name.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    /// Ensure `name` is `ready`, starting it on demand if necessary. All
    /// concurrent callers for the same name join the same in-flight
    /// activation and receive the same outcome.
    pub async fn ensure_ready(&self, name: &str) -> Result<InstanceView, Error> {
        let view = self.registry.get(name)?;
        if view.status == InstanceStatus::Ready {
            if let Some(instance) = self.registry.find_by_name(name) {
                instance.touch();
            }
            return Ok(view);
        }

        if !view.options.on_demand_start && view.status == InstanceStatus::Stopped {
            return Err(error::not_running(format!(
                "instance '{name}' is not running and on_demand_start is disabled"
            )));
        }

        let slot = self.slot_for(name).await;
        let _permit = slot.lock().await;

        // Re-check after acquiring the slot: a prior waiter may have
        // already finished the activation we were about to perform.
        let view = self.registry.get(name)?;
        if view.status == InstanceStatus::Ready {
            if let Some(instance) = self.registry.find_by_name(name) {
                instance.touch();
            }
            return Ok(view);
        }

        self.make_room_for(name).await?;

        let deadline = Duration::from_secs(self.registry.config().server.on_demand_start_timeout_secs);
        match tokio::time::timeout(deadline, self.registry.start(name)).await {
            Ok(Ok(view)) => {
                if let Some(instance) = self.registry.find_by_name(name) {
                    instance.touch();
                }
                Ok(view)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(error::activation_timeout(format!(
                "activation of instance '{name}' timed out after {}s",
                self.registry.config().server.on_demand_start_timeout_secs
            ))),
        }
    }

    /// Before starting, enforce the running cap. If starting one more
    /// instance would exceed it and `enable_lru_eviction` is true, stop the
    /// oldest-idle eligible `ready` instance. If no eligible victim exists,
    /// fail with `ErrRunningCap`. Victim selection happens once per
    /// activation, implicitly serialized by the caller already holding this
    /// name's activation slot plus the registry's own per-instance locks.
    async fn make_room_for(&self, name: &str) -> Result<(), Error> {
        let cap = self.registry.config().server.max_running_instances;
        if cap < 0 {
            return Ok(());
        }
        if self.registry.count_running() < cap as usize {
            return Ok(());
        }

        if !self.registry.config().server.enable_lru_eviction {
            return Err(error::running_cap("max_running_instances reached"));
        }

        let candidates = self.registry.lru_eviction_candidates();
        let victim = candidates.into_iter().find(|i| i.name != name);

        match victim {
            Some(instance) => {
                info!(victim = %instance.name, target = %name, "evicting LRU idle instance to make room");
                self.registry.stop(&instance.name).await.map_err(|e| {
                    warn!(victim = %instance.name, error = %e, "failed to stop LRU eviction victim");
                    error::running_cap("max_running_instances reached and eviction failed")
                })?;
                Ok(())
            }
            None => Err(error::running_cap(
                "max_running_instances reached and no eligible eviction victim exists",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::instance::InstanceOptions;
    use crate::store::InMemoryInstanceStore;

    fn make_activator(max_running: i64) -> (Arc<Registry>, Arc<Activator>) {
        let mut config = Config::default();
        config.server.max_running_instances = max_running;
        config.server.on_demand_start_timeout_secs = 1;
        let store = Arc::new(InMemoryInstanceStore::new());
        let registry = Arc::new(Registry::new(Arc::new(config), store, None));
        let activator = Arc::new(Activator::new(Arc::clone(&registry)));
        (registry, activator)
    }

    #[tokio::test]
    async fn ensure_ready_fails_fast_when_on_demand_start_disabled() {
        let (registry, activator) = make_activator(-1);
        registry
            .create("llama-a", InstanceOptions { on_demand_start: false, ..Default::default() })
            .unwrap();
        let err = activator.ensure_ready("llama-a").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrNotRunning);
    }

    #[tokio::test]
    async fn ensure_ready_short_circuits_when_already_ready() {
        let (registry, activator) = make_activator(-1);
        registry.create("llama-a", InstanceOptions::default()).unwrap();
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Ready);
        let view = activator.ensure_ready("llama-a").await.unwrap();
        assert_eq!(view.status, InstanceStatus::Ready);
    }

    #[tokio::test]
    async fn make_room_fails_when_cap_reached_and_no_eviction_candidate() {
        let (registry, activator) = make_activator(1);
        registry
            .create("llama-a", InstanceOptions { on_demand_start: true, idle_timeout_minutes: 0, ..Default::default() })
            .unwrap();
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Ready);
        registry
            .create("llama-b", InstanceOptions { on_demand_start: true, ..Default::default() })
            .unwrap();

        let err = activator.make_room_for("llama-b").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ErrRunningCap);
    }

    #[tokio::test]
    async fn make_room_evicts_lru_candidate_when_eligible() {
        let (registry, activator) = make_activator(1);
        registry
            .create(
                "llama-a",
                InstanceOptions { on_demand_start: true, idle_timeout_minutes: 5, ..Default::default() },
            )
            .unwrap();
        registry.find_by_name("llama-a").unwrap().set_status(InstanceStatus::Ready);
        *registry.find_by_name("llama-a").unwrap().port.lock() = Some(8000);
        registry
            .create("llama-b", InstanceOptions { on_demand_start: true, ..Default::default() })
            .unwrap();

        activator.make_room_for("llama-b").await.unwrap();
        assert_eq!(registry.get("llama-a").unwrap().status, InstanceStatus::Stopped);
    }
}
