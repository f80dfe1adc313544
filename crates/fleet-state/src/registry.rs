//! InstanceRegistry — the single writer for instance records.
//!
//! Mutations are serialized behind one lock. Each one is written through
//! to the `FleetStore` first, applied to the in-memory map only once the
//! store accepted it, and then published as a new `FleetSnapshot` before
//! the lock is released. A failed store write leaves both the map and the
//! published snapshot untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::store::FleetStore;
use crate::tables::META_NEXT_SEQ;
use crate::types::*;

struct RegistryInner {
    store: FleetStore,
    instances: HashMap<InstanceId, Instance>,
    next_seq: u64,
    version: u64,
    max_size: u32,
}

impl RegistryInner {
    /// Non-terminated records; these count against `max_size`.
    fn live_count(&self) -> u32 {
        self.instances
            .values()
            .filter(|i| i.state != InstanceState::Terminated)
            .count() as u32
    }

    fn build_snapshot(&self) -> FleetSnapshot {
        let mut instances: Vec<Instance> = self.instances.values().cloned().collect();
        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        FleetSnapshot {
            version: self.version,
            instances,
        }
    }
}

/// Owner of all instance records.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    tx: Arc<watch::Sender<Arc<FleetSnapshot>>>,
}

impl InstanceRegistry {
    /// Create a registry, restoring any records persisted in `store`.
    ///
    /// Restored instances start with an `Unknown` verdict; the health
    /// checker has to re-establish it. Records left `Terminated` by an
    /// interrupted deregistration are purged.
    pub fn new(store: FleetStore, max_size: u32) -> RegistryResult<Self> {
        let mut instances = HashMap::new();
        let mut max_seq = 0;
        for mut instance in store.list_instances()? {
            if instance.state == InstanceState::Terminated {
                store.delete_instance(&instance.id)?;
                continue;
            }
            instance.health = HealthVerdict::Unknown;
            max_seq = max_seq.max(instance.seq);
            instances.insert(instance.id.clone(), instance);
        }
        let persisted_seq = store.get_meta(META_NEXT_SEQ)?.unwrap_or(1);
        let next_seq = persisted_seq.max(max_seq + 1);

        if !instances.is_empty() {
            info!(count = instances.len(), next_seq, "registry restored from store");
        }

        let inner = RegistryInner {
            store,
            instances,
            next_seq,
            version: 1,
            max_size,
        };
        let (tx, _rx) = watch::channel(Arc::new(inner.build_snapshot()));
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            tx: Arc::new(tx),
        })
    }

    fn publish(&self, inner: &mut RegistryInner) {
        inner.version += 1;
        self.tx.send_replace(Arc::new(inner.build_snapshot()));
    }

    /// Register a new `Pending` instance.
    pub fn register(&self, endpoint: Endpoint, template_version: u32) -> RegistryResult<InstanceId> {
        self.register_with_ref(endpoint, template_version, None)
    }

    /// Register a new `Pending` instance carrying the provisioner's reference.
    pub fn register_with_ref(
        &self,
        endpoint: Endpoint,
        template_version: u32,
        provider_ref: Option<String>,
    ) -> RegistryResult<InstanceId> {
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.live_count() >= inner.max_size {
            return Err(RegistryError::CapacityExceeded {
                max: inner.max_size,
            });
        }

        let seq = inner.next_seq;
        let now = epoch_secs();
        let instance = Instance {
            id: format!("i-{seq:010}"),
            seq,
            endpoint,
            template_version,
            state: InstanceState::Pending,
            health: HealthVerdict::Unknown,
            provider_ref,
            created_at: now,
            state_changed_at: now,
        };
        inner.store.insert_instance(&instance, seq + 1)?;

        let id = instance.id.clone();
        info!(
            instance = %id,
            endpoint = %instance.endpoint,
            template_version,
            "instance registered"
        );
        inner.next_seq = seq + 1;
        inner.instances.insert(id.clone(), instance);
        self.publish(&mut inner);
        Ok(id)
    }

    /// Remove an instance record. Unknown ids report `NotFound`.
    pub fn deregister(&self, id: &str) -> RegistryResult<Instance> {
        let mut inner = self.inner.lock().expect("registry lock");
        if !inner.instances.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        inner.store.delete_instance(id)?;
        let removed = inner
            .instances
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        info!(instance = %id, state = removed.state.as_str(), "instance deregistered");
        self.publish(&mut inner);
        Ok(removed)
    }

    /// Move an instance to a new lifecycle state.
    ///
    /// Setting the current state again is a no-op and publishes nothing.
    pub fn set_state(&self, id: &str, state: InstanceState) -> RegistryResult<Instance> {
        let mut inner = self.inner.lock().expect("registry lock");
        let current = inner
            .instances
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if current.state == state {
            return Ok(current.clone());
        }
        if !current.state.can_transition_to(state) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to: state,
            });
        }

        let mut updated = current.clone();
        updated.state = state;
        updated.state_changed_at = epoch_secs();
        inner.store.put_instance(&updated)?;

        debug!(
            instance = %id,
            from = current.state.as_str(),
            to = state.as_str(),
            "instance state changed"
        );
        inner.instances.insert(id.to_string(), updated.clone());
        self.publish(&mut inner);
        Ok(updated)
    }

    /// Apply a health verdict. Returns whether the record changed.
    ///
    /// `Healthy` promotes `Pending` and `Unhealthy` to `InService`;
    /// `Unhealthy` demotes `InService`. Draining and terminated instances
    /// keep their lifecycle state.
    pub fn set_health(&self, id: &str, verdict: HealthVerdict) -> RegistryResult<bool> {
        let mut inner = self.inner.lock().expect("registry lock");
        let current = inner
            .instances
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let next_state = match (verdict, current.state) {
            (HealthVerdict::Healthy, InstanceState::Pending | InstanceState::Unhealthy) => {
                InstanceState::InService
            }
            (HealthVerdict::Unhealthy, InstanceState::InService) => InstanceState::Unhealthy,
            (_, state) => state,
        };
        if current.health == verdict && current.state == next_state {
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.health = verdict;
        if updated.state != next_state {
            updated.state = next_state;
            updated.state_changed_at = epoch_secs();
        }
        inner.store.put_instance(&updated)?;

        if current.state != next_state {
            info!(
                instance = %id,
                verdict = ?verdict,
                from = current.state.as_str(),
                to = next_state.as_str(),
                "health verdict applied"
            );
        } else {
            debug!(instance = %id, verdict = ?verdict, "health verdict recorded");
        }
        inner.instances.insert(id.to_string(), updated);
        self.publish(&mut inner);
        Ok(true)
    }

    /// All instances, ordered by creation time then registration order.
    pub fn list(&self) -> Vec<Instance> {
        self.snapshot().instances.clone()
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        let inner = self.inner.lock().expect("registry lock");
        inner.instances.get(id).cloned()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.tx.subscribe()
    }

    /// Whether another instance can be registered right now.
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.lock().expect("registry lock");
        inner.live_count() < inner.max_size
    }

    pub fn max_size(&self) -> u32 {
        self.inner.lock().expect("registry lock").max_size
    }

    /// Pending, in-service and unhealthy instances.
    pub fn active_count(&self) -> u32 {
        self.snapshot().active_count()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("InstanceRegistry")
            .field("version", &snap.version)
            .field("instances", &snap.instances.len())
            .finish()
    }
}
