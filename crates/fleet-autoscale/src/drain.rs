//! Connection draining and termination of scaled-in instances.
//!
//! A draining instance is already out of the routable set. The drainer
//! waits for its in-flight connections to finish, bounded by the grace
//! period, then terminates it through the provisioner and removes the
//! record. A failed termination leaves the instance `Draining`; the
//! controller hands it back on a later tick and the remaining grace is
//! computed from the time the instance entered `Draining`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_state::{
    ConnectionTracker, FleetSnapshot, Instance, InstanceId, InstanceRegistry, InstanceState,
    RegistryError, epoch_secs,
};

use crate::provision::{ProvisionError, Provisioner};

#[derive(Clone)]
pub struct Drainer {
    registry: InstanceRegistry,
    tracker: ConnectionTracker,
    provisioner: Arc<dyn Provisioner>,
    grace: Duration,
    in_progress: Arc<Mutex<HashSet<InstanceId>>>,
}

impl Drainer {
    pub fn new(
        registry: InstanceRegistry,
        tracker: ConnectionTracker,
        provisioner: Arc<dyn Provisioner>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            provisioner,
            grace,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Grace left for an instance that entered `Draining` at
    /// `state_changed_at`.
    pub fn remaining_grace(&self, instance: &Instance) -> Duration {
        let elapsed = epoch_secs().saturating_sub(instance.state_changed_at);
        self.grace.saturating_sub(Duration::from_secs(elapsed))
    }

    /// Take `id` out of router selection without waiting for the next
    /// routable set.
    pub fn stop_routing(&self, id: &str) {
        self.tracker.mark_draining(id);
    }

    /// Undo `stop_routing` when the instance never entered `Draining`.
    pub fn resume_routing(&self, id: &str) {
        self.tracker.clear_draining(id);
    }

    /// Start draining `instance` in the background.
    ///
    /// Returns false if a drain for it is already running.
    pub fn begin(&self, instance: Instance) -> bool {
        self.stop_routing(&instance.id);
        {
            let mut in_progress = self.in_progress.lock().expect("drain set lock");
            if !in_progress.insert(instance.id.clone()) {
                return false;
            }
        }
        let drainer = self.clone();
        tokio::spawn(async move {
            let id = instance.id.clone();
            if let Err(e) = drainer.finish(&instance).await {
                warn!(instance = %id, error = %e, "termination failed, instance stays draining");
            }
            drainer
                .in_progress
                .lock()
                .expect("drain set lock")
                .remove(&id);
        });
        true
    }

    /// Hand every `Draining` instance without a running drain back to
    /// the drainer. Returns how many were resumed.
    pub fn resume_stranded(&self, snapshot: &FleetSnapshot) -> usize {
        let mut resumed = 0;
        for instance in snapshot.in_state(InstanceState::Draining) {
            if self.begin(instance.clone()) {
                debug!(instance = %instance.id, "resuming drain");
                resumed += 1;
            }
        }
        resumed
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.lock().expect("drain set lock").len()
    }

    /// Wait for the instance to go idle (or the grace to run out), then
    /// terminate it and drop the record.
    pub async fn finish(&self, instance: &Instance) -> Result<(), ProvisionError> {
        let id = instance.id.as_str();
        let grace = self.remaining_grace(instance);
        if self.tracker.wait_idle(id, grace).await {
            debug!(instance = %id, "instance drained");
        } else {
            info!(
                instance = %id,
                in_flight = self.tracker.in_flight(id),
                grace = ?self.grace,
                "drain grace expired, terminating with connections in flight"
            );
        }

        match instance.provider_ref.as_deref() {
            Some(provider_ref) => self.provisioner.terminate(provider_ref).await?,
            None => debug!(instance = %id, "no provider reference, nothing to release"),
        }

        match self.registry.set_state(id, InstanceState::Terminated) {
            Ok(_) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => warn!(instance = %id, error = %e, "failed to mark instance terminated"),
        }
        match self.registry.deregister(id) {
            Ok(_) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => warn!(instance = %id, error = %e, "failed to deregister instance"),
        }
        self.tracker.forget(id);
        info!(instance = %id, "instance terminated");
        Ok(())
    }
}
