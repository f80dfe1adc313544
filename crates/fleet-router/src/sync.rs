//! Router state synchronization — bridges the registry to the router.
//!
//! `RouterSync` recomputes the routable set whenever the registry
//! publishes a new snapshot. Health verdicts reach the router the same
//! way, since the health checker applies them to the registry.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use fleet_state::{ConnectionTracker, FleetSnapshot, InstanceRegistry, TemplateCatalog};

use crate::routable::RoutableSet;
use crate::router::Router;

/// Sync statistics.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub snapshot_version: u64,
    pub routable: usize,
    pub counters_forgotten: usize,
}

pub struct RouterSync {
    registry: InstanceRegistry,
    catalog: TemplateCatalog,
    tracker: ConnectionTracker,
    router: Arc<Router>,
    router_port: u16,
}

impl RouterSync {
    pub fn new(
        registry: InstanceRegistry,
        catalog: TemplateCatalog,
        tracker: ConnectionTracker,
        router: Arc<Router>,
        router_port: u16,
    ) -> Self {
        Self {
            registry,
            catalog,
            tracker,
            router,
            router_port,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Rebuild the routable set from the latest snapshot.
    pub fn sync_once(&self) -> SyncStats {
        let snapshot = self.registry.snapshot();
        self.apply(&snapshot)
    }

    fn apply(&self, snapshot: &FleetSnapshot) -> SyncStats {
        let set = RoutableSet::compute(snapshot, &self.catalog, &self.tracker, self.router_port);
        let routable = set.len();
        self.router.update(set);

        // Counters of deregistered instances are no longer needed; draining
        // ones stay until the drainer removes the record.
        let present: HashSet<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
        let mut forgotten = 0;
        for (id, _) in self.tracker.in_flight_all() {
            if !present.contains(id.as_str()) {
                self.tracker.forget(&id);
                forgotten += 1;
            }
        }

        SyncStats {
            snapshot_version: snapshot.version,
            routable,
            counters_forgotten: forgotten,
        }
    }

    /// Follow registry snapshots until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut snapshots = self.registry.subscribe();
        let initial = snapshots.borrow_and_update().clone();
        let stats = self.apply(&initial);
        info!(routable = stats.routable, "router sync started");

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    let stats = self.apply(&snapshot);
                    debug!(
                        snapshot_version = stats.snapshot_version,
                        routable = stats.routable,
                        "router synced"
                    );
                }
                _ = shutdown.changed() => {
                    info!("router sync shutting down");
                    break;
                }
            }
        }
    }
}
