//! The routable set: in-service, healthy instances and their port mappings.
//!
//! A `RoutableSet` is derived from one registry snapshot and never mutated
//! afterwards. Port mappings are resolved here, once per recompute, so the
//! request path only reads them.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use fleet_state::{ConnectionTracker, FleetSnapshot, InstanceCounters, InstanceId, TemplateCatalog};

/// Router-facing port to the application's bound port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub router_port: u16,
    pub app_port: u16,
}

/// One instance eligible for new traffic.
#[derive(Debug, Clone, Serialize)]
pub struct Routable {
    pub id: InstanceId,
    pub host: String,
    pub template_version: u32,
    pub mapping: PortMapping,
    #[serde(skip)]
    pub(crate) counters: Arc<InstanceCounters>,
}

impl Routable {
    /// Address the adapter forwards to.
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.host, self.mapping.app_port)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutableSet {
    /// Registry snapshot version this set was derived from.
    pub snapshot_version: u64,
    entries: Vec<Routable>,
}

impl RoutableSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive the set from a snapshot, ordered by instance id.
    pub fn compute(
        snapshot: &FleetSnapshot,
        catalog: &TemplateCatalog,
        tracker: &ConnectionTracker,
        router_port: u16,
    ) -> Self {
        let mut entries: Vec<Routable> = snapshot
            .instances
            .iter()
            .filter(|i| i.is_routable())
            .map(|i| {
                let app_port = match catalog.get(i.template_version) {
                    Some(template) => template.app_port,
                    None => {
                        warn!(
                            instance = %i.id,
                            template_version = i.template_version,
                            "template missing; using registered endpoint port"
                        );
                        i.endpoint.port
                    }
                };
                Routable {
                    id: i.id.clone(),
                    host: i.endpoint.host.clone(),
                    template_version: i.template_version,
                    mapping: PortMapping {
                        router_port,
                        app_port,
                    },
                    counters: tracker.counters(&i.id),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            snapshot_version: snapshot.version,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Routable] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{
        Endpoint, FleetStore, HealthVerdict, InstanceRegistry, InstanceState, LaunchTemplate,
    };

    fn setup() -> (InstanceRegistry, TemplateCatalog, ConnectionTracker) {
        let store = FleetStore::open_in_memory().unwrap();
        let catalog = TemplateCatalog::open(store.clone()).unwrap();
        catalog
            .publish(LaunchTemplate {
                version: 1,
                app_port: 3000,
                artifact: "web:1".into(),
                created_at: 0,
            })
            .unwrap();
        catalog
            .publish(LaunchTemplate {
                version: 2,
                app_port: 4000,
                artifact: "web:2".into(),
                created_at: 0,
            })
            .unwrap();
        let registry = InstanceRegistry::new(store, 10).unwrap();
        (registry, catalog, ConnectionTracker::new())
    }

    #[test]
    fn only_in_service_and_healthy_instances() {
        let (reg, catalog, tracker) = setup();
        let healthy = reg.register(Endpoint::new("10.0.0.1", 3000), 1).unwrap();
        reg.set_health(&healthy, HealthVerdict::Healthy).unwrap();
        reg.register(Endpoint::new("10.0.0.2", 3000), 1).unwrap();
        let draining = reg.register(Endpoint::new("10.0.0.3", 3000), 1).unwrap();
        reg.set_health(&draining, HealthVerdict::Healthy).unwrap();
        reg.set_state(&draining, InstanceState::Draining).unwrap();

        let set = RoutableSet::compute(&reg.snapshot(), &catalog, &tracker, 80);
        assert_eq!(set.ids(), vec![healthy]);
        assert_eq!(set.snapshot_version, reg.snapshot().version);
    }

    #[test]
    fn mapping_follows_template_version() {
        let (reg, catalog, tracker) = setup();
        let v1 = reg.register(Endpoint::new("10.0.0.1", 3000), 1).unwrap();
        let v2 = reg.register(Endpoint::new("10.0.0.2", 4000), 2).unwrap();
        reg.set_health(&v1, HealthVerdict::Healthy).unwrap();
        reg.set_health(&v2, HealthVerdict::Healthy).unwrap();

        let set = RoutableSet::compute(&reg.snapshot(), &catalog, &tracker, 80);
        let entries = set.entries();
        assert_eq!(entries[0].mapping, PortMapping { router_port: 80, app_port: 3000 });
        assert_eq!(entries[1].mapping, PortMapping { router_port: 80, app_port: 4000 });
        assert_eq!(entries[1].upstream(), "10.0.0.2:4000");
    }

    #[test]
    fn empty_snapshot_gives_empty_set() {
        let (reg, catalog, tracker) = setup();
        let set = RoutableSet::compute(&reg.snapshot(), &catalog, &tracker, 80);
        assert!(set.is_empty());
    }
}
