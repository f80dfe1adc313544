//! Health supervisor — one background probe loop per registered instance.
//!
//! The `HealthSupervisor` follows registry snapshots: it starts a loop for
//! every instance that is pending, in service or unhealthy, and stops the
//! loop once the instance drains or leaves the fleet. Each loop owns the
//! instance's `HealthRecord` transitions, so active probe results and
//! passive failure reports for one instance are applied strictly in order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use fleet_core::config::HealthSection;
use fleet_state::{
    FleetSnapshot, HealthVerdict, InstanceId, InstanceRegistry, RegistryError, epoch_secs,
};

use crate::checker::{HealthRecord, http_probe};

/// Buffered passive reports per instance; extra reports are dropped while
/// the loop is busy.
const PASSIVE_BUFFER: usize = 8;

/// Emitted whenever an instance's verdict changes.
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub instance_id: InstanceId,
    pub previous: HealthVerdict,
    pub verdict: HealthVerdict,
    /// Record state right after the transition.
    pub record: HealthRecord,
}

/// Per-instance monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    passive_tx: mpsc::Sender<()>,
}

type Monitors = Arc<Mutex<HashMap<InstanceId, MonitorSlot>>>;
type Records = Arc<RwLock<HashMap<InstanceId, HealthRecord>>>;

/// Handle through which the proxy adapter reports failed forwards.
///
/// A report counts as one failed probe for the instance.
#[derive(Clone)]
pub struct PassiveReporter {
    monitors: Monitors,
}

impl PassiveReporter {
    pub fn report_failure(&self, instance_id: &str) {
        let monitors = self.monitors.lock().expect("health monitors lock");
        match monitors.get(instance_id) {
            Some(slot) => {
                if slot.passive_tx.try_send(()).is_err() {
                    debug!(instance = %instance_id, "passive report dropped, loop busy");
                }
            }
            None => debug!(instance = %instance_id, "passive report for unmonitored instance"),
        }
    }
}

/// Manages probe loops for every monitored instance.
pub struct HealthSupervisor {
    registry: InstanceRegistry,
    config: HealthSection,
    monitors: Monitors,
    records: Records,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthSupervisor {
    pub fn new(registry: InstanceRegistry, config: HealthSection) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            config,
            monitors: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn reporter(&self) -> PassiveReporter {
        PassiveReporter {
            monitors: Arc::clone(&self.monitors),
        }
    }

    /// Stream of verdict changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Follow registry snapshots until `shutdown` fires, then stop all loops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut snapshots = self.registry.subscribe();
        let initial = snapshots.borrow_and_update().clone();
        self.reconcile(&initial);
        info!(
            interval = ?self.config.interval,
            healthy_threshold = self.config.healthy_threshold,
            unhealthy_threshold = self.config.unhealthy_threshold,
            "health supervisor started"
        );

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.reconcile(&snapshot);
                }
                _ = shutdown.changed() => {
                    debug!("health supervisor shutting down");
                    break;
                }
            }
        }
        self.stop_all();
    }

    /// Start loops for new probe targets and stop loops for departed ones.
    pub fn reconcile(&self, snapshot: &FleetSnapshot) {
        let wanted: HashSet<&str> = snapshot.active().map(|i| i.id.as_str()).collect();

        let stale: Vec<InstanceId> = {
            let monitors = self.monitors.lock().expect("health monitors lock");
            monitors
                .keys()
                .filter(|id| !wanted.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop_monitor(&id);
        }

        for instance in snapshot.active() {
            if !self.is_monitoring(&instance.id) {
                self.start_monitor(&instance.id, &instance.endpoint.address());
            }
        }
    }

    /// Start probing one instance. Replaces any loop already running for it.
    pub fn start_monitor(&self, instance_id: &str, address: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (passive_tx, passive_rx) = mpsc::channel(PASSIVE_BUFFER);

        self.records
            .write()
            .expect("health records lock")
            .insert(
                instance_id.to_string(),
                HealthRecord::new(
                    instance_id,
                    self.config.healthy_threshold,
                    self.config.unhealthy_threshold,
                ),
            );

        let probe = ProbeLoop {
            instance_id: instance_id.to_string(),
            address: address.to_string(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            records: Arc::clone(&self.records),
            events: self.events.clone(),
        };
        let handle = tokio::spawn(probe.run(passive_rx, shutdown_rx));

        let mut monitors = self.monitors.lock().expect("health monitors lock");
        if let Some(old) = monitors.insert(
            instance_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
                passive_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(instance = %instance_id, %address, "health monitor started");
    }

    /// Stop probing one instance and discard its record.
    pub fn stop_monitor(&self, instance_id: &str) {
        let slot = self
            .monitors
            .lock()
            .expect("health monitors lock")
            .remove(instance_id);
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(instance = %instance_id, "health monitor stopped");
        }
        self.records
            .write()
            .expect("health records lock")
            .remove(instance_id);
    }

    pub fn stop_all(&self) {
        let mut monitors = self.monitors.lock().expect("health monitors lock");
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(instance = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub fn is_monitoring(&self, instance_id: &str) -> bool {
        let monitors = self.monitors.lock().expect("health monitors lock");
        monitors.contains_key(instance_id)
    }

    pub fn active_monitors(&self) -> Vec<InstanceId> {
        let monitors = self.monitors.lock().expect("health monitors lock");
        let mut ids: Vec<_> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Latest record for one instance.
    pub fn record(&self, instance_id: &str) -> Option<HealthRecord> {
        let records = self.records.read().expect("health records lock");
        records.get(instance_id).cloned()
    }

    /// Latest records for all monitored instances, ordered by id.
    pub fn records(&self) -> Vec<HealthRecord> {
        let records = self.records.read().expect("health records lock");
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }
}

/// Everything one probe loop needs; moved into its task.
struct ProbeLoop {
    instance_id: InstanceId,
    address: String,
    config: HealthSection,
    registry: InstanceRegistry,
    records: Records,
    events: broadcast::Sender<HealthEvent>,
}

impl ProbeLoop {
    async fn run(self, mut passive_rx: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval.max(Duration::from_millis(1));
        let offset_ms = rand::rng().random_range(0..interval.as_millis().max(1) as u64);
        let mut ticker = tokio::time::interval_at(
            Instant::now() + Duration::from_millis(offset_ms),
            interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(instance = %self.instance_id, offset_ms, "probe loop starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = http_probe(&self.address, &self.config.path, self.config.timeout).await;
                    if let Err(e) = &result {
                        debug!(instance = %self.instance_id, error = %e, "probe failed");
                    }
                    self.apply(result.is_ok());
                }
                Some(()) = passive_rx.recv() => {
                    debug!(instance = %self.instance_id, "passive failure reported");
                    self.apply(false);
                }
                _ = shutdown.changed() => {
                    debug!(instance = %self.instance_id, "probe loop shutting down");
                    break;
                }
            }
        }
    }

    fn apply(&self, passed: bool) {
        let change = {
            let mut records = self.records.write().expect("health records lock");
            let Some(record) = records.get_mut(&self.instance_id) else {
                return;
            };
            let previous = record.verdict();
            record
                .record(passed, epoch_secs())
                .map(|verdict| HealthEvent {
                    instance_id: self.instance_id.clone(),
                    previous,
                    verdict,
                    record: record.clone(),
                })
        };
        let Some(event) = change else {
            return;
        };

        match self.registry.set_health(&self.instance_id, event.verdict) {
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => {
                debug!(instance = %self.instance_id, "verdict for departed instance ignored");
            }
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "failed to apply health verdict");
            }
        }
        let _ = self.events.send(event);
    }
}
