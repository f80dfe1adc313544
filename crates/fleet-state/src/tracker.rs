//! Per-instance connection counters shared by the router, the drainer and
//! the metrics collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::types::InstanceId;

/// Counters for one instance.
#[derive(Debug, Default)]
pub struct InstanceCounters {
    in_flight: AtomicUsize,
    /// Router clock value at the last selection; 0 = never selected.
    pub last_selected: AtomicU64,
    /// Connections routed since the last `take_routed`.
    routed: AtomicU64,
    /// Set when a drain begins; the router stops selecting the instance.
    draining: AtomicBool,
    idle: Notify,
}

impl InstanceCounters {
    /// Count a new connection as in flight until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.routed.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            counters: Arc::clone(self),
        }
    }

    /// Like `enter`, but refuses once the instance is draining.
    ///
    /// The in-flight count is raised before the flag is read, and a drain
    /// sets the flag before reading the count, so either the connection is
    /// refused here or the drain sees it in flight.
    pub fn try_enter(self: &Arc<Self>) -> Option<InflightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            counters: Arc::clone(self),
        };
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        self.routed.fetch_add(1, Ordering::Relaxed);
        Some(guard)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InflightGuard {
    counters: Arc<InstanceCounters>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.counters.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counters.idle.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counters: Arc<Mutex<HashMap<InstanceId, Arc<InstanceCounters>>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `id`, created on first use.
    pub fn counters(&self, id: &str) -> Arc<InstanceCounters> {
        let mut map = self.counters.lock().expect("tracker lock");
        Arc::clone(map.entry(id.to_string()).or_default())
    }

    pub fn in_flight(&self, id: &str) -> usize {
        let map = self.counters.lock().expect("tracker lock");
        map.get(id).map(|c| c.in_flight()).unwrap_or(0)
    }

    /// In-flight counts for every tracked instance.
    pub fn in_flight_all(&self) -> Vec<(InstanceId, usize)> {
        let map = self.counters.lock().expect("tracker lock");
        let mut all: Vec<_> = map
            .iter()
            .map(|(id, c)| (id.clone(), c.in_flight()))
            .collect();
        all.sort();
        all
    }

    /// Connections routed to `id` since the previous call.
    pub fn take_routed(&self, id: &str) -> u64 {
        let map = self.counters.lock().expect("tracker lock");
        map.get(id)
            .map(|c| c.routed.swap(0, Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stop new connections to `id`. Existing guards are unaffected.
    pub fn mark_draining(&self, id: &str) {
        self.counters(id).draining.store(true, Ordering::SeqCst);
    }

    /// Undo `mark_draining` for a drain that never started.
    pub fn clear_draining(&self, id: &str) {
        self.counters(id).draining.store(false, Ordering::SeqCst);
    }

    /// Drop counters for an instance that left the fleet. Outstanding
    /// guards keep their own reference alive.
    pub fn forget(&self, id: &str) {
        self.counters.lock().expect("tracker lock").remove(id);
    }

    /// Wait until `id` has no in-flight connections or `grace` elapses.
    /// Returns true when the instance went idle.
    pub async fn wait_idle(&self, id: &str, grace: Duration) -> bool {
        let counters = self.counters(id);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if counters.in_flight() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return counters.in_flight() == 0;
                }
            }
        }
    }
}
