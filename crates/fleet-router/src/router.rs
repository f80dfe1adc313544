//! Request routing — picks an instance from the latest routable set.
//!
//! The router never blocks on the registry, the health checker or the
//! scaling controller: it reads the most recently published
//! `RoutableSet` and selects from it. Selection is round-robin where the
//! least recently selected instance goes first and an atomic cursor breaks
//! ties, so an instance that just became healthy is picked promptly
//! instead of waiting for its turn in the rotation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use fleet_state::InflightGuard;

use crate::routable::{Routable, RoutableSet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("service unavailable: no routable instances")]
    ServiceUnavailable,
}

/// A routing decision. The connection counts as in flight against the
/// chosen instance until the lease drops.
#[derive(Debug)]
pub struct RouteLease {
    pub target: Routable,
    _guard: InflightGuard,
}

pub struct Router {
    set: watch::Sender<Arc<RoutableSet>>,
    cursor: AtomicUsize,
    clock: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        let (set, _) = watch::channel(Arc::new(RoutableSet::empty()));
        Self {
            set,
            cursor: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Publish a recomputed routable set.
    pub fn update(&self, set: RoutableSet) {
        debug!(
            routable = set.len(),
            snapshot_version = set.snapshot_version,
            "routable set updated"
        );
        self.set.send_replace(Arc::new(set));
    }

    pub fn current(&self) -> Arc<RoutableSet> {
        self.set.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutableSet>> {
        self.set.subscribe()
    }

    /// Select an instance for a new connection.
    ///
    /// Instances whose drain has begun are skipped even while the
    /// published set still lists them.
    pub fn route(&self) -> Result<RouteLease, RouteError> {
        let set = self.current();
        let entries = set.entries();
        let n = entries.len();
        if n == 0 {
            return Err(RouteError::ServiceUnavailable);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        loop {
            let idx = (0..n)
                .filter(|&i| !entries[i].counters.is_draining())
                .min_by_key(|&i| {
                    let last = entries[i].counters.last_selected.load(Ordering::Relaxed);
                    (last, (i + n - start) % n)
                })
                .ok_or(RouteError::ServiceUnavailable)?;

            let target = &entries[idx];
            // A drain that began after the filter wins; pick again.
            let Some(guard) = target.counters.try_enter() else {
                continue;
            };
            let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
            target.counters.last_selected.store(tick, Ordering::Relaxed);
            return Ok(RouteLease {
                target: target.clone(),
                _guard: guard,
            });
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
