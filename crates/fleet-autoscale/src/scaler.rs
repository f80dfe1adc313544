//! Scaling controller — one decision per tick from the windowed load.
//!
//! Each tick reads the windowed aggregate from the `MetricsAggregator`,
//! compares it against the scale-out and scale-in thresholds and, outside
//! the cooldown, moves the fleet at most `max_step` instances toward its
//! bounds. Scale-out launches `Pending` instances from the active launch
//! template; scale-in moves the chosen instances to `Draining` and hands
//! them to the `Drainer`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::config::ScalingSection;
use fleet_metrics::{Aggregate, MetricsAggregator};
use fleet_state::{
    Endpoint, FleetSnapshot, HealthVerdict, Instance, InstanceRegistry, InstanceState,
    RegistryError, TemplateCatalog,
};

use crate::drain::Drainer;
use crate::provision::Provisioner;

/// Largest number of ticks skipped after repeated failed applications.
const MAX_BACKOFF_TICKS: u32 = 7;

/// Why a tick decided what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    /// The previous applied decision is still cooling down.
    Cooldown,
    /// Skipping ticks after failed applications.
    Backoff,
    /// Fleet below `min_size`, repairing.
    BelowMinimum,
    /// Fleet above `max_size`, shrinking.
    AboveMaximum,
    /// No samples in the window.
    NoData,
    ScaleOut,
    ScaleIn,
    /// Load is high but the fleet is already at `max_size`.
    AtMaximum,
    /// Load is low but the fleet is already at `min_size`.
    AtMinimum,
    WithinBand,
}

/// Outcome of one control-loop tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    /// Active instances when the tick started.
    pub current: u32,
    pub target: u32,
    pub reason: ScaleReason,
    /// The aggregate the decision was based on, when one was read.
    pub load: Option<f64>,
}

impl ScalingDecision {
    fn noop(current: u32, reason: ScaleReason, load: Option<f64>) -> Self {
        Self {
            current,
            target: current,
            reason,
            load,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.current == self.target
    }

    /// Signed instance delta.
    pub fn delta(&self) -> i64 {
        i64::from(self.target) - i64::from(self.current)
    }
}

/// Fleet bounds plus the `[scaling]` section.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_size: u32,
    pub max_size: u32,
    pub scaling: ScalingSection,
}

pub struct ScalingController {
    registry: InstanceRegistry,
    catalog: TemplateCatalog,
    aggregator: Arc<MetricsAggregator>,
    provisioner: Arc<dyn Provisioner>,
    drainer: Drainer,
    policy: ScalingPolicy,
    /// When the last decision was applied; starts the cooldown.
    last_applied: Option<Instant>,
    /// Consecutive decisions whose application failed entirely.
    failed_applications: u32,
    /// Ticks still to skip before retrying.
    backoff_ticks: u32,
    last_decision: Option<ScalingDecision>,
}

impl ScalingController {
    pub fn new(
        registry: InstanceRegistry,
        catalog: TemplateCatalog,
        aggregator: Arc<MetricsAggregator>,
        provisioner: Arc<dyn Provisioner>,
        drainer: Drainer,
        policy: ScalingPolicy,
    ) -> Self {
        Self {
            registry,
            catalog,
            aggregator,
            provisioner,
            drainer,
            policy,
            last_applied: None,
            failed_applications: 0,
            backoff_ticks: 0,
            last_decision: None,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn last_decision(&self) -> Option<&ScalingDecision> {
        self.last_decision.as_ref()
    }

    /// Decide what to do for `current` active instances given `aggregate`.
    ///
    /// Pure with respect to the fleet: nothing is launched or drained.
    pub fn evaluate(&self, aggregate: Aggregate, current: u32, now: Instant) -> ScalingDecision {
        let policy = &self.policy;
        let step = policy.scaling.max_step.max(1);
        let load = aggregate.value();

        if let Some(last) = self.last_applied
            && now.saturating_duration_since(last) <= policy.scaling.cooldown
        {
            return ScalingDecision::noop(current, ScaleReason::Cooldown, load);
        }

        if current < policy.min_size {
            return ScalingDecision {
                current,
                target: current.saturating_add(step).min(policy.min_size),
                reason: ScaleReason::BelowMinimum,
                load,
            };
        }
        if current > policy.max_size {
            return ScalingDecision {
                current,
                target: current.saturating_sub(step).max(policy.max_size),
                reason: ScaleReason::AboveMaximum,
                load,
            };
        }

        let Some(value) = load else {
            return ScalingDecision::noop(current, ScaleReason::NoData, None);
        };

        if value > policy.scaling.scale_out_threshold {
            if current >= policy.max_size {
                return ScalingDecision::noop(current, ScaleReason::AtMaximum, load);
            }
            return ScalingDecision {
                current,
                target: current.saturating_add(step).min(policy.max_size),
                reason: ScaleReason::ScaleOut,
                load,
            };
        }

        if value < policy.scaling.scale_in_threshold {
            if current <= policy.min_size {
                return ScalingDecision::noop(current, ScaleReason::AtMinimum, load);
            }
            return ScalingDecision {
                current,
                target: current.saturating_sub(step).max(policy.min_size),
                reason: ScaleReason::ScaleIn,
                load,
            };
        }

        ScalingDecision::noop(current, ScaleReason::WithinBand, load)
    }

    /// Run one tick now.
    pub async fn tick(&mut self) -> ScalingDecision {
        self.tick_at(Instant::now()).await
    }

    /// Run one tick as of `now`: decide, then apply the decision.
    pub async fn tick_at(&mut self, now: Instant) -> ScalingDecision {
        let snapshot = self.registry.snapshot();
        self.drainer.resume_stranded(&snapshot);
        let current = snapshot.active_count();

        if self.backoff_ticks > 0 {
            self.backoff_ticks -= 1;
            debug!(remaining = self.backoff_ticks, "scaling tick skipped, backing off");
            let decision = ScalingDecision::noop(current, ScaleReason::Backoff, None);
            self.last_decision = Some(decision.clone());
            return decision;
        }

        let aggregate = self.aggregator.windowed_mean_at(
            self.policy.scaling.metric,
            self.policy.scaling.window,
            now,
        );
        let decision = self.evaluate(aggregate, current, now);

        if decision.is_noop() {
            debug!(
                current,
                reason = ?decision.reason,
                load = ?decision.load,
                "no scaling change"
            );
        } else {
            info!(
                current,
                target = decision.target,
                reason = ?decision.reason,
                load = ?decision.load,
                metric = %self.policy.scaling.metric,
                "scaling decision"
            );
            let delta = decision.delta();
            let applied = if delta > 0 {
                self.launch(delta as u32).await
            } else {
                self.scale_in(&snapshot, delta.unsigned_abs() as u32)
            };
            self.record_application(applied, now);
        }

        self.last_decision = Some(decision.clone());
        decision
    }

    fn record_application(&mut self, applied: u32, now: Instant) {
        if applied > 0 {
            self.last_applied = Some(now);
            self.failed_applications = 0;
            self.backoff_ticks = 0;
            return;
        }
        self.failed_applications += 1;
        // Skip 0, 1, 3, 7 ticks.
        let exp = self.failed_applications.saturating_sub(1).min(3);
        self.backoff_ticks = ((1u32 << exp) - 1).min(MAX_BACKOFF_TICKS);
        warn!(
            failures = self.failed_applications,
            skip_ticks = self.backoff_ticks,
            "scaling decision could not be applied"
        );
    }

    /// Launch up to `count` instances from the active template. Returns
    /// how many were registered.
    async fn launch(&self, count: u32) -> u32 {
        let template = match self.catalog.active() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "no launch template available");
                return 0;
            }
        };

        let mut launched = 0;
        for _ in 0..count {
            if !self.registry.has_capacity() {
                warn!(max = self.registry.max_size(), "registry at capacity, launch deferred");
                break;
            }
            let machine = match self.provisioner.launch(&template).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        template_version = template.version,
                        error = %e,
                        "launch failed, retrying next tick"
                    );
                    break;
                }
            };

            let endpoint = Endpoint::new(machine.host.clone(), template.app_port);
            match self.registry.register_with_ref(
                endpoint,
                template.version,
                Some(machine.provider_ref.clone()),
            ) {
                Ok(id) => {
                    info!(
                        instance = %id,
                        host = %machine.host,
                        template_version = template.version,
                        "instance launched"
                    );
                    launched += 1;
                }
                Err(e) => {
                    warn!(host = %machine.host, error = %e, "registration failed, releasing machine");
                    if let Err(e) = self.provisioner.terminate(&machine.provider_ref).await {
                        warn!(
                            provider_ref = %machine.provider_ref,
                            error = %e,
                            "failed to release unregistered machine"
                        );
                    }
                    if matches!(e, RegistryError::CapacityExceeded { .. }) {
                        break;
                    }
                }
            }
        }
        launched
    }

    /// Move `count` instances to `Draining`. Returns how many moved.
    fn scale_in(&self, snapshot: &FleetSnapshot, count: u32) -> u32 {
        let mut drained = 0;
        for candidate in scale_in_candidates(snapshot, count as usize) {
            // The router must stop picking it before the state change is
            // published; sync catches up afterwards.
            self.drainer.stop_routing(&candidate.id);
            match self.registry.set_state(&candidate.id, InstanceState::Draining) {
                Ok(instance) => {
                    info!(
                        instance = %instance.id,
                        from = candidate.state.as_str(),
                        "instance draining"
                    );
                    self.drainer.begin(instance);
                    drained += 1;
                }
                Err(e) => {
                    self.drainer.resume_routing(&candidate.id);
                    warn!(instance = %candidate.id, error = %e, "failed to start drain");
                }
            }
        }
        drained
    }

    /// Tick on `interval` until shutdown. Ticks never overlap.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.policy.scaling.tick;
        info!(
            interval = ?interval,
            min = self.policy.min_size,
            max = self.policy.max_size,
            "scaling controller started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }
}

/// Scale-in order: unhealthy first, then the oldest in service, then
/// instances still pending.
pub fn scale_in_candidates(snapshot: &FleetSnapshot, count: usize) -> Vec<Instance> {
    fn rank(instance: &Instance) -> u8 {
        if instance.state == InstanceState::Unhealthy || instance.health == HealthVerdict::Unhealthy
        {
            0
        } else if instance.state == InstanceState::InService {
            1
        } else {
            2
        }
    }

    let mut candidates: Vec<&Instance> = snapshot.active().collect();
    candidates.sort_by_key(|i| (rank(i), i.created_at, i.seq));
    candidates.into_iter().take(count).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_metrics::MetricSample;
    use fleet_state::{ConnectionTracker, FleetStore, LaunchTemplate};

    use crate::provision::StaticPoolProvisioner;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min_size: 2,
            max_size: 10,
            scaling: ScalingSection {
                tick: Duration::from_secs(30),
                scale_out_threshold: 0.7,
                scale_in_threshold: 0.3,
                cooldown: Duration::from_secs(60),
                max_step: 2,
                window: Duration::from_secs(120),
                ..ScalingSection::default()
            },
        }
    }

    fn controller() -> (InstanceRegistry, Arc<MetricsAggregator>, ScalingController) {
        let store = FleetStore::open_in_memory().unwrap();
        let catalog = TemplateCatalog::open(store.clone()).unwrap();
        catalog
            .publish(LaunchTemplate {
                version: 1,
                app_port: 8080,
                artifact: "web:1".into(),
                created_at: 0,
            })
            .unwrap();
        let registry = InstanceRegistry::new(store, 10).unwrap();
        let aggregator = Arc::new(MetricsAggregator::new(Duration::from_secs(600)));
        let provisioner: Arc<dyn Provisioner> = Arc::new(StaticPoolProvisioner::new(
            (1..=10).map(|n| format!("10.0.0.{n}")),
        ));
        let drainer = Drainer::new(
            registry.clone(),
            ConnectionTracker::new(),
            Arc::clone(&provisioner),
            Duration::from_millis(50),
        );
        let controller = ScalingController::new(
            registry.clone(),
            catalog,
            Arc::clone(&aggregator),
            provisioner,
            drainer,
            policy(),
        );
        (registry, aggregator, controller)
    }

    #[test]
    fn thresholds_are_strict() {
        let (_, _, c) = controller();
        let now = Instant::now();
        assert_eq!(
            c.evaluate(Aggregate::Value(0.7), 4, now).reason,
            ScaleReason::WithinBand
        );
        assert_eq!(
            c.evaluate(Aggregate::Value(0.3), 4, now).reason,
            ScaleReason::WithinBand
        );
        let out = c.evaluate(Aggregate::Value(0.71), 4, now);
        assert_eq!((out.reason, out.target), (ScaleReason::ScaleOut, 6));
        let inn = c.evaluate(Aggregate::Value(0.1), 4, now);
        assert_eq!((inn.reason, inn.target), (ScaleReason::ScaleIn, 2));
    }

    #[test]
    fn targets_are_clamped_to_bounds() {
        let (_, _, c) = controller();
        let now = Instant::now();
        assert_eq!(c.evaluate(Aggregate::Value(0.9), 9, now).target, 10);
        assert_eq!(
            c.evaluate(Aggregate::Value(0.9), 10, now).reason,
            ScaleReason::AtMaximum
        );
        assert_eq!(c.evaluate(Aggregate::Value(0.1), 3, now).target, 2);
        assert_eq!(
            c.evaluate(Aggregate::Value(0.1), 2, now).reason,
            ScaleReason::AtMinimum
        );
    }

    #[test]
    fn bounds_are_repaired_before_metrics() {
        let (_, _, c) = controller();
        let now = Instant::now();
        let repair = c.evaluate(Aggregate::Unknown, 0, now);
        assert_eq!((repair.reason, repair.target), (ScaleReason::BelowMinimum, 2));
        let shrink = c.evaluate(Aggregate::Value(0.9), 14, now);
        assert_eq!((shrink.reason, shrink.target), (ScaleReason::AboveMaximum, 12));
    }

    #[test]
    fn unknown_load_is_a_noop() {
        let (_, _, c) = controller();
        let d = c.evaluate(Aggregate::Unknown, 4, Instant::now());
        assert!(d.is_noop());
        assert_eq!(d.reason, ScaleReason::NoData);
    }

    #[test]
    fn cooldown_is_inclusive() {
        let (_, _, mut c) = controller();
        let start = Instant::now();
        c.last_applied = Some(start);
        let at_edge = c.evaluate(Aggregate::Value(0.9), 4, start + Duration::from_secs(60));
        assert_eq!(at_edge.reason, ScaleReason::Cooldown);
        let after = c.evaluate(
            Aggregate::Value(0.9),
            4,
            start + Duration::from_secs(60) + Duration::from_millis(1),
        );
        assert_eq!(after.reason, ScaleReason::ScaleOut);
    }

    #[test]
    fn candidates_prefer_unhealthy_then_oldest() {
        let (registry, _, _) = controller();
        let ids: Vec<String> = (0..4)
            .map(|n| {
                registry
                    .register(Endpoint::new(format!("10.9.0.{n}"), 8080), 1)
                    .unwrap()
            })
            .collect();
        for id in &ids[..3] {
            registry.set_health(id, HealthVerdict::Healthy).unwrap();
        }
        registry.set_health(&ids[2], HealthVerdict::Unhealthy).unwrap();

        let chosen: Vec<String> = scale_in_candidates(&registry.snapshot(), 4)
            .into_iter()
            .map(|i| i.id)
            .collect();
        // ids[3] is still pending and goes last.
        assert_eq!(chosen, vec![ids[2].clone(), ids[0].clone(), ids[1].clone(), ids[3].clone()]);
    }

    #[tokio::test]
    async fn tick_launches_from_active_template() {
        let (registry, aggregator, mut c) = controller();
        let now = Instant::now();
        let decision = c.tick_at(now).await;
        assert_eq!(decision.reason, ScaleReason::BelowMinimum);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_count(), 2);
        for instance in snapshot.instances.iter() {
            assert_eq!(instance.state, InstanceState::Pending);
            assert_eq!(instance.endpoint.port, 8080);
            assert_eq!(instance.template_version, 1);
            assert!(instance.provider_ref.is_some());
        }

        // Cooldown holds even with load far above the threshold.
        for instance in snapshot.instances.iter() {
            aggregator.record(MetricSample {
                instance_id: instance.id.clone(),
                at: now,
                cpu: 0.95,
                requests: 0,
            });
        }
        let held = c.tick_at(now + Duration::from_secs(30)).await;
        assert_eq!(held.reason, ScaleReason::Cooldown);
        assert_eq!(c.last_decision(), Some(&held));
    }

    #[tokio::test]
    async fn scale_in_drains_and_removes() {
        let (registry, aggregator, mut c) = controller();
        let ids: Vec<String> = (0..4)
            .map(|n| {
                registry
                    .register(Endpoint::new(format!("10.9.0.{n}"), 8080), 1)
                    .unwrap()
            })
            .collect();
        for id in &ids {
            registry.set_health(id, HealthVerdict::Healthy).unwrap();
        }

        let now = Instant::now();
        for id in &ids {
            aggregator.record(MetricSample {
                instance_id: id.clone(),
                at: now,
                cpu: 0.05,
                requests: 0,
            });
        }
        let decision = c.tick_at(now).await;
        assert_eq!((decision.reason, decision.target), (ScaleReason::ScaleIn, 2));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_count(), 2);
        for id in &ids[..2] {
            assert!(
                snapshot
                    .get(id)
                    .is_none_or(|i| i.state == InstanceState::Draining)
            );
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.list().len() > 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let remaining: Vec<String> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec![ids[2].clone(), ids[3].clone()]);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_, _, mut c) = controller();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { c.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
