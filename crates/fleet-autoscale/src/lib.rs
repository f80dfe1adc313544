//! fleet-autoscale — the scaling control loop.
//!
//! `ScalingController` turns the windowed load from `fleet-metrics` into
//! launch and drain decisions, bounded by the fleet size limits, the
//! per-tick step and a cooldown after every applied decision.
//!
//! # Control loop
//!
//! ```text
//! every tick:
//!   resume drains stranded by failed terminations
//!   if backing off after failed applications: no-op
//!   load = windowed_mean(metric, window)
//!   if cooldown not elapsed:            no-op
//!   if active < min:                    target = min(active + step, min)
//!   if active > max:                    target = max(active - step, max)
//!   if load is Unknown:                 no-op
//!   if load > scale_out_threshold:      target = min(active + step, max)
//!   if load < scale_in_threshold:       target = max(active - step, min)
//! ```
//!
//! Scale-out launches through a `Provisioner` and registers `Pending`
//! instances. Scale-in marks instances `Draining`; the `Drainer` waits for
//! in-flight connections (bounded by the grace period) and terminates.

pub mod drain;
pub mod provision;
pub mod scaler;

pub use drain::Drainer;
pub use provision::{HttpProvisioner, Launched, ProvisionError, Provisioner, StaticPoolProvisioner};
pub use scaler::{ScaleReason, ScalingController, ScalingDecision, ScalingPolicy, scale_in_candidates};
