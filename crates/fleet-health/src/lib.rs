//! fleet-health — health checking for fleet instances.
//!
//! Provides the debounced `HealthRecord` state machine, a bounded HTTP
//! liveness probe, and the `HealthSupervisor` that runs one probe loop
//! per instance and applies verdict changes to the registry.
//!
//! # Architecture
//!
//! ```text
//! HealthSupervisor (follows registry snapshots)
//!   ├── Per-instance probe loop (random start offset, fixed interval)
//!   │   ├── http_probe() → Ok / ProbeError
//!   │   ├── passive failures from PassiveReporter
//!   │   └── HealthRecord (N successes / M failures)
//!   ├── InstanceRegistry::set_health on verdict change
//!   └── broadcast<HealthEvent>
//! ```
//!
//! # Verdicts
//!
//! `Unknown` and `Unhealthy` become `Healthy` after `healthy_threshold`
//! consecutive successes. `Unknown` and `Healthy` become `Unhealthy` after
//! `unhealthy_threshold` consecutive failures. Timeouts, refused
//! connections and non-2xx responses are all failures. The checker never
//! removes instances; it only reports verdicts.

pub mod checker;
pub mod monitor;

pub use checker::{HealthRecord, ProbeError, http_probe};
pub use monitor::{HealthEvent, HealthSupervisor, PassiveReporter};
