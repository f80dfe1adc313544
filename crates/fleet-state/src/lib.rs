//! fleet-state — the fleet's source of truth.
//!
//! `InstanceRegistry` is the single writer for instance records. Every
//! committed mutation is persisted to the redb-backed `FleetStore` and
//! then published as an immutable `FleetSnapshot` on a watch channel, so
//! readers (router, health supervisor, metrics collector) never take the
//! writer's lock and never see a half-applied change.
//!
//! # Architecture
//!
//! ```text
//! InstanceRegistry ──write-through──▶ FleetStore (redb)
//!        │
//!        └── watch<Arc<FleetSnapshot>> ──▶ RouterSync, HealthSupervisor, ...
//!
//! TemplateCatalog  ──write-through──▶ FleetStore (redb)
//! ConnectionTracker (per-instance in-flight counters, shared with the router)
//! ```

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod templates;
pub mod tracker;
pub mod types;

pub use error::{RegistryError, RegistryResult, StoreError, StoreResult, TemplateError};
pub use registry::InstanceRegistry;
pub use store::FleetStore;
pub use templates::TemplateCatalog;
pub use tracker::{ConnectionTracker, InflightGuard, InstanceCounters};
pub use types::*;
