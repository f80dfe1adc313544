//! fleet-core — configuration and shared vocabulary for the fleet control plane.
//!
//! `FleetConfig` is the parsed form of `fleet.toml`. Every section has
//! defaults, so a minimal file only needs a `[[templates]]` entry and a
//! provisioner.

pub mod config;
pub mod types;

pub use config::{ConfigError, FleetConfig, ProvisionerConfig, TemplateConfig};
pub use types::LoadMetric;
