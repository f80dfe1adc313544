//! Domain types for the fleet state store.
//!
//! These types represent the persisted and published state of the fleet.
//! All persisted types serialize to JSON for storage in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque instance identifier, assigned by the registry.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Network endpoint of an instance: host plus the application's bound port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` string suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Launched, not yet passed health checks.
    Pending,
    /// Healthy and eligible for traffic.
    InService,
    /// Failed health checks after having been (or while waiting to be) in service.
    Unhealthy,
    /// Removed from traffic, waiting for in-flight work before termination.
    Draining,
    Terminated,
}

impl InstanceState {
    pub const ALL: [InstanceState; 5] = [
        InstanceState::Pending,
        InstanceState::InService,
        InstanceState::Unhealthy,
        InstanceState::Draining,
        InstanceState::Terminated,
    ];

    /// Counts toward the fleet size.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::InService | InstanceState::Unhealthy
        )
    }

    /// Whether a registry mutation may move an instance from `self` to `next`.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Terminated, _) => false,
            (Draining, Terminated) => true,
            (Draining, _) => false,
            (_, Pending) => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::InService => "in_service",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Draining => "draining",
            InstanceState::Terminated => "terminated",
        }
    }
}

/// Health verdict as determined by debounced health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A registered backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Registration order; breaks ties between equal creation times.
    pub seq: u64,
    pub endpoint: Endpoint,
    pub template_version: u32,
    pub state: InstanceState,
    pub health: HealthVerdict,
    /// Identifier the provisioning backend knows this instance by.
    pub provider_ref: Option<String>,
    /// Unix timestamp (seconds) of registration.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last lifecycle change.
    pub state_changed_at: u64,
}

impl Instance {
    /// Eligible for new traffic.
    pub fn is_routable(&self) -> bool {
        self.state == InstanceState::InService && self.health == HealthVerdict::Healthy
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Immutable view of the registry, published after every committed mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSnapshot {
    /// Monotonic; bumped on every publish.
    pub version: u64,
    /// Ordered by creation time, then registration order.
    pub instances: Vec<Instance>,
}

impl FleetSnapshot {
    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Instances counted toward the fleet size (pending, in service, unhealthy).
    pub fn active(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.state.is_active())
    }

    pub fn active_count(&self) -> u32 {
        self.active().count() as u32
    }

    pub fn in_state(&self, state: InstanceState) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(move |i| i.state == state)
    }

    pub fn count_in_state(&self, state: InstanceState) -> usize {
        self.in_state(state).count()
    }
}

// ── Launch templates ──────────────────────────────────────────────

/// Immutable, versioned description of how to launch an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub version: u32,
    /// Port the application binds on instances launched from this version.
    pub app_port: u16,
    /// Opaque artifact reference (image id) handed to the provisioner.
    pub artifact: String,
    /// Unix timestamp (seconds) of publication.
    #[serde(default)]
    pub created_at: u64,
}

impl From<&fleet_core::TemplateConfig> for LaunchTemplate {
    fn from(t: &fleet_core::TemplateConfig) -> Self {
        Self {
            version: t.version,
            app_port: t.app_port,
            artifact: t.artifact.clone(),
            created_at: 0,
        }
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
