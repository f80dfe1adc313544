//! fleet-api — admin HTTP API for the fleet control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness of the control plane itself |
//! | GET | `/api/v1/instances` | All registry records |
//! | GET | `/api/v1/routable` | Current routable set |
//! | GET | `/api/v1/health` | Latest health record per instance |
//! | GET | `/api/v1/templates` | Published launch templates |
//! | POST | `/api/v1/templates` | Publish a launch template |
//! | PUT | `/api/v1/templates/active` | Select the launch version |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, put};

use fleet_health::HealthSupervisor;
use fleet_metrics::MetricsAggregator;
use fleet_router::Router as TrafficRouter;
use fleet_state::{ConnectionTracker, InstanceRegistry, TemplateCatalog};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: InstanceRegistry,
    pub catalog: TemplateCatalog,
    pub router: Arc<TrafficRouter>,
    pub health: Arc<HealthSupervisor>,
    pub aggregator: Arc<MetricsAggregator>,
    pub tracker: ConnectionTracker,
    /// Window of the CPU gauge on `/metrics`.
    pub cpu_window: Duration,
}

/// Build the complete admin router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(handlers::list_instances))
        .route("/routable", get(handlers::routable))
        .route("/health", get(handlers::health_records))
        .route(
            "/templates",
            get(handlers::list_templates).post(handlers::publish_template),
        )
        .route("/templates/active", put(handlers::set_active_template))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
