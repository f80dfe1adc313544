//! Admin API handlers.
//!
//! Reads go to the registry, the router and the health supervisor; the
//! only writes are template publication and selection.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_core::LoadMetric;
use fleet_metrics::{FleetGauges, render_prometheus};
use fleet_state::{LaunchTemplate, TemplateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn template_error(e: TemplateError) -> axum::response::Response {
    let status = match &e {
        TemplateError::Invalid(_) => StatusCode::BAD_REQUEST,
        TemplateError::AlreadyPublished(_) => StatusCode::CONFLICT,
        TemplateError::NotFound(_) | TemplateError::Empty => StatusCode::NOT_FOUND,
        TemplateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ── Fleet ──────────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.list())
}

/// GET /api/v1/routable
pub async fn routable(State(state): State<ApiState>) -> impl IntoResponse {
    let set = state.router.current();
    ApiResponse::ok(set.as_ref().clone())
}

/// GET /api/v1/health
pub async fn health_records(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.health.records())
}

// ── Templates ──────────────────────────────────────────────────

#[derive(Serialize)]
struct TemplateList {
    active: Option<u32>,
    templates: Vec<LaunchTemplate>,
}

/// Template publication body.
#[derive(Deserialize)]
pub struct PublishTemplate {
    pub version: u32,
    pub app_port: u16,
    pub artifact: String,
}

/// Active template selection body.
#[derive(Deserialize)]
pub struct SelectTemplate {
    pub version: u32,
}

/// GET /api/v1/templates
pub async fn list_templates(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(TemplateList {
        active: state.catalog.active().ok().map(|t| t.version),
        templates: state.catalog.list(),
    })
}

/// POST /api/v1/templates
pub async fn publish_template(
    State(state): State<ApiState>,
    Json(req): Json<PublishTemplate>,
) -> impl IntoResponse {
    let template = LaunchTemplate {
        version: req.version,
        app_port: req.app_port,
        artifact: req.artifact,
        created_at: 0,
    };
    match state.catalog.publish(template) {
        Ok(published) => (StatusCode::CREATED, ApiResponse::ok(published)).into_response(),
        Err(e) => template_error(e),
    }
}

/// PUT /api/v1/templates/active
pub async fn set_active_template(
    State(state): State<ApiState>,
    Json(req): Json<SelectTemplate>,
) -> impl IntoResponse {
    match state.catalog.set_active(req.version) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "active": req.version })).into_response(),
        Err(e) => template_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let gauges = FleetGauges::new(
        &snapshot,
        state.router.current().len(),
        state
            .aggregator
            .windowed_mean(LoadMetric::Cpu, state.cpu_window),
        state.tracker.in_flight_all(),
    );
    debug!(snapshot_version = snapshot.version, "rendering fleet gauges");
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&gauges),
    )
}
