use crate::control::{ControlError, ControlGateway};
use crate::metrics::Metrics;
use crate::poller::SnapshotAggregator;
use crate::state::SnapshotStore;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<SnapshotStore>,
    pub aggregator: Arc<SnapshotAggregator>,
    pub gateway: Arc<ControlGateway>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RefreshResponse {
    pub outcome: &'static str,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/system/reboot", post(reboot_handler))
        .route("/api/system/shutdown", post(shutdown_handler))
        .route("/api/vms/:name/:action", post(vm_handler))
        .route("/api/containers/:name/:action", post(container_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let snapshot = state.store.current().await;
    Json((*snapshot).clone())
}

async fn refresh_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let outcome = state.aggregator.run_cycle().await;
    Json(RefreshResponse {
        outcome: outcome.label(),
    })
}

async fn reboot_handler(State(state): State<HttpAppState>) -> Response {
    control_response(state.gateway.reboot().await)
}

async fn shutdown_handler(State(state): State<HttpAppState>) -> Response {
    control_response(state.gateway.shutdown().await)
}

async fn vm_handler(
    State(state): State<HttpAppState>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    control_response(state.gateway.control_vm(&name, &action).await)
}

async fn container_handler(
    State(state): State<HttpAppState>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    control_response(state.gateway.control_container(&name, &action).await)
}

fn control_response(result: Result<(), ControlError>) -> Response {
    match result {
        Ok(()) => Json(ControlResponse {
            success: true,
            error: None,
        })
        .into_response(),
        Err(err) => {
            let status = match err {
                ControlError::UnknownAction(_) => StatusCode::BAD_REQUEST,
                ControlError::CapabilityDisabled(_) => StatusCode::CONFLICT,
                ControlError::Command { .. } => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(ControlResponse {
                    success: false,
                    error: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}
