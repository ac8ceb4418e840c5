// src/server/routes.rs

//! The HTTP surface of the controller: the peer protocol (`/cluster/*`), the
//! liveness endpoint polled by secondaries, the operator endpoints under
//! `/admin` and the Prometheus scrape endpoint.

use crate::core::cluster::ClusterController;
use crate::core::cluster::protocol::{NotifyMessage, PromoteRequest};
use crate::core::errors::ClusterError;
use crate::core::metrics::{self, gather_metrics};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

type SharedController = Arc<ClusterController>;

/// Body returned by every `/admin` route.
#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

impl AdminResponse {
    fn ok(message: impl Into<String>) -> Response {
        (
            StatusCode::OK,
            Json(AdminResponse {
                success: true,
                message: message.into(),
            }),
        )
            .into_response()
    }

    fn failed(action: &str, err: &ClusterError) -> Response {
        log_failure(action, err);
        (
            err.status_code(),
            Json(AdminResponse {
                success: false,
                message: err.to_string(),
            }),
        )
            .into_response()
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Logs a refused request at `warn`, anything that failed midway at `error`.
fn log_failure(action: &str, err: &ClusterError) {
    if err.is_rejection() {
        warn!("Rejected {}: {}", action, err);
    } else {
        error!("{} failed: {}", action, err);
    }
}

/// Builds the router. `/metrics` is only mounted when `metrics_enabled`.
pub fn router(controller: SharedController, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/cluster/notify", post(notify))
        .route("/cluster/promote", post(promote))
        .route("/cluster/status", get(status))
        .route("/admin/failover/{node_id}", post(admin_failover))
        .route("/admin/switchover/{node_id}", post(admin_switchover))
        .route("/admin/leave", post(admin_leave));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }
    router.with_state(controller)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn notify(
    State(controller): State<SharedController>,
    Json(message): Json<NotifyMessage>,
) -> Result<StatusCode, ClusterError> {
    controller.handle_new_main(&message).await.inspect_err(|e| {
        log_failure(&format!("new-main notification from {}", message.new_main_ip), e)
    })?;
    Ok(StatusCode::OK)
}

async fn promote(
    State(controller): State<SharedController>,
    Json(request): Json<PromoteRequest>,
) -> Result<impl IntoResponse, ClusterError> {
    let ack = controller
        .handle_promote_request(&request)
        .await
        .inspect_err(|e| log_failure(&format!("promote request from {}", request.current_main), e))?;
    Ok((StatusCode::OK, Json(json!({ "status": ack.as_str() }))))
}

async fn status(State(controller): State<SharedController>) -> Result<impl IntoResponse, ClusterError> {
    Ok(Json(controller.status().await?))
}

/// Admin routes require `Authorization: Bearer <cluster_secret>`.
async fn authorize_admin(controller: &ClusterController, headers: &HeaderMap) -> Result<(), ClusterError> {
    let config = controller.store().require_config().await?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ClusterError::AuthenticationFailed("missing bearer token".to_string()))?;

    if bool::from(presented.as_bytes().ct_eq(config.cluster_secret.as_bytes())) {
        Ok(())
    } else {
        Err(ClusterError::AuthenticationFailed(
            "invalid bearer token".to_string(),
        ))
    }
}

async fn admin_failover(
    State(controller): State<SharedController>,
    Path(node_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let action = format!("admin failover to node {node_id}");
    if let Err(e) = authorize_admin(&controller, &headers).await {
        return AdminResponse::failed(&action, &e);
    }
    match controller.manual_failover(node_id).await {
        Ok(()) => {
            info!("Admin: manual failover to node {} initiated.", node_id);
            AdminResponse::ok(format!("failover to node {node_id} initiated"))
        }
        Err(e) => AdminResponse::failed(&action, &e),
    }
}

async fn admin_switchover(
    State(controller): State<SharedController>,
    Path(node_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let action = format!("admin switchover to node {node_id}");
    if let Err(e) = authorize_admin(&controller, &headers).await {
        return AdminResponse::failed(&action, &e);
    }
    match controller.switchover_to_secondary(node_id).await {
        Ok(()) => AdminResponse::ok(format!("switchover to node {node_id} completed")),
        Err(e) => AdminResponse::failed(&action, &e),
    }
}

async fn admin_leave(State(controller): State<SharedController>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize_admin(&controller, &headers).await {
        return AdminResponse::failed("admin leave", &e);
    }
    match controller.leave_cluster().await {
        Ok(()) => AdminResponse::ok("left cluster"),
        Err(e) => AdminResponse::failed("admin leave", &e),
    }
}

/// Refreshes the in-progress gauge, then encodes every registered metric.
async fn metrics_handler(State(controller): State<SharedController>) -> impl IntoResponse {
    let in_progress = controller.failover_state().is_in_progress();
    metrics::FAILOVER_IN_PROGRESS.set(if in_progress { 1.0 } else { 0.0 });

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}
