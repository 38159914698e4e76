//! HTTP API for declaring subscriptions
//!
//! Thin axum layer over [`SubscriptionService`]. Every failure is rendered
//! as `{"error": <kind>, "message": <detail>}` with the status from
//! [`OperatorError::http_status`].

use crate::crd::EventSubscriptionSpec;
use crate::error::OperatorError;
use crate::service::SubscriptionService;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Shared handler state
pub struct ApiState {
    pub service: SubscriptionService,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        // Subscriptions
        .route(
            "/subscriptions/:namespace",
            get(list_subscriptions).put(upsert_subscription),
        )
        .route(
            "/subscriptions/:namespace/:service/:queue",
            get(get_subscription),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until the listener fails
pub async fn serve(addr: SocketAddr, router: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Subscription API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(e: OperatorError) -> ApiError {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.error_kind(),
            message: e.to_string(),
        }),
    )
}

/// Unreadable request bodies get the same error shape as service failures
fn rejection_response(rejection: JsonRejection) -> ApiError {
    let status = rejection.status();
    let error = if status == StatusCode::UNPROCESSABLE_ENTITY {
        "ValidationError"
    } else {
        "BadRequest"
    };
    (
        status,
        Json(ErrorResponse {
            error,
            message: rejection.body_text(),
        }),
    )
}

/// Body of a subscription declaration
#[derive(Debug, Deserialize)]
struct UpsertRequest {
    service: String,
    queue: String,
    #[serde(default)]
    filters: Vec<Value>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<Arc<ApiState>>) -> StatusCode {
    match state.service.probe().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[instrument(skip(state))]
async fn list_subscriptions(
    State(state): State<Arc<ApiState>>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<EventSubscriptionSpec>>, ApiError> {
    let specs = state.service.list(&namespace).await.map_err(error_response)?;
    if specs.is_empty() {
        return Err(error_response(OperatorError::NotFound(format!(
            "no subscriptions in namespace {}",
            namespace
        ))));
    }
    Ok(Json(specs))
}

#[instrument(skip(state, payload))]
async fn upsert_subscription(
    State(state): State<Arc<ApiState>>,
    Path(namespace): Path<String>,
    payload: Result<Json<UpsertRequest>, JsonRejection>,
) -> Result<Json<EventSubscriptionSpec>, ApiError> {
    let Json(request) = payload.map_err(rejection_response)?;
    state
        .service
        .upsert(&namespace, &request.service, &request.queue, &request.filters)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_subscription(
    State(state): State<Arc<ApiState>>,
    Path((namespace, service, queue)): Path<(String, String, String)>,
) -> Result<Json<EventSubscriptionSpec>, ApiError> {
    let spec = state
        .service
        .get(&service, &queue)
        .await
        .map_err(error_response)?;
    // Object names are not namespaced by the logical namespace
    if spec.api_namespace != namespace {
        return Err(error_response(OperatorError::NotFound(spec.resource_name())));
    }
    Ok(Json(spec))
}
