//! HTTP transport.
//!
//! `POST /identify` takes `{ "email"?, "phoneNumber"? }` and answers with the
//! consolidated contact. Engine work runs on the [`ReconcileRuntime`] pool;
//! handlers only queue it and wait off the async executor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::runtime::ReconcileRuntime;
use crate::engine::IdentifyResponse;
use crate::error::{ExecutionError, ReconcileError, ValidationError};
use crate::request::IdentifyRequest;
use crate::storage::StorageError;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<ReconcileRuntime>,
    request_timeout: Duration,
}

impl AppState {
    /// State serving requests from `runtime`, each waiting at most `request_timeout`.
    #[must_use]
    pub fn new(runtime: Arc<ReconcileRuntime>, request_timeout: Duration) -> Self {
        Self {
            runtime,
            request_timeout,
        }
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/health", get(health))
        .route("/api", get(api_info))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer())
        .with_state(state)
}

// Any origin may call the API; preflights are answered by the layer.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600))
}

/// Serves the router on `listener` until `shutdown` resolves.
///
/// # Errors
/// I/O errors from the listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn identify(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("http_identify", %request_id);

    async move {
        let payload: Value = serde_json::from_slice(&body).map_err(|e| {
            ValidationError::MalformedBody {
                reason: e.to_string(),
            }
        })?;
        let request = IdentifyRequest::from_json(payload.get("email"), payload.get("phoneNumber"))?;

        let handle = state.runtime.submit(request)?;
        let timeout = state.request_timeout;
        let response = tokio::task::spawn_blocking(move || handle.join_timeout(timeout)).await??;

        tracing::debug!(
            primary = %response.contact.primary_contact_id,
            secondaries = response.contact.secondary_contact_ids.len(),
            "identify served"
        );
        Ok::<_, ApiError>(Json(response))
    }
    .instrument(span)
    .await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "success",
        "message": "Service is healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "status": "success",
        "message": "Contact Identity Reconciliation Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "identify": "POST /identify",
            "health": "GET /health",
        },
    }))
}

async fn not_found(method: Method, uri: Uri) -> Response {
    let body = ErrorBody {
        error: "not_found",
        message: format!("Route {method} {} not found", uri.path()),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Failure of an HTTP request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request or the engine failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The blocking wait task died.
    #[error("request task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Reconcile(err.into())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let Self::Reconcile(err) = self else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        };
        match err {
            ReconcileError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ReconcileError::Execution(ExecutionError::Timeout { .. }) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            }
            ReconcileError::Execution(
                ExecutionError::ContentionExhausted { .. }
                | ExecutionError::QueueFull { .. }
                | ExecutionError::Disconnected,
            )
            | ReconcileError::Storage(StorageError::Conflict(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ReconcileError::Invariant(_)
            | ReconcileError::Storage(_)
            | ReconcileError::Execution(ExecutionError::WorkerSpawn { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status_and_code();
        let message = match &self {
            Self::Reconcile(ReconcileError::Validation(v)) => v.to_string(),
            Self::Reconcile(ReconcileError::Execution(e))
                if status != StatusCode::INTERNAL_SERVER_ERROR =>
            {
                tracing::warn!(error = %e, "identify unavailable");
                e.to_string()
            }
            _ => {
                tracing::error!(error = %self, "identify failed");
                "An unexpected error occurred".to_string()
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}
