use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::session::{Session, SessionRegistry};

mod handlers;
pub mod request;

use request::Envelope;

/// HTTP front of the gateway: routes requests onto the session registry.
#[derive(Clone)]
pub struct GatewayService {
    registry: SessionRegistry,
    config: Arc<ServerConfig>,
}

impl GatewayService {
    pub fn new(registry: SessionRegistry, config: Arc<ServerConfig>) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(self) -> Router {
        let body_limit = self.config.max_request_bytes;
        Router::new()
            .route("/connect", get(handlers::connect))
            .route("/disconnect", post(handlers::disconnect))
            .route("/tx/begin", post(handlers::begin_transaction))
            .route("/tx/commit", post(handlers::commit_transaction))
            .route("/tx/rollback", post(handlers::rollback_transaction))
            .route("/query", post(handlers::query))
            .route("/exec", post(handlers::exec))
            .route("/health", get(handlers::health))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(self)
    }

    /// Authenticate the request envelope against the registry, renewing the lease.
    pub(crate) fn authenticate(&self, envelope: &Envelope) -> Result<Arc<Session>, ServerError> {
        self.registry
            .authenticate(&envelope.token, envelope.connection_id)
    }
}

/// Error half of every handler: renders a [`ServerError`] as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(ServerError);

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        response_from_error(self.0)
    }
}

pub(crate) fn response_from_error(err: ServerError) -> Response {
    let (status, message) = match err {
        ServerError::Validation(msg) => {
            debug!(error = %msg, "rejected request");
            (StatusCode::BAD_REQUEST, msg)
        }
        ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, err.to_string()),
        ServerError::Postgres(_) => {
            debug!(error = %err, "database error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        ServerError::CommitRolledBack => {
            info!("commit rolled back by the server");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        ServerError::DeadlineExceeded { .. } => {
            warn!(error = %err, "database deadline exceeded");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        ServerError::CapacityExhausted(kind) => {
            warn!(kind, "slot capacity exhausted");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        ServerError::Protocol(msg) => {
            error!(msg = %msg, "protocol error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode result".to_string(),
            )
        }
        ServerError::Internal(msg) => {
            error!(msg = %msg, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    };
    (status, Json(json!({ "error": message }))).into_response()
}
