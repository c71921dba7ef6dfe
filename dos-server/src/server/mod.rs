use crate::config::NameNodeConfig;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dos_core::api::ErrorResponse;
use dos_core::{DosError, NameNode, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

mod external;
mod internal;

use external::{create_object, delete_object, health, lease_object, update_object};
use internal::{ghost_stream, replica_stream};

pub struct ServerState {
    pub(crate) namenode: Arc<NameNode>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/objects", post(create_object))
        .route(
            "/api/v1/objects/:name",
            axum::routing::put(update_object).delete(delete_object),
        )
        .route("/api/v1/objects/:name/lease", get(lease_object))
        .route("/internal/v1/replicas/stream", get(replica_stream))
        .route("/internal/v1/ghosts/:id/stream", get(ghost_stream))
        .with_state(state)
}

pub async fn run_namenode(config: NameNodeConfig) -> Result<()> {
    let namenode = Arc::new(NameNode::new(config.options())?);
    let state = Arc::new(ServerState { namenode });

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        "name node listening on {}, replication {}, tolerance {}",
        config.bind_addr,
        config.replication,
        config.tolerance
    );

    axum::serve(listener, router(state))
        .await
        .map_err(|error| DosError::Http(error.to_string()))?;

    Ok(())
}

/// Run a name-node mutation on its own task so a dropped request cannot
/// cancel it halfway.
pub(crate) async fn run_detached<T, F>(mutation: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(mutation)
        .await
        .map_err(|error| DosError::Internal(format!("request task failed: {}", error)))?
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn error_status(error: &DosError) -> StatusCode {
    match error {
        DosError::ObjectAlreadyExists(_) => StatusCode::CONFLICT,
        DosError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
        DosError::NotEnoughReplicas { .. }
        | DosError::ReplicationFailed { .. }
        | DosError::ToleranceNotMet { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DosError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn dos_error_response(error: DosError) -> Response {
    let status = error_status(&error);
    if status.is_server_error() {
        tracing::warn!("request failed: {}", error);
    }
    response_error(status, error.to_string())
}
