use super::{dos_error_response, response_error, run_detached, ServerState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dos_core::api::{
    CreateObjectRequest, HealthResponse, LeaseResponse, StatusResponse, UpdateObjectRequest,
    CREATED, DELETED, UPDATED,
};
use std::sync::Arc;

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let status = state.namenode.status().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        nodes: status.nodes,
        ghosts: status.ghosts,
        objects: status.objects,
        sequence: status.sequence,
    })
}

pub(crate) async fn create_object(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateObjectRequest>,
) -> Response {
    let CreateObjectRequest { name, data } = request;
    if name.trim().is_empty() || name.contains('/') {
        return response_error(StatusCode::BAD_REQUEST, "invalid object name");
    }

    let namenode = state.namenode.clone();
    let created = run_detached(async move { namenode.create_object(&name, &data).await }).await;
    match created {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(StatusResponse {
                status: CREATED.to_string(),
                sequence: outcome.commit.sequence,
            }),
        )
            .into_response(),
        Err(error) => dos_error_response(error),
    }
}

pub(crate) async fn delete_object(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Response {
    let namenode = state.namenode.clone();
    match run_detached(async move { namenode.delete_object(&name).await }).await {
        Ok(report) => Json(StatusResponse {
            status: DELETED.to_string(),
            sequence: report.sequence,
        })
        .into_response(),
        Err(error) => dos_error_response(error),
    }
}

pub(crate) async fn update_object(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(request): Json<UpdateObjectRequest>,
) -> Response {
    let namenode = state.namenode.clone();
    let updated =
        run_detached(async move { namenode.update_object(&name, &request.data).await }).await;
    match updated {
        Ok(report) => Json(StatusResponse {
            status: UPDATED.to_string(),
            sequence: report.sequence,
        })
        .into_response(),
        Err(error) => dos_error_response(error),
    }
}

pub(crate) async fn lease_object(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Response {
    match state.namenode.lease_object(&name).await {
        Ok(lease_endpoints) => Json(LeaseResponse { lease_endpoints }).into_response(),
        Err(error) => dos_error_response(error),
    }
}
