//! Route handlers
//!
//! Every cluster route is a thin wrapper: extract inputs, hand the
//! operation to the gateway, return the envelope with its status.

use super::server::AppState;
use crate::client::{OperationRequest, QueryRequest, SettingsOptions};
use crate::gateway::OperationResult;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

fn envelope(result: OperationResult) -> Response {
    let status =
        StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(result)).into_response()
}

pub(super) async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

pub(super) async fn list_clusters(State(state): State<AppState>) -> Response {
    match state.gateway.store().list_clusters().await {
        Ok(clusters) => envelope(OperationResult::ok(
            serde_json::to_value(clusters).unwrap_or(Value::Null),
        )),
        Err(error) => envelope(OperationResult::err(&error)),
    }
}

pub(super) async fn ping_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    envelope(state.gateway.test_connection(&id).await)
}

pub(super) async fn cluster_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("cluster_health", &id, |client| async move {
                client.get_cluster_health().await
            })
            .await,
    )
}

pub(super) async fn cluster_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("cluster_stats", &id, |client| async move {
                client.get_cluster_stats().await
            })
            .await,
    )
}

pub(super) async fn cluster_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(options): Query<SettingsOptions>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("cluster_settings", &id, move |client| async move {
                client.get_cluster_settings(options).await
            })
            .await,
    )
}

pub(super) async fn list_indices(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("list_indices", &id, |client| async move {
                client.list_indices().await
            })
            .await,
    )
}

pub(super) async fn index_stats(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, String)>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("index_stats", &id, move |client| async move {
                client.get_index_stats(&index).await
            })
            .await,
    )
}

pub(super) async fn index_settings(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, String)>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("index_settings", &id, move |client| async move {
                client.get_index_settings(&index).await
            })
            .await,
    )
}

pub(super) async fn update_index_settings(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, String)>,
    Json(settings): Json<Value>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("update_index_settings", &id, move |client| async move {
                client.update_index_settings(&index, &settings).await
            })
            .await,
    )
}

pub(super) async fn index_operation(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, String)>,
    Json(request): Json<OperationRequest>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("index_operation", &id, move |client| async move {
                client.execute_index_operation(&index, &request).await
            })
            .await,
    )
}

pub(super) async fn execute_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Response {
    envelope(
        state
            .gateway
            .execute("execute_query", &id, move |client| async move {
                client.execute_query(&request).await
            })
            .await,
    )
}

pub(super) async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    state.gateway.disconnect(&id);
    envelope(OperationResult::ok(json!({ "disconnected": id })))
}
