use crate::error::{GatewayError, Result};
use crate::gateway::QueryGateway;
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<QueryGateway>,
    pub metrics_handle: Option<PrometheusHandle>,
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(gateway: Arc<QueryGateway>) -> Self {
        Self {
            state: AppState {
                gateway,
                metrics_handle: None,
            },
        }
    }

    /// Serve prometheus metrics rendered by the given exporter handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics_handle = Some(handle);
        self
    }

    /// Build the API router
    ///
    /// # Endpoints
    ///
    /// - `GET /healthz` - Gateway liveness
    /// - `GET /metrics` - Prometheus metrics
    /// - `GET /api/clusters` - List configured clusters
    /// - `POST /api/clusters/:id/ping` - Connectivity probe
    /// - `GET /api/clusters/:id/health` - Cluster health
    /// - `GET /api/clusters/:id/stats` - Cluster stats
    /// - `GET /api/clusters/:id/settings` - Cluster settings
    /// - `GET /api/clusters/:id/indices` - List indices
    /// - `GET /api/clusters/:id/indices/:index/stats` - Index stats
    /// - `GET /api/clusters/:id/indices/:index/settings` - Index settings
    /// - `PUT /api/clusters/:id/indices/:index/settings` - Update settings
    /// - `POST /api/clusters/:id/indices/:index/operation` - Index action
    /// - `POST /api/clusters/:id/query` - Ad-hoc query execution
    /// - `DELETE /api/clusters/:id/connection` - Disconnect
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(routes::healthz))
            .route("/metrics", get(routes::metrics))
            .route("/api/clusters", get(routes::list_clusters))
            .route("/api/clusters/:id/ping", post(routes::ping_cluster))
            .route("/api/clusters/:id/health", get(routes::cluster_health))
            .route("/api/clusters/:id/stats", get(routes::cluster_stats))
            .route("/api/clusters/:id/settings", get(routes::cluster_settings))
            .route("/api/clusters/:id/indices", get(routes::list_indices))
            .route(
                "/api/clusters/:id/indices/:index/stats",
                get(routes::index_stats),
            )
            .route(
                "/api/clusters/:id/indices/:index/settings",
                get(routes::index_settings).put(routes::update_index_settings),
            )
            .route(
                "/api/clusters/:id/indices/:index/operation",
                post(routes::index_operation),
            )
            .route("/api/clusters/:id/query", post(routes::execute_query))
            .route("/api/clusters/:id/connection", delete(routes::disconnect))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::Configuration(format!("Failed to bind {}: {}", addr, e))
        })?;
        tracing::info!("API listening on {}", addr);
        axum::serve(listener, self.router())
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}
