//! Query gateway: the boundary between route handlers and clusters
//!
//! Every route handler body runs through [`QueryGateway::execute`], which
//! resolves the cluster record, obtains the cached client and translates
//! any outcome into the uniform envelope. No error type escapes it.

use crate::cache::ClientCache;
use crate::client::SearchClient;
use crate::config::ClusterConfig;
use crate::error::{GatewayError, Result};
use crate::metrics;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Source of cluster records
///
/// Implemented by the persistence collaborator; the core never stores
/// cluster configuration itself.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterConfig>>;

    async fn list_clusters(&self) -> Result<Vec<ClusterConfig>>;
}

/// In-memory store, used by tests and the server binary
#[derive(Default)]
pub struct InMemoryClusterStore {
    clusters: RwLock<HashMap<String, ClusterConfig>>,
}

impl InMemoryClusterStore {
    pub fn new(clusters: impl IntoIterator<Item = ClusterConfig>) -> Self {
        Self {
            clusters: RwLock::new(
                clusters
                    .into_iter()
                    .map(|config| (config.id.clone(), config))
                    .collect(),
            ),
        }
    }

    pub fn upsert(&self, config: ClusterConfig) {
        self.clusters.write().insert(config.id.clone(), config);
    }

    pub fn remove(&self, id: &str) {
        self.clusters.write().remove(id);
    }
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterConfig>> {
        Ok(self.clusters.read().get(id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterConfig>> {
        let mut clusters: Vec<ClusterConfig> = self.clusters.read().values().cloned().collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clusters)
    }
}

/// Uniform envelope returned to every route handler
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// HTTP status for the API layer; not part of the serialized envelope
    #[serde(skip)]
    pub status: u16,
}

impl OperationResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status: 200,
        }
    }

    pub fn err(error: &GatewayError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            status: error.status_code(),
        }
    }
}

pub struct QueryGateway {
    store: Arc<dyn ClusterStore>,
    cache: Arc<ClientCache>,
}

impl QueryGateway {
    pub fn new(store: Arc<dyn ClusterStore>, cache: Arc<ClientCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ClientCache> {
        &self.cache
    }

    /// Run one operation against the identified cluster
    ///
    /// `operation` labels metrics and logs; the closure receives the live
    /// client and does the actual call.
    pub async fn execute<F, Fut>(
        &self,
        operation: &'static str,
        cluster_id: &str,
        op: F,
    ) -> OperationResult
    where
        F: FnOnce(Arc<SearchClient>) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let start = Instant::now();
        let result = self.run(cluster_id, op).await;
        metrics::record_operation_duration(operation, start.elapsed());

        match result {
            Ok(data) => {
                metrics::record_operation_success(operation, cluster_id);
                OperationResult::ok(data)
            }
            Err(error) => {
                metrics::record_operation_error(operation, cluster_id, error.error_type());
                warn!("Operation {} on {} failed: {}", operation, cluster_id, error);
                OperationResult::err(&error)
            }
        }
    }

    async fn run<F, Fut>(&self, cluster_id: &str, op: F) -> Result<Value>
    where
        F: FnOnce(Arc<SearchClient>) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let config = match self.store.get_cluster(cluster_id).await? {
            Some(config) => config,
            None => {
                // The cache is never authoritative over cluster existence.
                self.cache.invalidate(cluster_id);
                return Err(GatewayError::ClusterNotFound(cluster_id.to_string()));
            }
        };
        let client = self.cache.get_instance(&config).await?;
        op(client).await
    }

    /// Probe connectivity; the probe answers, it never fails
    pub async fn test_connection(&self, cluster_id: &str) -> OperationResult {
        self.execute("test_connection", cluster_id, |client| async move {
            Ok(json!({ "reachable": client.test_connection().await }))
        })
        .await
    }

    /// Tear down the cached client and tunnel for a cluster
    ///
    /// Invoked when a cluster's stored configuration changes or the
    /// operator explicitly disconnects.
    pub fn disconnect(&self, cluster_id: &str) {
        self.cache.invalidate(cluster_id);
    }

    /// Drop cache entries for clusters the collaborator no longer knows
    pub async fn sync_known_clusters(&self) -> Result<()> {
        let known: Vec<String> = self
            .store
            .list_clusters()
            .await?
            .into_iter()
            .map(|config| config.id)
            .collect();
        self.cache.retain(&known);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::tunnel::TunnelManager;

    fn direct_cluster(id: &str, url: &str) -> ClusterConfig {
        ClusterConfig {
            id: id.to_string(),
            name: None,
            url: url.to_string(),
            username: None,
            password: None,
            ssh_enabled: false,
            ssh_host: None,
            ssh_port: 22,
            ssh_user: None,
            ssh_password: None,
            ssh_key_file: None,
            local_port: 9200,
            remote_host: "localhost".into(),
            remote_port: 9200,
        }
    }

    fn make_gateway(clusters: Vec<ClusterConfig>) -> QueryGateway {
        let config = GatewayConfig::default();
        let store = Arc::new(InMemoryClusterStore::new(clusters));
        let tunnels = Arc::new(TunnelManager::new(config.clone()));
        let cache = Arc::new(ClientCache::new(config, tunnels));
        QueryGateway::new(store, cache)
    }

    #[tokio::test]
    async fn test_missing_cluster_maps_to_not_found() {
        let gateway = make_gateway(vec![]);
        let result = gateway
            .execute("cluster_health", "nope", |client| async move {
                client.get_cluster_health().await
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.status, 404);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_maps_to_bad_gateway() {
        // Nothing listens on port 1
        let gateway = make_gateway(vec![direct_cluster("c1", "http://127.0.0.1:1")]);
        let result = gateway
            .execute("cluster_health", "c1", |client| async move {
                client.get_cluster_health().await
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.status, 502);
        assert!(result.data.is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_maps_to_bad_request() {
        let gateway = make_gateway(vec![direct_cluster("c1", "http://127.0.0.1:1")]);
        let result = gateway
            .execute("index_stats", "c1", |client| async move {
                client.get_index_stats("../secrets").await
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.status, 400);
    }

    #[test]
    fn test_success_envelope_shape() {
        let result = OperationResult::ok(json!({ "status": "green" }));
        assert!(result.success);
        assert_eq!(result.status, 200);

        let serialized = serde_json::to_value(&result).unwrap();
        assert_eq!(serialized["success"], json!(true));
        assert!(serialized.get("error").is_none());
        assert!(serialized.get("status").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_clears_cache() {
        let gateway = make_gateway(vec![direct_cluster("c1", "http://127.0.0.1:19200")]);
        let _ = gateway
            .execute("ping", "c1", |client| async move {
                Ok(json!({ "endpoint": client.endpoint() }))
            })
            .await;
        assert!(gateway.cache().entry("c1").is_some());

        gateway.disconnect("c1");
        assert!(gateway.cache().entry("c1").is_none());
    }

    #[tokio::test]
    async fn test_sync_known_clusters_evicts_removed() {
        let store = Arc::new(InMemoryClusterStore::new(vec![direct_cluster(
            "c1",
            "http://127.0.0.1:19200",
        )]));
        let config = GatewayConfig::default();
        let tunnels = Arc::new(TunnelManager::new(config.clone()));
        let cache = Arc::new(ClientCache::new(config, tunnels));
        let gateway = QueryGateway::new(Arc::clone(&store) as Arc<dyn ClusterStore>, cache);

        let _ = gateway
            .execute("ping", "c1", |client| async move {
                Ok(json!({ "endpoint": client.endpoint() }))
            })
            .await;
        assert!(gateway.cache().entry("c1").is_some());

        store.remove("c1");
        gateway.sync_known_clusters().await.unwrap();
        assert!(gateway.cache().entry("c1").is_none());
    }
}
