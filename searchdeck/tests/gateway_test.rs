//! End-to-end tests driving the gateway against a stub search engine
//!
//! The stub speaks just enough of the engine's REST dialect for the
//! operations under test, bound to an ephemeral loopback port.

use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use searchdeck::{
    ClientCache, ClusterConfig, GatewayConfig, InMemoryClusterStore, QueryGateway, QueryRequest,
    TunnelManager,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn spawn_stub_engine() -> SocketAddr {
    let app = Router::new()
        .route(
            "/",
            get(|| async {
                Json(json!({
                    "cluster_name": "stub",
                    "version": { "number": "8.11.0" }
                }))
            }),
        )
        .route(
            "/_cluster/health",
            get(|| async {
                Json(json!({ "status": "green", "number_of_nodes": 1 }))
            }),
        )
        .route(
            "/_cluster/stats",
            get(|| async { Json(json!({ "indices": { "count": 2 } })) }),
        )
        .route(
            "/_cat/indices",
            get(|| async { Json(json!([{ "index": "logs", "health": "green" }])) }),
        )
        .route(
            "/logs/_search",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "took": 1, "echo": body }))
            }),
        )
        .route(
            "/logs/_settings",
            put(|Json(body): Json<Value>| async move {
                Json(json!({ "acknowledged": true, "applied": body }))
            }),
        )
        .route(
            "/missing/_stats",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({
                        "error": {
                            "type": "index_not_found_exception",
                            "reason": "no such index [missing]"
                        },
                        "status": 404
                    })),
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

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
    let config = GatewayConfig {
        probe_timeout_ms: 1000,
        ..GatewayConfig::default()
    };
    let store = Arc::new(InMemoryClusterStore::new(clusters));
    let tunnels = Arc::new(TunnelManager::new(config.clone()));
    let cache = Arc::new(ClientCache::new(config, tunnels));
    QueryGateway::new(store, cache)
}

#[tokio::test]
async fn test_cluster_health_roundtrip() {
    let addr = spawn_stub_engine().await;
    let gateway = make_gateway(vec![direct_cluster("c1", &format!("http://{}", addr))]);

    let result = gateway
        .execute("cluster_health", "c1", |client| async move {
            client.get_cluster_health().await
        })
        .await;

    assert!(result.success, "health call failed: {:?}", result.error);
    assert_eq!(result.status, 200);
    assert_eq!(result.data.unwrap()["status"], json!("green"));
}

#[tokio::test]
async fn test_query_with_string_body_is_parsed_and_sent() {
    let addr = spawn_stub_engine().await;
    let gateway = make_gateway(vec![direct_cluster("c1", &format!("http://{}", addr))]);

    let request = QueryRequest {
        index: Some("logs".into()),
        method: "POST".into(),
        path: "/_search".into(),
        body: Some(json!("{\"query\":{\"match_all\":{}}}")),
    };
    let result = gateway
        .execute("execute_query", "c1", move |client| async move {
            client.execute_query(&request).await
        })
        .await;

    assert!(result.success, "query failed: {:?}", result.error);
    let data = result.data.unwrap();
    // The stub echoes the body it received: the parsed object, not the
    // raw string.
    assert!(data["echo"]["query"]["match_all"].is_object());
}

#[tokio::test]
async fn test_malformed_body_never_reaches_the_network() {
    // An unreachable endpoint: a 400 here proves validation ran first.
    let gateway = make_gateway(vec![direct_cluster("c1", "http://127.0.0.1:1")]);

    let request = QueryRequest {
        index: Some("logs".into()),
        method: "POST".into(),
        path: "/_search".into(),
        body: Some(json!("{\"bad json")),
    };
    let result = gateway
        .execute("execute_query", "c1", move |client| async move {
            client.execute_query(&request).await
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.status, 400);
}

#[tokio::test]
async fn test_disallowed_method_never_reaches_the_network() {
    let gateway = make_gateway(vec![direct_cluster("c1", "http://127.0.0.1:1")]);

    let request = QueryRequest {
        index: None,
        method: "PATCH".into(),
        path: "/_nodes".into(),
        body: None,
    };
    let result = gateway
        .execute("execute_query", "c1", move |client| async move {
            client.execute_query(&request).await
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.status, 400);
}

#[tokio::test]
async fn test_remote_error_status_passes_through() {
    let addr = spawn_stub_engine().await;
    let gateway = make_gateway(vec![direct_cluster("c1", &format!("http://{}", addr))]);

    let result = gateway
        .execute("index_stats", "c1", |client| async move {
            client.get_index_stats("missing").await
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.status, 404);
    assert!(result.error.unwrap().contains("no such index [missing]"));
}

#[tokio::test]
async fn test_update_index_settings_roundtrip() {
    let addr = spawn_stub_engine().await;
    let gateway = make_gateway(vec![direct_cluster("c1", &format!("http://{}", addr))]);

    let settings = json!({ "index": { "number_of_replicas": 2 } });
    let result = gateway
        .execute("update_index_settings", "c1", move |client| async move {
            client.update_index_settings("logs", &settings).await
        })
        .await;

    assert!(result.success, "update failed: {:?}", result.error);
    let data = result.data.unwrap();
    assert_eq!(data["acknowledged"], json!(true));
    assert_eq!(data["applied"]["index"]["number_of_replicas"], json!(2));
}

#[tokio::test]
async fn test_probe_answers_true_then_false() {
    let addr = spawn_stub_engine().await;
    let reachable = make_gateway(vec![direct_cluster("c1", &format!("http://{}", addr))]);
    let result = reachable.test_connection("c1").await;
    assert!(result.success);
    assert_eq!(result.data.unwrap()["reachable"], json!(true));

    // Nothing listens on port 1; the probe answers false within its
    // timeout instead of failing.
    let unreachable = make_gateway(vec![direct_cluster("c2", "http://127.0.0.1:1")]);
    let start = Instant::now();
    let result = unreachable.test_connection("c2").await;
    assert!(result.success);
    assert_eq!(result.data.unwrap()["reachable"], json!(false));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_client() {
    let addr = spawn_stub_engine().await;
    let config = GatewayConfig::default();
    let tunnels = Arc::new(TunnelManager::new(config.clone()));
    let cache = Arc::new(ClientCache::new(config, tunnels));
    let cluster = direct_cluster("c1", &format!("http://{}", addr));

    let (a, b, c, d) = tokio::join!(
        cache.get_instance(&cluster),
        cache.get_instance(&cluster),
        cache.get_instance(&cluster),
        cache.get_instance(&cluster)
    );
    let a = a.unwrap();
    for other in [b.unwrap(), c.unwrap(), d.unwrap()] {
        assert!(Arc::ptr_eq(&a, &other));
    }

    // A later lookup still reuses the cached client.
    let e = cache.get_instance(&cluster).await.unwrap();
    assert!(Arc::ptr_eq(&a, &e));
}

#[tokio::test]
async fn test_invalidation_yields_fresh_client() {
    let addr = spawn_stub_engine().await;
    let config = GatewayConfig::default();
    let tunnels = Arc::new(TunnelManager::new(config.clone()));
    let cache = Arc::new(ClientCache::new(config, tunnels));
    let cluster = direct_cluster("c1", &format!("http://{}", addr));

    let before = cache.get_instance(&cluster).await.unwrap();
    cache.invalidate("c1");
    let after = cache.get_instance(&cluster).await.unwrap();

    assert!(!Arc::ptr_eq(&before, &after));
    // Both clients still work against the same endpoint.
    assert!(after.test_connection().await);
}
