use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "searchdeck-server")]
#[command(about = "Multi-cluster search administration gateway")]
#[command(version)]
struct Args {
    /// Clusters file path
    #[arg(short, long, default_value = "clusters.toml")]
    config: String,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "3090")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,searchdeck=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting searchdeck server on {}:{}", args.host, args.port);
    tracing::info!("Clusters file: {}", args.config);

    let file = searchdeck::ClustersFile::load(std::path::Path::new(&args.config))?;
    tracing::info!("Loaded {} cluster records", file.clusters.len());

    let metrics_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let store = Arc::new(searchdeck::InMemoryClusterStore::new(file.clusters));
    let tunnels = Arc::new(searchdeck::TunnelManager::new(file.gateway.clone()));
    tunnels.start();
    let cache = Arc::new(searchdeck::ClientCache::new(
        file.gateway.clone(),
        Arc::clone(&tunnels),
    ));
    let gateway = Arc::new(searchdeck::QueryGateway::new(store, cache));

    let addr = format!("{}:{}", args.host, args.port);
    searchdeck::api::ApiServer::new(gateway)
        .with_metrics(metrics_handle)
        .serve(&addr)
        .await?;

    Ok(())
}
