//! Searchdeck - one control plane for many search clusters
//!
//! Administers several independent Elasticsearch-compatible clusters:
//! health, stats, settings, index lifecycle and ad-hoc queries, over a
//! direct HTTP connection or through an SSH-forwarded loopback port.
//!
//! # Architecture
//!
//! - **Tunnel**: at most one SSH session + loopback listener per cluster,
//!   with explicit lifecycle states, borrower counting and idle reaping
//! - **Cache**: cluster id → live client, single-flight initialization,
//!   fingerprint-driven invalidation
//! - **Client**: typed facade over the engine's administrative REST
//!   surface, with all request validation ahead of the network
//! - **Gateway**: the boundary function translating every outcome into
//!   the uniform `{success, data, error}` envelope
//! - **Api**: axum surface consumed by the dashboard collaborator

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod tunnel;

pub use cache::{ClientCache, ClientEntry};
pub use client::{OperationRequest, QueryRequest, SearchClient, SettingsOptions};
pub use config::{ClusterConfig, ClustersFile, GatewayConfig};
pub use error::{GatewayError, Result};
pub use gateway::{ClusterStore, InMemoryClusterStore, OperationResult, QueryGateway};
pub use tunnel::{TunnelHandle, TunnelManager, TunnelState};
