//! Gateway error taxonomy
//!
//! Lower layers (tunnel manager, search client) always fail with a typed
//! error; the query gateway is the single place that translates these into
//! the uniform response envelope and an HTTP status.

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while connecting to or operating on a cluster.
///
/// Clone-able so a shared initialization future can hand one failure to
/// every concurrent waiter.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Malformed or incomplete cluster descriptor
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// DNS or network failure reaching the cluster or SSH host
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// SSH authentication or session failure
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Bounded wait exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed request envelope; never reaches the network
    #[error("Validation error: {0}")]
    Validation(String),

    /// The identified cluster has no stored configuration
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// The search engine itself returned a non-2xx status
    #[error("Remote cluster error ({status}): {message}")]
    Remote {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Connectivity(_) => "connectivity",
            GatewayError::Tunnel(_) => "tunnel",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Validation(_) => "validation",
            GatewayError::ClusterNotFound(_) => "cluster_not_found",
            GatewayError::Remote { .. } => "remote",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// HTTP status reported to route handlers for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Configuration(_) | GatewayError::Validation(_) => 400,
            GatewayError::ClusterNotFound(_) => 404,
            GatewayError::Connectivity(_) | GatewayError::Tunnel(_) => 502,
            GatewayError::Timeout(_) => 504,
            GatewayError::Remote { status, .. } => *status,
            GatewayError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::Configuration("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Validation("x".into()).status_code(), 400);
        assert_eq!(GatewayError::ClusterNotFound("c1".into()).status_code(), 404);
        assert_eq!(GatewayError::Connectivity("x".into()).status_code(), 502);
        assert_eq!(GatewayError::Tunnel("x".into()).status_code(), 502);
        assert_eq!(GatewayError::Timeout("x".into()).status_code(), 504);
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_remote_status_passes_through() {
        let err = GatewayError::Remote {
            status: 429,
            message: "too many requests".into(),
            body: None,
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.error_type(), "remote");
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(GatewayError::Tunnel("x".into()).error_type(), "tunnel");
        assert_eq!(GatewayError::Timeout("x".into()).error_type(), "timeout");
        assert_eq!(
            GatewayError::ClusterNotFound("c1".into()).error_type(),
            "cluster_not_found"
        );
    }
}
