//! Cluster descriptors and gateway tuning

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection descriptor for one remote cluster
///
/// Supplied by the persistence collaborator and never mutated by the core;
/// a change to any connectivity-relevant field shows up as a new
/// [`fingerprint`](ClusterConfig::fingerprint) and invalidates the cached
/// client and tunnel.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Stable unique identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Direct endpoint, used when SSH is disabled
    pub url: String,

    /// Basic auth username
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Reach the cluster through an SSH-forwarded local port
    #[serde(default)]
    pub ssh_enabled: bool,

    /// SSH jump host
    #[serde(default)]
    pub ssh_host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default)]
    pub ssh_user: Option<String>,

    #[serde(default, skip_serializing)]
    pub ssh_password: Option<String>,

    /// Private key file, used when no SSH password is set
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,

    /// Loopback port the tunnel binds (0 picks an ephemeral port)
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Cluster host as seen from the SSH server
    #[serde(default = "default_remote_host")]
    pub remote_host: String,

    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    9200
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_remote_port() -> u16 {
    9200
}

impl ClusterConfig {
    /// Check structural invariants, without any network action
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "cluster id must not be empty".to_string(),
            ));
        }

        if self.ssh_enabled {
            if self.ssh_host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                return Err(GatewayError::Configuration(format!(
                    "cluster {}: ssh_host is required when SSH is enabled",
                    self.id
                )));
            }
            if self.ssh_user.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(GatewayError::Configuration(format!(
                    "cluster {}: ssh_user is required when SSH is enabled",
                    self.id
                )));
            }
            if self.ssh_password.is_none() && self.ssh_key_file.is_none() {
                return Err(GatewayError::Configuration(format!(
                    "cluster {}: an SSH password or key file is required",
                    self.id
                )));
            }
        } else if self.url.trim().is_empty() {
            return Err(GatewayError::Configuration(format!(
                "cluster {}: url must not be empty",
                self.id
            )));
        }

        Ok(())
    }

    /// Hash of the connectivity-relevant fields
    ///
    /// Display-only fields (`name`) are excluded so renaming a cluster does
    /// not tear down its connection.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.url.hash(&mut hasher);
        self.username.hash(&mut hasher);
        self.password.hash(&mut hasher);
        self.ssh_enabled.hash(&mut hasher);
        self.ssh_host.hash(&mut hasher);
        self.ssh_port.hash(&mut hasher);
        self.ssh_user.hash(&mut hasher);
        self.ssh_password.hash(&mut hasher);
        self.ssh_key_file.hash(&mut hasher);
        self.local_port.hash(&mut hasher);
        self.remote_host.hash(&mut hasher);
        self.remote_port.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_enabled", &self.ssh_enabled)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field(
                "ssh_password",
                &self.ssh_password.as_ref().map(|_| "<redacted>"),
            )
            .field("ssh_key_file", &self.ssh_key_file)
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// Gateway tuning
///
/// Every timeout and the tunnel grace period are explicit configuration
/// rather than constants buried at use sites.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatewayConfig {
    /// TCP connect timeout for HTTP calls, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Overall timeout per HTTP call, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for the connectivity probe, in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// SSH connect + handshake timeout, in milliseconds
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_ms: u64,

    /// SSH keepalive interval, in milliseconds
    #[serde(default = "default_ssh_keepalive_interval")]
    pub ssh_keepalive_interval_ms: u64,

    /// How long an unborrowed tunnel stays up before it is reaped
    #[serde(default = "default_tunnel_idle_grace")]
    pub tunnel_idle_grace_ms: u64,

    /// Interval between tunnel maintenance sweeps
    #[serde(default = "default_tunnel_sweep_interval")]
    pub tunnel_sweep_interval_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    30000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_ssh_connect_timeout() -> u64 {
    10000
}

fn default_ssh_keepalive_interval() -> u64 {
    15000
}

fn default_tunnel_idle_grace() -> u64 {
    60000
}

fn default_tunnel_sweep_interval() -> u64 {
    15000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            ssh_connect_timeout_ms: default_ssh_connect_timeout(),
            ssh_keepalive_interval_ms: default_ssh_keepalive_interval(),
            tunnel_idle_grace_ms: default_tunnel_idle_grace(),
            tunnel_sweep_interval_ms: default_tunnel_sweep_interval(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ssh_connect_timeout_ms)
    }

    pub fn ssh_keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.ssh_keepalive_interval_ms)
    }

    pub fn tunnel_idle_grace(&self) -> Duration {
        Duration::from_millis(self.tunnel_idle_grace_ms)
    }

    pub fn tunnel_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.tunnel_sweep_interval_ms)
    }
}

/// On-disk cluster registry for the server binary
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ClustersFile {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ClustersFile {
    /// Load and validate a TOML clusters file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file: ClustersFile = toml::from_str(&raw).map_err(|e| {
            GatewayError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        for cluster in &file.clusters {
            cluster.validate()?;
        }
        Ok(file)
    }
}
