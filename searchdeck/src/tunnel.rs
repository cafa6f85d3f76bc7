//! SSH tunnel lifecycle management
//!
//! Each SSH-enabled cluster gets at most one tunnel: an SSH session to the
//! jump host plus a loopback TCP listener whose accepted connections are
//! forwarded to the cluster as direct-tcpip channels.
//!
//! ```text
//! Tunnel states: Connecting → Ready → Degraded → Closed
//!
//! Transitions:
//!   connecting → ready: session authenticated, listener bound
//!   ready → degraded: session dropped or a forward channel failed
//!   degraded → ready: single reconnect inside ensure()
//!   any → closed: invalidate() or idle reap
//! ```
//!
//! Concurrent `ensure` calls for one cluster collapse into a single
//! establish attempt; every caller observes that attempt's outcome.

use crate::config::{ClusterConfig, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::metrics;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use russh::client;
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl TunnelState {
    /// Get state as a string for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Ready => "ready",
            TunnelState::Degraded => "degraded",
            TunnelState::Closed => "closed",
        }
    }
}

/// SSH client event handler for tunnel sessions
///
/// Jump hosts come from operator-supplied cluster records; host keys are
/// accepted as presented.
struct TunnelSshHandler;

impl client::Handler for TunnelSshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One active local-to-remote forward
///
/// Owned exclusively by the [`TunnelManager`]; request-handling code only
/// ever sees the effective endpoint string.
pub struct TunnelHandle {
    cluster_id: String,
    local_port: u16,
    state: Arc<RwLock<TunnelState>>,
    borrowers: AtomicUsize,
    last_used: RwLock<Instant>,
    session: Arc<client::Handle<TunnelSshHandler>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TunnelHandle {
    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The URL a search client connects to through this tunnel
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    pub fn borrowers(&self) -> usize {
        self.borrowers.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.read().elapsed()
    }

    /// Tear down the listener and SSH session; idempotent
    fn close(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if *state == TunnelState::Closed {
                return;
            }
            *state = TunnelState::Closed;
        }
        self.accept_task.abort();

        let session = Arc::clone(&self.session);
        let cluster_id = self.cluster_id.clone();
        tokio::spawn(async move {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
                .await;
            debug!("SSH session for {} disconnected", cluster_id);
        });

        metrics::record_tunnel_closed(&self.cluster_id, reason);
    }
}

type EnsureFuture = Shared<BoxFuture<'static, Result<Arc<TunnelHandle>>>>;

enum TunnelSlot {
    /// Establish attempt in flight; late callers await the same future
    Pending(EnsureFuture),
    Ready(Arc<TunnelHandle>),
}

/// Owns every tunnel, keyed by cluster id
pub struct TunnelManager {
    config: GatewayConfig,
    tunnels: Mutex<HashMap<String, TunnelSlot>>,
}

impl TunnelManager {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Get the effective endpoint for an SSH-enabled cluster, establishing
    /// the tunnel if none is live
    ///
    /// Idempotent: a Ready handle is reused, a Degraded or Closed handle
    /// gets exactly one reconnect attempt, and concurrent calls share one
    /// underlying SSH connection attempt. The borrower count is
    /// incremented on success; pair with [`release`](Self::release).
    pub async fn ensure(&self, config: &ClusterConfig) -> Result<String> {
        config.validate()?;
        if !config.ssh_enabled {
            return Err(GatewayError::Configuration(format!(
                "cluster {} does not use SSH",
                config.id
            )));
        }

        // Fast path and reconnect decision under one short lock.
        enum Found {
            Wait(EnsureFuture),
            Dead(Arc<TunnelHandle>),
            Miss,
        }

        let found = {
            let mut tunnels = self.tunnels.lock();
            let found = match tunnels.get(&config.id) {
                Some(TunnelSlot::Ready(handle)) if handle.state() == TunnelState::Ready => {
                    handle.borrowers.fetch_add(1, Ordering::SeqCst);
                    handle.touch();
                    return Ok(handle.endpoint());
                }
                Some(TunnelSlot::Ready(handle)) => Found::Dead(Arc::clone(handle)),
                Some(TunnelSlot::Pending(fut)) => Found::Wait(fut.clone()),
                None => Found::Miss,
            };
            if let Found::Dead(_) = &found {
                tunnels.remove(&config.id);
            }
            found
        };

        let pending = match found {
            Found::Wait(fut) => Some(fut),
            Found::Dead(dead) => {
                warn!(
                    "Tunnel for {} is {}, attempting reconnect",
                    config.id,
                    dead.state().as_str()
                );
                dead.close("reconnect");
                None
            }
            Found::Miss => None,
        };

        if let Some(fut) = pending {
            let handle = fut.await?;
            handle.borrowers.fetch_add(1, Ordering::SeqCst);
            handle.touch();
            return Ok(handle.endpoint());
        }

        // No live tunnel: start one establish attempt shared with any
        // caller that arrives while it runs.
        let fut = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get(&config.id) {
                Some(TunnelSlot::Pending(fut)) => fut.clone(),
                Some(TunnelSlot::Ready(handle)) if handle.state() == TunnelState::Ready => {
                    handle.borrowers.fetch_add(1, Ordering::SeqCst);
                    handle.touch();
                    return Ok(handle.endpoint());
                }
                _ => {
                    let fut: EnsureFuture =
                        establish(config.clone(), self.config.clone()).boxed().shared();
                    tunnels.insert(config.id.clone(), TunnelSlot::Pending(fut.clone()));
                    fut
                }
            }
        };

        let result = fut.await;

        {
            let mut tunnels = self.tunnels.lock();
            if let Some(TunnelSlot::Pending(_)) = tunnels.get(&config.id) {
                match &result {
                    Ok(handle) => {
                        tunnels.insert(config.id.clone(), TunnelSlot::Ready(Arc::clone(handle)));
                    }
                    Err(_) => {
                        tunnels.remove(&config.id);
                    }
                }
            }
        }
        self.record_gauge();

        let handle = result?;
        handle.borrowers.fetch_add(1, Ordering::SeqCst);
        handle.touch();
        Ok(handle.endpoint())
    }

    /// Return a borrow taken by [`ensure`](Self::ensure)
    ///
    /// A tunnel whose borrower count reaches zero stays up for the idle
    /// grace period before the maintenance sweep reaps it.
    pub fn release(&self, cluster_id: &str) {
        let tunnels = self.tunnels.lock();
        if let Some(TunnelSlot::Ready(handle)) = tunnels.get(cluster_id) {
            let _ = handle
                .borrowers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(1))
                });
            handle.touch();
            debug!(
                "Released tunnel borrow for {} ({} remaining)",
                cluster_id,
                handle.borrowers()
            );
        }
    }

    /// Forcibly close the tunnel for a cluster
    ///
    /// Called on configuration changes and explicit disconnects.
    pub fn invalidate(&self, cluster_id: &str) {
        let slot = self.tunnels.lock().remove(cluster_id);
        match slot {
            Some(TunnelSlot::Ready(handle)) => {
                info!("Invalidating tunnel for {}", cluster_id);
                handle.close("invalidated");
            }
            Some(TunnelSlot::Pending(_)) => {
                debug!("Dropped in-flight tunnel attempt for {}", cluster_id);
            }
            None => {}
        }
        self.record_gauge();
    }

    /// Look up the live handle for a cluster
    pub fn get(&self, cluster_id: &str) -> Option<Arc<TunnelHandle>> {
        match self.tunnels.lock().get(cluster_id) {
            Some(TunnelSlot::Ready(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Start the maintenance loop: degrade tunnels whose session died and
    /// reap tunnels idle past the grace period with no borrowers
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_loop().await;
        })
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.tunnel_sweep_interval());
        info!(
            "Tunnel maintenance started ({}ms sweep, {}ms idle grace)",
            self.config.tunnel_sweep_interval_ms, self.config.tunnel_idle_grace_ms
        );
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    fn sweep(&self) {
        let grace = self.config.tunnel_idle_grace();
        let mut reaped = Vec::new();
        {
            let mut tunnels = self.tunnels.lock();
            tunnels.retain(|cluster_id, slot| match slot {
                TunnelSlot::Ready(handle) => {
                    if handle.state() == TunnelState::Ready && handle.session.is_closed() {
                        warn!(
                            "SSH session for {} dropped, marking tunnel degraded",
                            cluster_id
                        );
                        *handle.state.write() = TunnelState::Degraded;
                    }
                    let reap = handle.state() == TunnelState::Closed
                        || (handle.borrowers() == 0 && handle.idle_for() >= grace);
                    if reap {
                        reaped.push(Arc::clone(handle));
                    }
                    !reap
                }
                TunnelSlot::Pending(_) => true,
            });
        }
        for handle in reaped {
            info!("Reaping idle tunnel for {}", handle.cluster_id);
            handle.close("idle");
        }
        self.record_gauge();
    }

    fn record_gauge(&self) {
        let count = self
            .tunnels
            .lock()
            .values()
            .filter(|slot| matches!(slot, TunnelSlot::Ready(h) if h.state() == TunnelState::Ready))
            .count();
        metrics::record_active_tunnels(count);
    }
}

/// Open the SSH session, authenticate, bind the loopback listener and
/// start the forward loop
async fn establish(config: ClusterConfig, gateway: GatewayConfig) -> Result<Arc<TunnelHandle>> {
    // validate() ran before the slot was created
    let ssh_host = config.ssh_host.clone().unwrap_or_default();
    let ssh_user = config.ssh_user.clone().unwrap_or_default();
    let addr = format!("{}:{}", ssh_host, config.ssh_port);

    info!("Establishing SSH tunnel for {} via {}", config.id, addr);

    let ssh_config = Arc::new(client::Config {
        keepalive_interval: Some(gateway.ssh_keepalive_interval()),
        ..Default::default()
    });

    let mut session = tokio::time::timeout(
        gateway.ssh_connect_timeout(),
        client::connect(
            ssh_config,
            (ssh_host.as_str(), config.ssh_port),
            TunnelSshHandler,
        ),
    )
    .await
    .map_err(|_| {
        metrics::record_tunnel_failed(&config.id, "timeout");
        GatewayError::Timeout(format!("SSH connection to {} timed out", addr))
    })?
    .map_err(|e| {
        metrics::record_tunnel_failed(&config.id, "connect");
        GatewayError::Connectivity(format!("Failed to reach SSH host {}: {}", addr, e))
    })?;

    let authenticated = if let Some(password) = &config.ssh_password {
        session
            .authenticate_password(&ssh_user, password)
            .await
            .map_err(|e| auth_error(&config.id, &ssh_user, &addr, e))?
            .success()
    } else if let Some(key_file) = &config.ssh_key_file {
        let key = load_secret_key(key_file, None).map_err(|e| {
            metrics::record_tunnel_failed(&config.id, "key");
            GatewayError::Configuration(format!(
                "Failed to load SSH key {}: {}",
                key_file.display(),
                e
            ))
        })?;
        let rsa_hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| auth_error(&config.id, &ssh_user, &addr, e))?
            .flatten();
        session
            .authenticate_publickey(
                &ssh_user,
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await
            .map_err(|e| auth_error(&config.id, &ssh_user, &addr, e))?
            .success()
    } else {
        false
    };

    if !authenticated {
        metrics::record_tunnel_failed(&config.id, "auth");
        return Err(GatewayError::Tunnel(format!(
            "SSH authentication failed for {}@{}",
            ssh_user, addr
        )));
    }

    let listener = TcpListener::bind(("127.0.0.1", config.local_port))
        .await
        .map_err(|e| {
            metrics::record_tunnel_failed(&config.id, "bind");
            GatewayError::Tunnel(format!(
                "Failed to bind local port {}: {}",
                config.local_port, e
            ))
        })?;
    let local_port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(config.local_port);

    let session = Arc::new(session);
    let state = Arc::new(RwLock::new(TunnelState::Ready));
    let accept_task = tokio::spawn(forward_loop(
        listener,
        Arc::clone(&session),
        Arc::clone(&state),
        config.clone(),
    ));

    info!(
        "SSH tunnel for {} ready on 127.0.0.1:{} -> {}:{}",
        config.id, local_port, config.remote_host, config.remote_port
    );
    metrics::record_tunnel_established(&config.id);

    Ok(Arc::new(TunnelHandle {
        cluster_id: config.id,
        local_port,
        state,
        borrowers: AtomicUsize::new(0),
        last_used: RwLock::new(Instant::now()),
        session,
        accept_task,
    }))
}

fn auth_error(cluster_id: &str, ssh_user: &str, addr: &str, err: russh::Error) -> GatewayError {
    metrics::record_tunnel_failed(cluster_id, "auth");
    GatewayError::Tunnel(format!(
        "SSH authentication failed for {}@{}: {}",
        ssh_user, addr, err
    ))
}

/// Accept loopback connections and bridge each one over a direct-tcpip
/// channel to the remote host
async fn forward_loop(
    listener: TcpListener,
    session: Arc<client::Handle<TunnelSshHandler>>,
    state: Arc<RwLock<TunnelState>>,
    config: ClusterConfig,
) {
    loop {
        let (mut local, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Tunnel listener for {} failed to accept: {}", config.id, e);
                let mut state = state.write();
                if *state == TunnelState::Ready {
                    *state = TunnelState::Degraded;
                }
                return;
            }
        };

        let session = Arc::clone(&session);
        let state = Arc::clone(&state);
        let remote_host = config.remote_host.clone();
        let remote_port = config.remote_port;
        let cluster_id = config.id.clone();
        tokio::spawn(async move {
            match session
                .channel_open_direct_tcpip(
                    remote_host.as_str(),
                    remote_port as u32,
                    "127.0.0.1",
                    peer.port() as u32,
                )
                .await
            {
                Ok(channel) => {
                    let mut remote = channel.into_stream();
                    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                        debug!("Forwarded connection for {} ended: {}", cluster_id, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to open forward channel for {}: {}", cluster_id, e);
                    let mut state = state.write();
                    if *state == TunnelState::Ready {
                        *state = TunnelState::Degraded;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_cluster(id: &str) -> ClusterConfig {
        ClusterConfig {
            id: id.to_string(),
            name: None,
            url: String::new(),
            username: None,
            password: None,
            ssh_enabled: true,
            // Nothing listens on port 1; connect is refused immediately
            ssh_host: Some("127.0.0.1".into()),
            ssh_port: 1,
            ssh_user: Some("ops".into()),
            ssh_password: Some("secret".into()),
            ssh_key_file: None,
            local_port: 0,
            remote_host: "localhost".into(),
            remote_port: 9200,
        }
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(TunnelState::Connecting.as_str(), "connecting");
        assert_eq!(TunnelState::Ready.as_str(), "ready");
        assert_eq!(TunnelState::Degraded.as_str(), "degraded");
        assert_eq!(TunnelState::Closed.as_str(), "closed");
    }

    #[tokio::test]
    async fn test_ensure_rejects_non_ssh_cluster() {
        let manager = TunnelManager::new(GatewayConfig::default());
        let mut cluster = ssh_cluster("c1");
        cluster.ssh_enabled = false;
        cluster.url = "http://es:9200".into();
        assert!(matches!(
            manager.ensure(&cluster).await,
            Err(GatewayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_rejects_incomplete_ssh_config() {
        let manager = TunnelManager::new(GatewayConfig::default());
        let mut cluster = ssh_cluster("c1");
        cluster.ssh_user = None;
        assert!(matches!(
            manager.ensure(&cluster).await,
            Err(GatewayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_establish_caches_nothing() {
        let manager = TunnelManager::new(GatewayConfig::default());
        let cluster = ssh_cluster("c1");

        let err = manager.ensure(&cluster).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Connectivity(_) | GatewayError::Timeout(_)
        ));
        assert!(manager.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_attempt() {
        let manager = Arc::new(TunnelManager::new(GatewayConfig::default()));
        let cluster = ssh_cluster("c1");

        let (a, b) = tokio::join!(manager.ensure(&cluster), manager.ensure(&cluster));
        assert!(a.is_err());
        assert!(b.is_err());
        assert!(manager.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_unknown_cluster_is_noop() {
        let manager = TunnelManager::new(GatewayConfig::default());
        manager.invalidate("nope");
        manager.release("nope");
    }
}
