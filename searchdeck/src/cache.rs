//! Client cache keyed by cluster id
//!
//! A pure memoization layer over the collaborator's cluster records: at
//! most one entry per cluster, at most one initialization in flight, and
//! nothing cached when initialization fails. The cache is never
//! authoritative over cluster existence; stale entries are invalidated
//! before a lookup is satisfied.

use crate::client::SearchClient;
use crate::config::{ClusterConfig, GatewayConfig};
use crate::error::Result;
use crate::metrics;
use crate::tunnel::TunnelManager;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Cache record for one cluster's live client
pub struct ClientEntry {
    pub cluster_id: String,
    pub effective_endpoint: String,
    pub client: Arc<SearchClient>,
    fingerprint: u64,
    ssh_enabled: bool,
    pub created_at: Instant,
    last_used: RwLock<Instant>,
}

impl ClientEntry {
    pub fn last_used(&self) -> Instant {
        *self.last_used.read()
    }

    fn touch(&self) {
        *self.last_used.write() = Instant::now();
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<Arc<ClientEntry>>>>;

enum CacheSlot {
    /// Initialization in flight; concurrent callers await the same future
    Pending(InitFuture),
    Ready(Arc<ClientEntry>),
}

pub struct ClientCache {
    config: GatewayConfig,
    tunnels: Arc<TunnelManager>,
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl ClientCache {
    pub fn new(config: GatewayConfig, tunnels: Arc<TunnelManager>) -> Self {
        Self {
            config,
            tunnels,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Get the live client for a cluster, creating it if needed
    ///
    /// Concurrent first calls for one cluster collapse into a single
    /// initialization and every caller observes its outcome. A cached
    /// entry whose config fingerprint no longer matches is disposed of
    /// (tunnel included) before a fresh one is built.
    pub async fn get_instance(&self, config: &ClusterConfig) -> Result<Arc<SearchClient>> {
        config.validate()?;
        let fingerprint = config.fingerprint();

        loop {
            enum Lookup {
                Hit(Arc<SearchClient>),
                Wait(InitFuture),
                Stale(Arc<ClientEntry>),
                Miss,
            }

            let lookup = {
                let mut slots = self.slots.lock();
                let lookup = match slots.get(&config.id) {
                    Some(CacheSlot::Ready(entry)) if entry.fingerprint == fingerprint => {
                        entry.touch();
                        Lookup::Hit(Arc::clone(&entry.client))
                    }
                    Some(CacheSlot::Ready(entry)) => Lookup::Stale(Arc::clone(entry)),
                    Some(CacheSlot::Pending(fut)) => Lookup::Wait(fut.clone()),
                    None => Lookup::Miss,
                };
                if let Lookup::Stale(_) = &lookup {
                    info!(
                        "Configuration for {} changed, discarding cached client",
                        config.id
                    );
                    slots.remove(&config.id);
                }
                lookup
            };

            match lookup {
                Lookup::Hit(client) => return Ok(client),
                Lookup::Wait(fut) => {
                    let entry = fut.await?;
                    if entry.fingerprint == fingerprint {
                        entry.touch();
                        return Ok(Arc::clone(&entry.client));
                    }
                    // Raced with an initialization for an older config;
                    // go around and rebuild.
                    continue;
                }
                Lookup::Stale(entry) => {
                    self.dispose(&entry);
                    continue;
                }
                Lookup::Miss => {}
            }

            // Miss: start one initialization shared with any caller that
            // arrives while it runs.
            let fut = {
                let mut slots = self.slots.lock();
                match slots.get(&config.id) {
                    Some(CacheSlot::Pending(fut)) => fut.clone(),
                    Some(CacheSlot::Ready(entry)) if entry.fingerprint == fingerprint => {
                        entry.touch();
                        return Ok(Arc::clone(&entry.client));
                    }
                    _ => {
                        let fut: InitFuture = Self::initialize(
                            config.clone(),
                            self.config.clone(),
                            Arc::clone(&self.tunnels),
                        )
                        .boxed()
                        .shared();
                        slots.insert(config.id.clone(), CacheSlot::Pending(fut.clone()));
                        fut
                    }
                }
            };

            let result = fut.await;

            {
                let mut slots = self.slots.lock();
                if let Some(CacheSlot::Pending(_)) = slots.get(&config.id) {
                    match &result {
                        Ok(entry) => {
                            slots.insert(config.id.clone(), CacheSlot::Ready(Arc::clone(entry)));
                        }
                        Err(_) => {
                            slots.remove(&config.id);
                        }
                    }
                }
                metrics::record_client_cache_size(slots.len());
            }

            let entry = result?;
            if entry.fingerprint == fingerprint {
                entry.touch();
                return Ok(Arc::clone(&entry.client));
            }
        }
    }

    /// Build the entry: resolve the effective endpoint (establishing the
    /// tunnel for SSH-enabled clusters) and construct the client
    async fn initialize(
        config: ClusterConfig,
        gateway: GatewayConfig,
        tunnels: Arc<TunnelManager>,
    ) -> Result<Arc<ClientEntry>> {
        let effective_endpoint = if config.ssh_enabled {
            tunnels.ensure(&config).await?
        } else {
            config.url.trim_end_matches('/').to_string()
        };

        let client = match SearchClient::new(
            &effective_endpoint,
            config.username.clone(),
            config.password.clone(),
            &gateway,
        ) {
            Ok(client) => client,
            Err(e) => {
                // The tunnel stays up for the grace period so the next
                // attempt can reuse it.
                if config.ssh_enabled {
                    tunnels.release(&config.id);
                }
                return Err(e);
            }
        };

        info!(
            "Created search client for {} at {}",
            config.id, effective_endpoint
        );
        metrics::record_client_created(&config.id);

        let now = Instant::now();
        Ok(Arc::new(ClientEntry {
            cluster_id: config.id.clone(),
            effective_endpoint,
            client: Arc::new(client),
            fingerprint: config.fingerprint(),
            ssh_enabled: config.ssh_enabled,
            created_at: now,
            last_used: RwLock::new(now),
        }))
    }

    /// Drop the cached entry for a cluster, closing its tunnel
    pub fn invalidate(&self, cluster_id: &str) {
        let slot = self.slots.lock().remove(cluster_id);
        match slot {
            Some(CacheSlot::Ready(entry)) => {
                info!("Invalidating cached client for {}", cluster_id);
                self.dispose(&entry);
            }
            Some(CacheSlot::Pending(_)) => {
                debug!("Dropped in-flight client initialization for {}", cluster_id);
            }
            None => {}
        }
    }

    /// Evict entries for clusters the collaborator no longer knows
    pub fn retain(&self, known_ids: &[String]) {
        let mut dropped = Vec::new();
        {
            let mut slots = self.slots.lock();
            slots.retain(|cluster_id, slot| {
                let keep = known_ids.iter().any(|known| known == cluster_id);
                if !keep {
                    if let CacheSlot::Ready(entry) = slot {
                        dropped.push(Arc::clone(entry));
                    }
                }
                keep
            });
            metrics::record_client_cache_size(slots.len());
        }
        for entry in dropped {
            info!("Evicting client for removed cluster {}", entry.cluster_id);
            self.dispose(&entry);
        }
    }

    /// Look up the cache record for a cluster
    pub fn entry(&self, cluster_id: &str) -> Option<Arc<ClientEntry>> {
        match self.slots.lock().get(cluster_id) {
            Some(CacheSlot::Ready(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn dispose(&self, entry: &ClientEntry) {
        if entry.ssh_enabled {
            self.tunnels.release(&entry.cluster_id);
            self.tunnels.invalidate(&entry.cluster_id);
        }
    }
}
