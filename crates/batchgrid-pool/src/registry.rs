//! Pool — the registry of live clusters.
//!
//! Maps cluster names to their handle plus the loops bound to it (the
//! autoscaler and, once started, the job monitor). The registry lock only
//! guards the map; no driver or persistence call is made while it is held.
//! Evicted clusters are marked closed and, when a store is attached, their
//! closed record is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use batchgrid_autoscale::AutoscalerHandle;
use batchgrid_cluster::ClusterHandle;
use batchgrid_state::{StateStore, epoch_secs};

use crate::monitor::MonitorHandle;

struct Entry {
    cluster: Arc<ClusterHandle>,
    autoscaler: AutoscalerHandle,
    monitor: Option<MonitorHandle>,
}

impl Entry {
    fn stop(&self) {
        self.autoscaler.stop();
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
    }
}

#[derive(Default)]
pub struct Pool {
    clusters: RwLock<HashMap<String, Entry>>,
    store: Option<StateStore>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the closed record of every evicted cluster to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Register `cluster` with its autoscaler. An existing entry of the
    /// same name is replaced and its loops are stopped.
    pub async fn add_cluster(&self, cluster: Arc<ClusterHandle>, autoscaler: AutoscalerHandle) {
        let name = cluster.name().to_string();
        let previous = {
            let mut clusters = self.clusters.write().await;
            clusters.insert(
                name.clone(),
                Entry {
                    cluster,
                    autoscaler,
                    monitor: None,
                },
            )
        };
        if let Some(previous) = previous {
            previous.stop();
            info!(cluster = %name, "cluster re-registered, previous binding stopped");
        } else {
            info!(cluster = %name, "cluster registered");
        }
    }

    /// Bind a job monitor to a registered cluster. Returns false (and stops
    /// the monitor) when the cluster is no longer registered.
    pub async fn attach_monitor(&self, name: &str, monitor: MonitorHandle) -> bool {
        let mut clusters = self.clusters.write().await;
        match clusters.get_mut(name) {
            Some(entry) => {
                if let Some(old) = entry.monitor.replace(monitor) {
                    old.stop();
                }
                true
            }
            None => {
                monitor.stop();
                false
            }
        }
    }

    /// Stop the cluster's loops and forget it. Returns whether it existed.
    pub async fn remove_cluster(&self, name: &str) -> bool {
        let removed = self.clusters.write().await.remove(name);
        match removed {
            Some(entry) => {
                entry.stop();
                info!(cluster = %name, "cluster removed");
                true
            }
            None => false,
        }
    }

    /// Remove `cluster` only if it is still the registered handle for its
    /// name. Returns whether it was removed.
    pub async fn remove_handle(&self, cluster: &Arc<ClusterHandle>) -> bool {
        let name = cluster.name();
        let removed = {
            let mut clusters = self.clusters.write().await;
            match clusters.get(name) {
                Some(entry) if Arc::ptr_eq(&entry.cluster, cluster) => clusters.remove(name),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.stop();
                info!(cluster = %name, "cluster removed");
                true
            }
            None => false,
        }
    }

    pub async fn get_cluster(&self, name: &str) -> Option<Arc<ClusterHandle>> {
        self.clusters
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.cluster))
    }

    pub async fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.clusters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clusters.read().await.is_empty()
    }

    /// Stop every bound loop. Entries stay registered.
    pub async fn stop_all(&self) -> usize {
        let clusters = self.clusters.read().await;
        for entry in clusters.values() {
            entry.stop();
        }
        clusters.len()
    }

    pub async fn liveliness_check(&self, timeout: Duration) -> Vec<String> {
        self.liveliness_check_at(timeout, epoch_secs()).await
    }

    /// Evict every cluster whose newest heartbeat is older than `timeout`
    /// at time `now`. Clusters that never reported are kept. Returns the
    /// evicted names.
    pub async fn liveliness_check_at(&self, timeout: Duration, now: u64) -> Vec<String> {
        let limit = timeout.as_secs();
        let candidates: Vec<(String, Arc<ClusterHandle>)> = {
            let clusters = self.clusters.read().await;
            clusters
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.cluster)))
                .collect()
        };

        let mut stale = Vec::new();
        for (name, cluster) in candidates {
            if is_stale(cluster.last_heartbeat().await, now, limit) {
                stale.push((name, cluster));
            }
        }
        if stale.is_empty() {
            return Vec::new();
        }

        let mut evicted = Vec::new();
        let mut stopped = Vec::new();
        {
            let mut clusters = self.clusters.write().await;
            for (name, inspected) in stale {
                let Some(entry) = clusters.get(&name) else {
                    continue;
                };
                // Replaced since inspection, or a heartbeat slipped in.
                if !Arc::ptr_eq(&entry.cluster, &inspected) {
                    continue;
                }
                if !is_stale(inspected.last_heartbeat().await, now, limit) {
                    continue;
                }
                if let Some(entry) = clusters.remove(&name) {
                    stopped.push(entry);
                    evicted.push(name);
                }
            }
        }

        for (entry, name) in stopped.iter().zip(&evicted) {
            entry.stop();
            entry.cluster.mark_closed();
            warn!(cluster = %name, timeout_secs = limit, "cluster evicted, heartbeats stale");
            if let Some(store) = &self.store {
                if let Err(e) = store.put_cluster(&entry.cluster.record().await) {
                    warn!(cluster = %name, error = %e, "failed to persist evicted cluster");
                }
            }
        }
        evicted
    }

    /// Run liveliness checks every `interval` until `shutdown` fires.
    pub async fn run_liveliness(
        &self,
        interval: Duration,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "liveliness loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.liveliness_check(timeout).await;
                    debug!(evicted = evicted.len(), "liveliness check done");
                }
                _ = shutdown.changed() => {
                    info!("liveliness loop shutting down");
                    break;
                }
            }
        }
    }
}

fn is_stale(last: Option<u64>, now: u64, limit: u64) -> bool {
    last.is_some_and(|last| now.saturating_sub(last) > limit)
}
