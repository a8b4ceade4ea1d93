//! UDP heartbeat receiver.
//!
//! Every datagram carries one [`HeartbeatMessage`]. Heartbeats for a
//! registered cluster are appended to its metrics window. A heartbeat
//! for an unknown name triggers recovery: the provisioner is asked to
//! rebuild a handle for it, persisted running jobs are reattached, and the
//! cluster is registered with the recovery autoscaler binding and a job
//! monitor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use batchgrid_autoscale::{AutoscalerConfig, Predictor};
use batchgrid_cluster::ClusterProvisioner;
use batchgrid_pool::{JobMonitor, Pool};
use batchgrid_state::{MetricsSnapshot, StateStore};

use crate::error::{HeartbeatError, HeartbeatResult};
use crate::message::HeartbeatMessage;

/// Largest datagram accepted.
pub const MAX_DATAGRAM: usize = 4096;

/// What happened to one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Appended to a registered cluster.
    Appended,
    /// The cluster was unknown and has been recovered.
    Recovered,
    /// Neither registered nor known to the platform.
    Ignored,
}

pub struct HeartbeatReceiver {
    socket: UdpSocket,
    pool: Arc<Pool>,
    provisioner: Arc<dyn ClusterProvisioner>,
    store: StateStore,
    predictor: Option<Arc<dyn Predictor>>,
    recovery: AutoscalerConfig,
    monitor_interval: Duration,
}

impl HeartbeatReceiver {
    pub async fn bind(
        addr: SocketAddr,
        pool: Arc<Pool>,
        provisioner: Arc<dyn ClusterProvisioner>,
        store: StateStore,
    ) -> HeartbeatResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| HeartbeatError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_socket(socket, pool, provisioner, store))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(
        socket: UdpSocket,
        pool: Arc<Pool>,
        provisioner: Arc<dyn ClusterProvisioner>,
        store: StateStore,
    ) -> Self {
        Self {
            socket,
            pool,
            provisioner,
            store,
            predictor: None,
            recovery: AutoscalerConfig::recovery(),
            monitor_interval: Duration::from_secs(10),
        }
    }

    /// Autoscaler binding for recovered clusters.
    pub fn with_recovery(mut self, recovery: AutoscalerConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn local_addr(&self) -> HeartbeatResult<SocketAddr> {
        self.socket.local_addr().map_err(|e| HeartbeatError::Bind {
            addr: "<bound socket>".into(),
            reason: e.to_string(),
        })
    }

    /// Receive until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.socket.local_addr().ok(), "heartbeat receiver started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if let Err(e) = self.ingest(&buf[..len]).await {
                            warn!(%peer, error = %e, "heartbeat dropped");
                        }
                    }
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!(error = %e, "heartbeat receive failed");
                    }
                },
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!("heartbeat receiver stopped");
    }

    /// Process one datagram.
    pub async fn ingest(&self, bytes: &[u8]) -> HeartbeatResult<Ingest> {
        let message = HeartbeatMessage::decode(bytes)?;
        let name = message.cluster_name.clone();

        if let Some(cluster) = self.pool.get_cluster(&name).await {
            cluster.add_metrics_snapshot(message.into_snapshot_now()).await;
            debug!(cluster = %name, "heartbeat appended");
            return Ok(Ingest::Appended);
        }

        let platform = message.platform()?;
        self.recover(&name, platform, message.into_snapshot_now())
            .await
    }

    async fn recover(
        &self,
        name: &str,
        platform: batchgrid_state::Platform,
        snapshot: MetricsSnapshot,
    ) -> HeartbeatResult<Ingest> {
        let Some(handle) = self.provisioner.recover(name, platform).await? else {
            debug!(cluster = %name, %platform, "heartbeat from unknown cluster ignored");
            return Ok(Ingest::Ignored);
        };
        let cluster = Arc::new(handle);

        let running = self.store.running_jobs(name)?;
        let reattached = running.len();
        for job in running {
            cluster.attach_job(job).await;
        }

        let autoscaler = self
            .recovery
            .build(Arc::clone(&cluster), self.predictor.clone())?;
        self.pool.add_cluster(Arc::clone(&cluster), autoscaler.spawn()).await;
        cluster.add_metrics_snapshot(snapshot).await;

        let monitor = JobMonitor::new(Arc::clone(&cluster), Arc::clone(&self.pool), self.store.clone())
            .with_interval(self.monitor_interval)
            .spawn();
        self.pool.attach_monitor(name, monitor).await;

        if let Err(e) = self.store.put_cluster(&cluster.record().await) {
            warn!(cluster = %name, error = %e, "failed to persist recovered cluster");
        }
        info!(
            cluster = %name,
            %platform,
            reattached,
            policy = self.recovery.policy.kind(),
            "cluster recovered from heartbeat"
        );
        Ok(Ingest::Recovered)
    }
}
