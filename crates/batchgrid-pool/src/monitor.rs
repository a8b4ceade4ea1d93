//! Job completion tracking and teardown for one cluster.
//!
//! Each pass snapshots the cluster's job list, asks the platform for the
//! status of every live job, persists the ones that finished, tombstones
//! them, and compacts the list. Once the list is empty the cluster is
//! torn down: resources freed, record persisted as closed, entry removed
//! from the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use batchgrid_cluster::{ClusterError, ClusterHandle, JobProgress};
use batchgrid_state::{ClusterStatus, StateStore, epoch_secs};

use crate::error::PoolResult;
use crate::registry::Pool;

/// Outcome of one monitoring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorPass {
    pub finished: usize,
    pub remaining: usize,
}

pub struct JobMonitor {
    cluster: Arc<ClusterHandle>,
    pool: Arc<Pool>,
    store: StateStore,
    interval: Duration,
}

impl JobMonitor {
    pub fn new(cluster: Arc<ClusterHandle>, pool: Arc<Pool>, store: StateStore) -> Self {
        Self {
            cluster,
            pool,
            store,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll every live job once.
    pub async fn poll_once(&self) -> MonitorPass {
        let jobs = self.cluster.jobs();
        let view = jobs.snapshot().await;
        let mut finished = 0;

        for entry in view.live() {
            let progress = match self.cluster.job_status(&entry.value).await {
                Ok(progress) => progress,
                // The platform lost track of it; nothing will ever finish it.
                Err(ClusterError::UnknownJob { job }) => {
                    warn!(cluster = %self.cluster.name(), job, "job unknown to platform");
                    JobProgress::Failed
                }
                Err(e) => {
                    warn!(cluster = %self.cluster.name(), job = entry.value.id, error = %e, "job status query failed");
                    continue;
                }
            };
            if !progress.is_terminal() {
                continue;
            }

            let mut job = (*entry.value).clone();
            job.status = progress.as_status();
            job.updated_at = epoch_secs();
            if let Err(e) = self.store.put_job(&job) {
                // Left in the list; the next pass retries.
                warn!(cluster = %self.cluster.name(), job = job.id, error = %e, "failed to persist finished job");
                continue;
            }
            jobs.mark_for_removal(entry.seq).await;
            finished += 1;
            info!(cluster = %self.cluster.name(), job = job.id, status = ?job.status, "job finished");
        }

        let compacted = jobs.compact().await;
        let remaining = jobs.len().await;
        debug!(cluster = %self.cluster.name(), finished, compacted, remaining, "monitor pass");
        MonitorPass {
            finished,
            remaining,
        }
    }

    /// Free the cluster, persist it as closed, and drop it from the pool.
    /// A retry after a failed persist does not free the cluster twice, and
    /// a newer handle registered under the same name is left alone.
    pub async fn teardown(&self) -> PoolResult<()> {
        if self.cluster.status() != ClusterStatus::Closed {
            self.cluster.free_resources().await?;
        }
        self.store.put_cluster(&self.cluster.record().await)?;
        self.pool.remove_handle(&self.cluster).await;
        info!(cluster = %self.cluster.name(), "cluster torn down, all jobs finished");
        Ok(())
    }

    /// Start the monitoring loop on its own task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(cluster = %self.cluster.name(), "job monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if self.poll_once().await.remaining > 0 {
                        continue;
                    }
                    match self.teardown().await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(cluster = %self.cluster.name(), error = %e, "teardown failed, will retry");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        debug!(cluster = %self.cluster.name(), "job monitor stopped");
    }
}

/// Owner side of a running job monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
