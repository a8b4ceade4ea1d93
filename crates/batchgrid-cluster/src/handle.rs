//! ClusterHandle — the in-memory face of one running cluster.
//!
//! Owns the cluster's metrics window and job list and wraps its platform
//! driver. Shared as `Arc<ClusterHandle>` between the registry, the
//! autoscaler, and the job monitor; all mutable state sits behind atomics
//! or the windows' own locks.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::{debug, info};

use batchgrid_state::{
    ClusterRecord, ClusterStatus, Job, JobList, JobStatus, MetricsSnapshot, MetricsWindow,
    Platform, epoch_secs,
};

use crate::driver::{ClusterDriver, ClusterSpec, JobProgress};
use crate::error::{ClusterError, ClusterResult};

pub struct ClusterHandle {
    name: String,
    platform: Platform,
    spec: ClusterSpec,
    created_at: u64,
    closed: AtomicBool,
    node_count: AtomicI32,
    metrics: MetricsWindow,
    jobs: JobList,
    driver: Box<dyn ClusterDriver>,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("status", &self.status())
            .field("node_count", &self.node_count())
            .finish_non_exhaustive()
    }
}

impl ClusterHandle {
    pub fn new(
        name: impl Into<String>,
        platform: Platform,
        spec: ClusterSpec,
        driver: Box<dyn ClusterDriver>,
    ) -> Self {
        let metrics = MetricsWindow::bounded(spec.window_capacity);
        Self {
            name: name.into(),
            platform,
            node_count: AtomicI32::new(
                spec.workers + spec.elastic_nodes.max(spec.min_elastic_nodes),
            ),
            spec,
            created_at: epoch_secs(),
            closed: AtomicBool::new(false),
            metrics,
            jobs: JobList::unbounded(),
            driver,
        }
    }

    /// Override the creation timestamp (used when rebuilding from storage).
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn high_performance(&self) -> bool {
        self.spec.high_performance
    }

    pub fn status(&self) -> ClusterStatus {
        if self.closed.load(Ordering::Acquire) {
            ClusterStatus::Closed
        } else {
            ClusterStatus::Running
        }
    }

    pub fn node_count(&self) -> i32 {
        self.node_count.load(Ordering::Acquire)
    }

    pub fn metrics_window(&self) -> &MetricsWindow {
        &self.metrics
    }

    pub fn jobs(&self) -> &JobList {
        &self.jobs
    }

    /// Append a telemetry snapshot. The reported node count wins over the
    /// locally tracked one.
    pub async fn add_metrics_snapshot(&self, snapshot: MetricsSnapshot) {
        if snapshot.number_of_nodes > 0 {
            self.node_count
                .store(snapshot.number_of_nodes, Ordering::Release);
        }
        self.metrics.append(snapshot).await;
    }

    /// Timestamp of the newest snapshot, if any heartbeat arrived yet.
    pub async fn last_heartbeat(&self) -> Option<u64> {
        self.metrics.latest().await.map(|snap| snap.timestamp)
    }

    /// Number of jobs currently attached to the cluster.
    pub async fn allocated_job_slots(&self) -> usize {
        self.jobs.len().await
    }

    pub async fn allocate_resources(&self) -> ClusterResult<()> {
        self.driver.allocate_resources(&self.spec).await?;
        info!(cluster = %self.name, platform = %self.platform, "resources allocated");
        Ok(())
    }

    /// Release the platform resources and mark the cluster closed.
    pub async fn free_resources(&self) -> ClusterResult<()> {
        self.driver.free_resources().await?;
        self.closed.store(true, Ordering::Release);
        info!(cluster = %self.name, "resources freed");
        Ok(())
    }

    /// Mark the cluster closed without touching the platform, for clusters
    /// that stopped reporting. Returns false if it was already closed.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Submit `job` and attach it to this cluster's job list. On success
    /// the job is updated in place: running, bound to this cluster, with
    /// the platform identifier set.
    pub async fn submit_job(&self, job: &mut Job) -> ClusterResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed(self.name.clone()));
        }
        let platform_id = self.driver.submit_job(job).await?;
        job.platform_job_id = Some(platform_id);
        job.cluster = Some(self.name.clone());
        job.status = JobStatus::Running;
        job.updated_at = epoch_secs();
        self.jobs.append(job.clone()).await;
        debug!(cluster = %self.name, job = job.id, "job submitted");
        Ok(())
    }

    /// Attach an already running job without resubmitting it.
    pub async fn attach_job(&self, job: Job) {
        self.jobs.append(job).await;
    }

    pub async fn job_status(&self, job: &Job) -> ClusterResult<JobProgress> {
        self.driver.job_status(job).await
    }

    /// Scale elastic capacity by `delta` nodes.
    pub async fn scale(&self, delta: i32) -> ClusterResult<bool> {
        let exhausted = self.driver.scale(delta).await?;
        let floor = self.spec.workers + self.spec.min_elastic_nodes;
        let _ = self
            .node_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some((n + delta).max(floor))
            });
        info!(cluster = %self.name, delta, nodes = self.node_count(), "cluster scaled");
        Ok(exhausted)
    }

    /// Persistable view of the cluster.
    pub async fn record(&self) -> ClusterRecord {
        ClusterRecord {
            name: self.name.clone(),
            platform: self.platform,
            status: self.status(),
            created_at: self.created_at,
            updated_at: epoch_secs(),
            node_count: self.node_count(),
            assigned_jobs: self.allocated_job_slots().await as u32,
            high_performance: self.spec.high_performance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverFuture;
    use std::sync::{Arc, Mutex};

    /// Driver that records calls and never fails unless told to.
    #[derive(Default)]
    struct RecordingDriver {
        calls: Arc<Mutex<Vec<String>>>,
        fail_submit: bool,
    }

    impl ClusterDriver for RecordingDriver {
        fn allocate_resources<'a>(&'a self, _spec: &'a ClusterSpec) -> DriverFuture<'a, ()> {
            self.calls.lock().unwrap().push("allocate".into());
            Box::pin(async { Ok(()) })
        }

        fn free_resources(&self) -> DriverFuture<'_, ()> {
            self.calls.lock().unwrap().push("free".into());
            Box::pin(async { Ok(()) })
        }

        fn submit_job<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, String> {
            self.calls.lock().unwrap().push(format!("submit:{}", job.id));
            let fail = self.fail_submit;
            Box::pin(async move {
                if fail {
                    Err(ClusterError::Submit {
                        cluster: "test".into(),
                        job: job.id,
                        reason: "rejected".into(),
                    })
                } else {
                    Ok(format!("platform-{}", job.id))
                }
            })
        }

        fn scale(&self, delta: i32) -> DriverFuture<'_, bool> {
            self.calls.lock().unwrap().push(format!("scale:{delta}"));
            Box::pin(async { Ok(false) })
        }

        fn job_status<'a>(&'a self, _job: &'a Job) -> DriverFuture<'a, JobProgress> {
            Box::pin(async { Ok(JobProgress::Running) })
        }
    }

    fn handle(driver: RecordingDriver) -> ClusterHandle {
        ClusterHandle::new("c1", Platform::Local, ClusterSpec::default(), Box::new(driver))
    }

    #[tokio::test]
    async fn submit_binds_job_to_cluster() {
        let cluster = handle(RecordingDriver::default());
        let mut job = Job::new(3, "gs://jobs/a.py", 0);

        cluster.submit_job(&mut job).await.unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.cluster.as_deref(), Some("c1"));
        assert_eq!(job.platform_job_id.as_deref(), Some("platform-3"));
        assert_eq!(cluster.allocated_job_slots().await, 1);
    }

    #[tokio::test]
    async fn failed_submit_leaves_job_untouched() {
        let cluster = handle(RecordingDriver {
            fail_submit: true,
            ..Default::default()
        });
        let mut job = Job::new(3, "gs://jobs/a.py", 0);

        assert!(cluster.submit_job(&mut job).await.is_err());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(cluster.allocated_job_slots().await, 0);
    }

    #[tokio::test]
    async fn snapshots_update_node_count_and_heartbeat() {
        let cluster = handle(RecordingDriver::default());
        assert_eq!(cluster.node_count(), 2);
        assert!(cluster.last_heartbeat().await.is_none());

        cluster
            .add_metrics_snapshot(MetricsSnapshot {
                timestamp: 100,
                number_of_nodes: 5,
                ..Default::default()
            })
            .await;

        assert_eq!(cluster.node_count(), 5);
        assert_eq!(cluster.last_heartbeat().await, Some(100));
    }

    #[tokio::test]
    async fn scale_never_drops_below_floor() {
        let driver = RecordingDriver::default();
        let calls = Arc::clone(&driver.calls);
        let cluster = handle(driver);

        cluster.scale(4).await.unwrap();
        assert_eq!(cluster.node_count(), 6);
        cluster.scale(-10).await.unwrap();
        assert_eq!(cluster.node_count(), 2);
        assert_eq!(*calls.lock().unwrap(), vec!["scale:4", "scale:-10"]);
    }

    #[tokio::test]
    async fn free_closes_cluster_and_rejects_jobs() {
        let cluster = handle(RecordingDriver::default());
        cluster.free_resources().await.unwrap();
        assert_eq!(cluster.status(), ClusterStatus::Closed);

        let mut job = Job::new(1, "gs://jobs/a.py", 0);
        assert!(matches!(
            cluster.submit_job(&mut job).await,
            Err(ClusterError::Closed(_))
        ));
        assert_eq!(cluster.record().await.status, ClusterStatus::Closed);
    }

    #[tokio::test]
    async fn mark_closed_skips_the_driver() {
        let driver = RecordingDriver::default();
        let calls = Arc::clone(&driver.calls);
        let cluster = handle(driver);

        assert!(cluster.mark_closed());
        assert!(!cluster.mark_closed());
        assert_eq!(cluster.status(), ClusterStatus::Closed);
        assert!(calls.lock().unwrap().is_empty());
    }
}
