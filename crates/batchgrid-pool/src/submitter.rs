//! Submitter — turns a batch of jobs into one new cluster.
//!
//! Deploying a batch creates a randomly named cluster, allocates it,
//! registers it with a freshly built autoscaler, submits every job,
//! persists jobs and cluster, and starts the cluster's job monitor.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use batchgrid_autoscale::{AutoscalerConfig, Predictor};
use batchgrid_cluster::{ClusterHandle, ClusterProvisioner, ClusterSpec};
use batchgrid_state::{Job, JobStatus, StateStore, epoch_secs};

use crate::error::{PoolError, PoolResult};
use crate::monitor::JobMonitor;
use crate::registry::Pool;

const NAME_PREFIX: &str = "bg-";
const NAME_SUFFIX_LEN: usize = 10;

pub struct Submitter {
    pool: Arc<Pool>,
    provisioner: Arc<dyn ClusterProvisioner>,
    store: StateStore,
    predictor: Option<Arc<dyn Predictor>>,
    cluster_spec: ClusterSpec,
    autoscaler: AutoscalerConfig,
    monitor_interval: Duration,
}

impl Submitter {
    pub fn new(
        pool: Arc<Pool>,
        provisioner: Arc<dyn ClusterProvisioner>,
        store: StateStore,
        autoscaler: AutoscalerConfig,
    ) -> PoolResult<Self> {
        autoscaler.policy.validate()?;
        Ok(Self {
            pool,
            provisioner,
            store,
            predictor: None,
            cluster_spec: ClusterSpec::default(),
            autoscaler,
            monitor_interval: Duration::from_secs(10),
        })
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn with_cluster_spec(mut self, spec: ClusterSpec) -> Self {
        self.cluster_spec = spec;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Deploy `jobs` onto a new cluster.
    ///
    /// Fails only if no cluster could be brought up; the caller owns the
    /// jobs in that case. Once the cluster runs, per-job submission
    /// failures mark that job `Failed` and the deployment still succeeds.
    pub async fn deploy(
        &self,
        jobs: &[Job],
        high_performance: bool,
    ) -> PoolResult<Arc<ClusterHandle>> {
        if jobs.is_empty() {
            return Err(PoolError::EmptyDeployment);
        }
        let name = random_cluster_name();
        let spec = self.cluster_spec.clone().with_high_performance(high_performance);

        let cluster = Arc::new(self.provisioner.create(&name, &spec).await?);
        let autoscaler = self
            .autoscaler
            .build(Arc::clone(&cluster), self.predictor.clone())?;
        cluster.allocate_resources().await?;
        self.pool.add_cluster(Arc::clone(&cluster), autoscaler.spawn()).await;

        let mut submitted = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut job = job.clone();
            if let Err(e) = cluster.submit_job(&mut job).await {
                warn!(cluster = %name, job = job.id, error = %e, "job submission failed");
                job.status = JobStatus::Failed;
                job.cluster = Some(name.clone());
                job.updated_at = epoch_secs();
            }
            submitted.push(job);
        }
        if let Err(e) = self.store.put_jobs(&submitted) {
            warn!(cluster = %name, error = %e, "failed to persist submitted jobs");
        }
        if let Err(e) = self.store.put_cluster(&cluster.record().await) {
            warn!(cluster = %name, error = %e, "failed to persist cluster");
        }

        let monitor = JobMonitor::new(Arc::clone(&cluster), Arc::clone(&self.pool), self.store.clone())
            .with_interval(self.monitor_interval)
            .spawn();
        self.pool.attach_monitor(&name, monitor).await;

        info!(
            cluster = %name,
            jobs = submitted.len(),
            high_performance,
            policy = self.autoscaler.policy.kind(),
            "cluster deployed"
        );
        Ok(cluster)
    }
}

/// `bg-` followed by ten random lowercase letters.
pub fn random_cluster_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect();
    format!("{NAME_PREFIX}{suffix}")
}
