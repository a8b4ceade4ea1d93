//! Deployment seam between the scheduler and the cluster pool.

use std::future::Future;
use std::pin::Pin;

use batchgrid_pool::{PoolResult, Submitter};
use batchgrid_state::Job;

pub type DeployFuture<'a> = Pin<Box<dyn Future<Output = PoolResult<()>> + Send + 'a>>;

/// Runs a batch of jobs on one new cluster.
pub trait Deployer: Send + Sync {
    fn deploy<'a>(&'a self, jobs: &'a [Job], high_performance: bool) -> DeployFuture<'a>;
}

impl Deployer for Submitter {
    fn deploy<'a>(&'a self, jobs: &'a [Job], high_performance: bool) -> DeployFuture<'a> {
        Box::pin(async move {
            Submitter::deploy(self, jobs, high_performance).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use batchgrid_cluster::ClusterError;
    use batchgrid_pool::PoolError;
    use batchgrid_state::JobId;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every batch; fails all of them when `fail` is set. A batch
    /// holding the job named in `delay` sleeps before it is recorded.
    #[derive(Default)]
    pub(crate) struct MockDeployer {
        pub fail: bool,
        pub delay: Option<(JobId, Duration)>,
        pub batches: Mutex<Vec<(Vec<JobId>, bool)>>,
    }

    impl MockDeployer {
        pub(crate) fn batches(&self) -> Vec<(Vec<JobId>, bool)> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl Deployer for MockDeployer {
        fn deploy<'a>(&'a self, jobs: &'a [Job], high_performance: bool) -> DeployFuture<'a> {
            Box::pin(async move {
                if let Some((slow, pause)) = self.delay {
                    if jobs.iter().any(|job| job.id == slow) {
                        tokio::time::sleep(pause).await;
                    }
                }
                let ids = jobs.iter().map(|job| job.id).collect();
                self.batches.lock().unwrap().push((ids, high_performance));
                if self.fail {
                    return Err(PoolError::Cluster(ClusterError::Allocate {
                        cluster: "bg-test".into(),
                        reason: "quota exceeded".into(),
                    }));
                }
                Ok(())
            })
        }
    }
}
