//! One autoscaling control loop per cluster.
//!
//! Every `interval` the loop snapshots the cluster's metrics window, asks
//! its policy for a node delta, and applies it. Upscales always go
//! through; downscales only when `allow_downscale` is set. After a
//! successful non-zero scale the next check waits an extra `backoff` so
//! the platform can settle. Scale errors are logged and the next interval
//! retries from fresh metrics.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use batchgrid_cluster::{ClusterHandle, ClusterResult};
use batchgrid_state::ClusterStatus;

use crate::error::PolicyResult;
use crate::policies::{Policy, PolicySpec, ProportionalConfig};
use crate::predictor::Predictor;

/// Loop timing and policy selection, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub interval_secs: u64,
    pub backoff_secs: u64,
    pub allow_downscale: bool,
    pub policy: PolicySpec,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            backoff_secs: 30,
            allow_downscale: true,
            policy: PolicySpec::default(),
        }
    }
}

impl AutoscalerConfig {
    /// Binding used for clusters adopted from heartbeats.
    pub fn recovery() -> Self {
        Self {
            allow_downscale: false,
            policy: PolicySpec::Proportional(ProportionalConfig::default()),
            ..Default::default()
        }
    }

    /// Build an autoscaler for `cluster` with a fresh policy instance.
    pub fn build(
        &self,
        cluster: Arc<ClusterHandle>,
        predictor: Option<Arc<dyn Predictor>>,
    ) -> PolicyResult<Autoscaler> {
        let policy = self.policy.build(cluster.name(), predictor)?;
        Ok(Autoscaler::new(cluster, policy)
            .with_interval(Duration::from_secs(self.interval_secs))
            .with_backoff(Duration::from_secs(self.backoff_secs))
            .with_downscale(self.allow_downscale))
    }
}

pub struct Autoscaler {
    cluster: Arc<ClusterHandle>,
    policy: Box<dyn Policy>,
    interval: Duration,
    backoff: Duration,
    allow_downscale: bool,
}

impl Autoscaler {
    pub fn new(cluster: Arc<ClusterHandle>, policy: Box<dyn Policy>) -> Self {
        Self {
            cluster,
            policy,
            interval: Duration::from_secs(15),
            backoff: Duration::from_secs(30),
            allow_downscale: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_downscale(mut self, allow: bool) -> Self {
        self.allow_downscale = allow;
        self
    }

    pub fn cluster(&self) -> &Arc<ClusterHandle> {
        &self.cluster
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Run one decision. Returns the delta actually applied (0 when the
    /// policy held or the delta was suppressed).
    pub async fn check_once(&mut self) -> ClusterResult<i32> {
        if self.cluster.status() == ClusterStatus::Closed {
            return Ok(0);
        }
        let view = self.cluster.metrics_window().snapshot().await;
        let delta = self.policy.apply(&view).await;

        if delta == 0 {
            return Ok(0);
        }
        if delta < 0 && !self.allow_downscale {
            debug!(cluster = %self.cluster.name(), delta, "downscale suppressed");
            return Ok(0);
        }
        self.cluster.scale(delta).await?;
        Ok(delta)
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> AutoscalerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cluster_name = self.cluster.name().to_string();
        let task = tokio::spawn(self.run(shutdown_rx));
        AutoscalerHandle {
            cluster_name,
            shutdown_tx,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            cluster = %self.cluster.name(),
            policy = self.policy.name(),
            interval_ms = self.interval.as_millis() as u64,
            downscale = self.allow_downscale,
            "autoscaler started"
        );

        let mut wait = self.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    wait = self.interval;
                    match self.check_once().await {
                        Ok(0) => {}
                        Ok(_) => wait += self.backoff,
                        Err(e) => {
                            warn!(cluster = %self.cluster.name(), error = %e, "scaling failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!(cluster = %self.cluster.name(), "autoscaler stopped");
    }
}

/// Owner side of a running autoscaler loop.
#[derive(Debug)]
pub struct AutoscalerHandle {
    cluster_name: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutoscalerHandle {
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Signal the loop to exit. The loop finishes its current check first.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver that observes the stop signal.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(cluster = %self.cluster_name, error = %e, "autoscaler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::PolicyFuture;
    use batchgrid_cluster::{ClusterDriver, ClusterError, ClusterSpec, DriverFuture, JobProgress};
    use batchgrid_state::{Job, MetricsSnapshot, Platform, WindowView};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScaleLog {
        deltas: Arc<Mutex<Vec<i32>>>,
        fail: bool,
    }

    impl ClusterDriver for ScaleLog {
        fn allocate_resources<'a>(&'a self, _spec: &'a ClusterSpec) -> DriverFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn free_resources(&self) -> DriverFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn submit_job<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, String> {
            Box::pin(async move { Ok(job.id.to_string()) })
        }

        fn scale(&self, delta: i32) -> DriverFuture<'_, bool> {
            self.deltas.lock().unwrap().push(delta);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(ClusterError::Scale {
                        cluster: "c1".into(),
                        reason: "quota".into(),
                    })
                } else {
                    Ok(false)
                }
            })
        }

        fn job_status<'a>(&'a self, _job: &'a Job) -> DriverFuture<'a, JobProgress> {
            Box::pin(async { Ok(JobProgress::Running) })
        }
    }

    struct Fixed(i32);

    impl Policy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn apply<'a>(&'a mut self, _window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a> {
            let delta = self.0;
            Box::pin(async move { delta })
        }
    }

    fn cluster(fail: bool) -> (Arc<ClusterHandle>, Arc<Mutex<Vec<i32>>>) {
        let driver = ScaleLog {
            fail,
            ..Default::default()
        };
        let deltas = Arc::clone(&driver.deltas);
        let spec = ClusterSpec {
            workers: 10,
            ..Default::default()
        };
        let handle = ClusterHandle::new("c1", Platform::Local, spec, Box::new(driver));
        (Arc::new(handle), deltas)
    }

    #[tokio::test]
    async fn upscale_is_applied() {
        let (c, deltas) = cluster(false);
        let mut scaler = Autoscaler::new(c, Box::new(Fixed(3)));
        assert_eq!(scaler.check_once().await.unwrap(), 3);
        assert_eq!(*deltas.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn downscale_needs_permission() {
        let (c, deltas) = cluster(false);
        let mut scaler = Autoscaler::new(Arc::clone(&c), Box::new(Fixed(-2))).with_downscale(false);
        assert_eq!(scaler.check_once().await.unwrap(), 0);
        assert!(deltas.lock().unwrap().is_empty());

        let mut scaler = Autoscaler::new(c, Box::new(Fixed(-2)));
        assert_eq!(scaler.check_once().await.unwrap(), -2);
    }

    #[tokio::test]
    async fn closed_cluster_is_left_alone() {
        let (c, deltas) = cluster(false);
        c.free_resources().await.unwrap();
        let mut scaler = Autoscaler::new(c, Box::new(Fixed(5)));
        assert_eq!(scaler.check_once().await.unwrap(), 0);
        assert!(deltas.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn loop_retries_after_scale_errors_and_stops_on_signal() {
        let (c, deltas) = cluster(true);
        let handle = Autoscaler::new(c, Box::new(Fixed(1)))
            .with_interval(Duration::from_millis(10))
            .spawn();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(deltas.lock().unwrap().len() >= 2);

        handle.stop();
        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backoff_follows_successful_scale() {
        let (c, deltas) = cluster(false);
        let handle = Autoscaler::new(c, Box::new(Fixed(1)))
            .with_interval(Duration::from_millis(10))
            .with_backoff(Duration::from_secs(60))
            .spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One scale, then the loop sits in its backoff.
        assert_eq!(*deltas.lock().unwrap(), vec![1]);
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn config_builds_recovery_binding() {
        let (c, _) = cluster(false);
        let scaler = AutoscalerConfig::recovery().build(c, None).unwrap();
        assert_eq!(scaler.policy_name(), "proportional");
        assert!(!scaler.allow_downscale);
    }
}
