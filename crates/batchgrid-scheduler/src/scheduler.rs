//! Multi-level priority scheduler.
//!
//! Priorities `0..levels` are batched: each job is bin-packed into its
//! level, and every `timeout` the level's bins are flushed, each bin
//! becoming one new cluster. Priorities at or above the level count skip
//! batching and get a cluster of their own, high-performance when the
//! priority exceeds the level count.
//!
//! ```text
//! schedule_job(job)
//!   priority < 0        ─▶ InvalidPriority
//!   priority == levels  ─▶ deploy alone (normal)
//!   priority >  levels  ─▶ deploy alone (high performance)
//!   otherwise           ─▶ level[priority].bins ◀── flush loop every timeout
//! ```
//!
//! Deployments run as background tasks so that one slow cluster never
//! holds back the rest of a flush or an admission. A failed deployment
//! persists its jobs as failed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use batchgrid_state::{Job, JobStatus, StateStore, epoch_secs};

use crate::deploy::Deployer;
use crate::error::{SchedulerError, SchedulerResult};

/// How a level measures bin fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingPolicy {
    /// Sum of predicted durations, in seconds.
    #[default]
    Duration,
    /// Number of jobs.
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    pub policy: PackingPolicy,
    /// Seconds between flushes.
    pub timeout_secs: u64,
    /// Largest cumulative value of one bin.
    pub bin_capacity: i64,
    /// Flushed bins run on high-performance clusters.
    pub high_performance: bool,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            policy: PackingPolicy::Duration,
            timeout_secs: 60,
            bin_capacity: 3600,
            high_performance: false,
        }
    }
}

impl LevelConfig {
    fn value_of(&self, job: &Job) -> i64 {
        match self.policy {
            PackingPolicy::Duration => job.predicted_duration.max(0),
            PackingPolicy::Count => 1,
        }
    }
}

/// Jobs destined for the same cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityBin {
    pub jobs: Vec<Job>,
    pub cumulative: i64,
}

impl PriorityBin {
    /// A sum that overflows never fits.
    fn admits(&self, value: i64, capacity: i64) -> bool {
        self.cumulative
            .checked_add(value)
            .is_some_and(|sum| sum <= capacity)
            || (self.jobs.is_empty() && value > capacity)
    }
}

/// Where a scheduled job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued { level: usize, bin: usize },
    /// Handed to a background deployment.
    Deployed { high_performance: bool },
}

struct Level {
    config: LevelConfig,
    bins: Mutex<Vec<PriorityBin>>,
}

pub struct Scheduler {
    levels: Vec<Level>,
    deployer: Arc<dyn Deployer>,
    store: StateStore,
    deployments: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        levels: Vec<LevelConfig>,
        deployer: Arc<dyn Deployer>,
        store: StateStore,
    ) -> SchedulerResult<Self> {
        if levels.is_empty() {
            return Err(SchedulerError::NoLevels);
        }
        for (level, config) in levels.iter().enumerate() {
            if config.bin_capacity <= 0 {
                return Err(SchedulerError::InvalidLevel {
                    level,
                    reason: format!("bin_capacity must be positive, got {}", config.bin_capacity),
                });
            }
            if config.timeout_secs == 0 {
                return Err(SchedulerError::InvalidLevel {
                    level,
                    reason: "timeout_secs must be positive".into(),
                });
            }
        }
        Ok(Self {
            levels: levels
                .into_iter()
                .map(|config| Level {
                    config,
                    bins: Mutex::new(Vec::new()),
                })
                .collect(),
            deployer,
            store,
            deployments: Mutex::new(JoinSet::new()),
        })
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub async fn schedule_job(&self, job: Job) -> SchedulerResult<Admission> {
        if job.priority < 0 {
            return Err(SchedulerError::InvalidPriority {
                job: job.id,
                priority: job.priority,
            });
        }
        let priority = job.priority as usize;
        let count = self.levels.len();

        if priority >= count {
            let high_performance = priority > count;
            debug!(job = job.id, priority, high_performance, "job bypasses batching");
            self.spawn_deployment(vec![job], high_performance).await;
            return Ok(Admission::Deployed { high_performance });
        }

        let level = &self.levels[priority];
        let value = level.config.value_of(&job);
        let capacity = level.config.bin_capacity;
        let job_id = job.id;

        let mut bins = level.bins.lock().await;
        let bin = match bins.iter().position(|bin| bin.admits(value, capacity)) {
            Some(index) => index,
            None => {
                bins.push(PriorityBin::default());
                bins.len() - 1
            }
        };
        bins[bin].cumulative = bins[bin].cumulative.saturating_add(value);
        bins[bin].jobs.push(job);
        debug!(job = job_id, level = priority, bin, value, "job queued");
        Ok(Admission::Queued {
            level: priority,
            bin,
        })
    }

    /// Copy of a level's current bins.
    pub async fn bins(&self, level: usize) -> SchedulerResult<Vec<PriorityBin>> {
        let level = self
            .levels
            .get(level)
            .ok_or(SchedulerError::UnknownLevel(level))?;
        Ok(level.bins.lock().await.clone())
    }

    /// Empty a level and start one deployment per bin. Returns the number
    /// of deployments started; their outcome is persisted by each task.
    pub async fn flush_level(&self, level: usize) -> SchedulerResult<usize> {
        let entry = self
            .levels
            .get(level)
            .ok_or(SchedulerError::UnknownLevel(level))?;
        let bins = std::mem::take(&mut *entry.bins.lock().await);
        if bins.is_empty() {
            return Ok(0);
        }

        let total = bins.len();
        let mut started = 0;
        for bin in bins.into_iter().filter(|bin| !bin.jobs.is_empty()) {
            self.spawn_deployment(bin.jobs, entry.config.high_performance)
                .await;
            started += 1;
        }
        info!(level, bins = total, started, "level flushed");
        Ok(started)
    }

    async fn spawn_deployment(&self, jobs: Vec<Job>, high_performance: bool) {
        let deployer = Arc::clone(&self.deployer);
        let store = self.store.clone();
        let mut deployments = self.deployments.lock().await;
        while let Some(done) = deployments.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "deployment task ended abnormally");
            }
        }
        deployments.spawn(deploy_batch(deployer, store, jobs, high_performance));
    }

    /// Wait until every deployment started so far has finished.
    pub async fn wait_for_deployments(&self) {
        loop {
            let mut running = std::mem::take(&mut *self.deployments.lock().await);
            if running.is_empty() {
                return;
            }
            while let Some(done) = running.join_next().await {
                if let Err(e) = done {
                    warn!(error = %e, "deployment task ended abnormally");
                }
            }
        }
    }

    /// Flush `level` every `timeout_secs` until `shutdown` fires.
    pub async fn run_level(&self, level: usize, mut shutdown: watch::Receiver<bool>) {
        let Some(entry) = self.levels.get(level) else {
            return;
        };
        let interval = Duration::from_secs(entry.config.timeout_secs);
        info!(level, interval_secs = interval.as_secs(), "flush loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.flush_level(level).await {
                        error!(level, error = %e, "flush failed");
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!(level, "flush loop stopped");
    }

    /// Start one flush loop per level.
    pub fn spawn_flush_loops(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.levels.len())
            .map(|level| {
                let scheduler = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.run_level(level, shutdown).await })
            })
            .collect()
    }
}

/// Deploy `jobs` on one cluster; on failure every job is persisted as
/// failed.
async fn deploy_batch(
    deployer: Arc<dyn Deployer>,
    store: StateStore,
    jobs: Vec<Job>,
    high_performance: bool,
) {
    let Err(e) = deployer.deploy(&jobs, high_performance).await else {
        return;
    };
    error!(jobs = jobs.len(), error = %e, "deployment failed, marking jobs failed");
    let now = epoch_secs();
    let failed: Vec<Job> = jobs
        .into_iter()
        .map(|mut job| {
            job.status = JobStatus::Failed;
            job.updated_at = now;
            job
        })
        .collect();
    if let Err(persist) = store.put_jobs(&failed) {
        error!(error = %persist, "failed to persist failed jobs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::MockDeployer;

    fn job(id: u64, priority: i32, duration: i64) -> Job {
        let mut job = Job::new(id, format!("gs://jobs/{id}.py"), priority);
        job.predicted_duration = duration;
        job
    }

    fn scheduler(levels: Vec<LevelConfig>, fail: bool) -> (Scheduler, Arc<MockDeployer>, StateStore) {
        let deployer = Arc::new(MockDeployer {
            fail,
            ..Default::default()
        });
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Scheduler::new(levels, deployer.clone(), store.clone()).unwrap();
        (scheduler, deployer, store)
    }

    fn duration_level(capacity: i64) -> LevelConfig {
        LevelConfig {
            bin_capacity: capacity,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bin_packing_by_duration() {
        let (s, _, _) = scheduler(vec![duration_level(100)], false);
        for (id, duration) in [(1, 60), (2, 30), (3, 50), (4, 10), (5, 40)] {
            s.schedule_job(job(id, 0, duration)).await.unwrap();
        }
        let bins = s.bins(0).await.unwrap();
        let ids: Vec<Vec<u64>> = bins
            .iter()
            .map(|bin| bin.jobs.iter().map(|job| job.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2, 4], vec![3, 5]]);
        assert_eq!(
            bins.iter().map(|bin| bin.cumulative).collect::<Vec<_>>(),
            vec![100, 90]
        );
        assert!(bins.iter().all(|bin| bin.cumulative <= 100));
    }

    #[tokio::test]
    async fn forty_forty_forty_fills_two_bins() {
        let (s, _, _) = scheduler(vec![duration_level(100)], false);
        for id in 1..=3 {
            s.schedule_job(job(id, 0, 40)).await.unwrap();
        }
        let bins = s.bins(0).await.unwrap();
        let ids: Vec<Vec<u64>> = bins
            .iter()
            .map(|bin| bin.jobs.iter().map(|job| job.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3]]);
        assert_eq!(
            bins.iter().map(|bin| bin.cumulative).collect::<Vec<_>>(),
            vec![80, 40]
        );
    }

    #[tokio::test]
    async fn oversized_job_gets_its_own_bin() {
        let (s, _, _) = scheduler(vec![duration_level(100)], false);
        s.schedule_job(job(1, 0, 50)).await.unwrap();
        s.schedule_job(job(2, 0, 500)).await.unwrap();
        s.schedule_job(job(3, 0, 20)).await.unwrap();

        let bins = s.bins(0).await.unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].cumulative, 70);
        assert_eq!(bins[1].jobs.len(), 1);
        assert_eq!(bins[1].cumulative, 500);
    }

    #[tokio::test]
    async fn huge_durations_do_not_overflow_bins() {
        let (s, _, _) = scheduler(vec![duration_level(100)], false);
        s.schedule_job(job(1, 0, 50)).await.unwrap();
        s.schedule_job(job(2, 0, i64::MAX)).await.unwrap();
        s.schedule_job(job(3, 0, 10)).await.unwrap();
        s.schedule_job(job(4, 0, 60)).await.unwrap();

        let bins = s.bins(0).await.unwrap();
        let ids: Vec<Vec<u64>> = bins
            .iter()
            .map(|bin| bin.jobs.iter().map(|job| job.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 3], vec![2], vec![4]]);
        assert_eq!(
            bins.iter().map(|bin| bin.cumulative).collect::<Vec<_>>(),
            vec![60, i64::MAX, 60]
        );
    }

    #[tokio::test]
    async fn count_packing() {
        let level = LevelConfig {
            policy: PackingPolicy::Count,
            bin_capacity: 2,
            ..Default::default()
        };
        let (s, _, _) = scheduler(vec![level], false);
        for id in 1..=5 {
            s.schedule_job(job(id, 0, 10_000)).await.unwrap();
        }
        let sizes: Vec<usize> = s.bins(0).await.unwrap().iter().map(|b| b.jobs.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn fast_path_priorities() {
        let (s, deployer, _) = scheduler(vec![duration_level(100); 3], false);
        assert_eq!(
            s.schedule_job(job(1, 3, 10)).await.unwrap(),
            Admission::Deployed {
                high_performance: false
            }
        );
        assert_eq!(
            s.schedule_job(job(2, 7, 10)).await.unwrap(),
            Admission::Deployed {
                high_performance: true
            }
        );
        s.wait_for_deployments().await;
        let mut batches = deployer.batches();
        batches.sort();
        assert_eq!(batches, vec![(vec![1], false), (vec![2], true)]);
        assert!(s.bins(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_priority_is_rejected() {
        let (s, deployer, _) = scheduler(vec![duration_level(100)], false);
        assert!(matches!(
            s.schedule_job(job(1, -1, 10)).await,
            Err(SchedulerError::InvalidPriority { job: 1, priority: -1 })
        ));
        assert!(deployer.batches().is_empty());
    }

    #[tokio::test]
    async fn flush_deploys_each_bin_and_empties_level() {
        let level = LevelConfig {
            bin_capacity: 100,
            high_performance: true,
            ..Default::default()
        };
        let (s, deployer, _) = scheduler(vec![level], false);
        for (id, duration) in [(1, 60), (2, 60), (3, 30)] {
            s.schedule_job(job(id, 0, duration)).await.unwrap();
        }

        assert_eq!(s.flush_level(0).await.unwrap(), 2);
        s.wait_for_deployments().await;
        let mut batches = deployer.batches();
        batches.sort();
        assert_eq!(batches, vec![(vec![1, 3], true), (vec![2], true)]);
        assert!(s.bins(0).await.unwrap().is_empty());
        assert_eq!(s.flush_level(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_deployment_marks_jobs_failed() {
        let (s, _, store) = scheduler(vec![duration_level(100)], true);
        let jobs = [job(1, 0, 10), job(2, 0, 10)];
        store.put_jobs(&jobs).unwrap();
        for job in jobs {
            s.schedule_job(job).await.unwrap();
        }

        assert_eq!(s.flush_level(0).await.unwrap(), 1);
        s.wait_for_deployments().await;
        for id in [1, 2] {
            assert_eq!(store.get_job(id).unwrap().unwrap().status, JobStatus::Failed);
        }
        // No retry: the level is empty afterwards.
        assert!(s.bins(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_fast_path_is_persisted() {
        let (s, deployer, store) = scheduler(vec![duration_level(100)], true);
        store.put_job(&job(1, 1, 10)).unwrap();
        assert_eq!(
            s.schedule_job(job(1, 1, 10)).await.unwrap(),
            Admission::Deployed {
                high_performance: false
            }
        );
        s.wait_for_deployments().await;
        assert_eq!(deployer.batches(), vec![(vec![1], false)]);
        assert_eq!(store.get_job(1).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn slow_deployment_does_not_hold_back_other_bins() {
        let deployer = Arc::new(MockDeployer {
            delay: Some((1, Duration::from_secs(1))),
            ..Default::default()
        });
        let store = StateStore::open_in_memory().unwrap();
        let s = Scheduler::new(vec![duration_level(100)], deployer.clone(), store).unwrap();
        s.schedule_job(job(1, 0, 80)).await.unwrap();
        s.schedule_job(job(2, 0, 80)).await.unwrap();

        let started = tokio::time::timeout(Duration::from_millis(500), s.flush_level(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started, 2);

        let mut second_done = false;
        for _ in 0..20 {
            if deployer.batches() == vec![(vec![2], false)] {
                second_done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(second_done, "second bin waited for the first: {:?}", deployer.batches());

        // Fast-path admissions are not blocked either.
        tokio::time::timeout(Duration::from_millis(500), s.schedule_job(job(3, 1, 10)))
            .await
            .unwrap()
            .unwrap();

        s.wait_for_deployments().await;
        let mut batches = deployer.batches();
        batches.sort();
        assert_eq!(
            batches,
            vec![(vec![1], false), (vec![2], false), (vec![3], false)]
        );
    }

    #[tokio::test]
    async fn concurrent_admissions_and_flushes_lose_nothing() {
        let level = LevelConfig {
            policy: PackingPolicy::Count,
            bin_capacity: 3,
            ..Default::default()
        };
        let (s, deployer, _) = scheduler(vec![level], false);
        let s = Arc::new(s);

        let mut tasks = Vec::new();
        for id in 1..=60u64 {
            let s = Arc::clone(&s);
            tasks.push(tokio::spawn(async move {
                s.schedule_job(job(id, 0, 1)).await.unwrap();
                if id % 10 == 0 {
                    s.flush_level(0).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        s.flush_level(0).await.unwrap();
        s.wait_for_deployments().await;

        let mut seen: Vec<u64> = deployer
            .batches()
            .into_iter()
            .flat_map(|(ids, _)| {
                assert!(ids.len() <= 3);
                ids
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (1..=60).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn flush_loops_stop_on_signal() {
        let level = LevelConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let (s, deployer, _) = scheduler(vec![level], false);
        let s = Arc::new(s);
        s.schedule_job(job(1, 0, 10)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let loops = s.spawn_flush_loops(&rx);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        s.wait_for_deployments().await;
        assert_eq!(deployer.batches(), vec![(vec![1], false)]);

        tx.send_replace(true);
        for handle in loops {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[test]
    fn construction_validates_levels() {
        let deployer: Arc<dyn Deployer> = Arc::new(MockDeployer::default());
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            Scheduler::new(vec![], Arc::clone(&deployer), store.clone()),
            Err(SchedulerError::NoLevels)
        ));
        assert!(matches!(
            Scheduler::new(vec![duration_level(0)], deployer, store),
            Err(SchedulerError::InvalidLevel { level: 0, .. })
        ));
    }

    #[test]
    fn level_config_parses_with_defaults() {
        let level: LevelConfig = serde_json::from_str(r#"{"policy": "count"}"#).unwrap();
        assert_eq!(level.policy, PackingPolicy::Count);
        assert_eq!(level.timeout_secs, 60);
        assert!(!level.high_performance);
    }
}
