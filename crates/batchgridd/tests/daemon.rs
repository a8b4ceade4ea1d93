//! End-to-end runs of the control plane on the local platform.

use std::net::TcpListener;
use std::time::Duration;

use batchgrid_scheduler::{JobRequest, LevelConfig};
use batchgrid_state::{Job, JobStatus, StateStore};
use batchgridd::{ControlPlane, DaemonConfig};

/// An address nothing listens on.
fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn test_config(data_dir: &std::path::Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.store.data_dir = data_dir.to_path_buf();
    config.heartbeat.listen = "127.0.0.1:0".parse().unwrap();
    config.predictor.endpoint = closed_port();
    config.predictor.timeout_secs = 1;
    // Run without a predictor; jobs get zero duration estimates.
    config.predictor.required = false;
    config.pool.monitor_interval_secs = 1;
    config.pool.liveliness_interval_secs = 1;
    config.platform.local.time_scale = 0.01;
    config.platform.local.heartbeat_interval_secs = 1;
    config.scheduler.levels = vec![LevelConfig {
        timeout_secs: 1,
        ..Default::default()
    }];
    config
}

async fn wait_for_status(store: &StateStore, id: u64, status: JobStatus) -> Job {
    for _ in 0..100 {
        if let Some(job) = store.get_job(id).unwrap() {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {id} never reached {status:?}");
}

async fn wait_for_empty_pool(plane: &ControlPlane) {
    for _ in 0..50 {
        if plane.pool().is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pool still holds {:?}", plane.pool().cluster_names().await);
}

#[tokio::test]
async fn submitted_job_runs_to_completion_and_cluster_is_torn_down() {
    let dir = tempfile::tempdir().unwrap();
    let plane = ControlPlane::start(test_config(dir.path())).await.unwrap();
    assert_eq!(plane.recovered_jobs(), 0);
    assert_ne!(plane.heartbeat_addr().port(), 0);

    let job = plane
        .submit(JobRequest::new("gs://bucket/wordcount.py", 0))
        .await
        .unwrap();
    assert_eq!(job.predicted_duration, 0);

    let done = wait_for_status(plane.store(), job.id, JobStatus::Completed).await;
    let cluster = done.cluster.clone().unwrap();
    assert!(cluster.starts_with("bg-"));

    wait_for_empty_pool(&plane).await;
    let record = plane.store().get_cluster(&cluster).unwrap().unwrap();
    assert_eq!(record.name, cluster);

    plane.shutdown().await;
}

#[tokio::test]
async fn urgent_jobs_skip_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.scheduler.levels[0].timeout_secs = 3600;
    let plane = ControlPlane::start(config).await.unwrap();

    let job = plane
        .submit(JobRequest::new("gs://bucket/urgent.py", 1))
        .await
        .unwrap();
    assert!(plane.scheduler().bins(0).await.unwrap().is_empty());
    wait_for_status(plane.store(), job.id, JobStatus::Completed).await;

    plane.shutdown().await;
}

#[tokio::test]
async fn pending_jobs_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    {
        std::fs::create_dir_all(&config.store.data_dir).unwrap();
        let store = StateStore::open(&config.store.path()).unwrap();
        let id = store.next_job_id().unwrap();
        store.put_job(&Job::new(id, "gs://bucket/leftover.py", 0)).unwrap();
    }

    let plane = ControlPlane::start(config).await.unwrap();
    assert_eq!(plane.recovered_jobs(), 1);
    wait_for_status(plane.store(), 1, JobStatus::Completed).await;

    plane.shutdown().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.scheduler.levels.clear();
    assert!(ControlPlane::start(config).await.is_err());
}

#[tokio::test]
async fn unreachable_predictor_is_fatal_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.predictor = Default::default();
    config.predictor.endpoint = closed_port();
    assert!(config.predictor.required);
    assert!(ControlPlane::start(config).await.is_err());
}
