//! Wiring of every batchgrid component into one running process.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use batchgrid_autoscale::{HttpPredictor, Predictor};
use batchgrid_cluster::{ClusterProvisioner, LocalProvisioner};
use batchgrid_heartbeat::HeartbeatReceiver;
use batchgrid_pool::{Pool, Submitter};
use batchgrid_scheduler::{JobRequest, Scheduler, SubmissionIntake};
use batchgrid_state::{Job, StateStore};

use crate::config::DaemonConfig;

/// A started control plane. Dropping it does not stop background tasks;
/// call [`ControlPlane::shutdown`].
pub struct ControlPlane {
    store: StateStore,
    pool: Arc<Pool>,
    scheduler: Arc<Scheduler>,
    intake: SubmissionIntake,
    heartbeat_addr: SocketAddr,
    recovered: usize,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub async fn start(config: DaemonConfig) -> anyhow::Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
            format!("creating data dir {}", config.store.data_dir.display())
        })?;
        let store_path = config.store.path();
        let store = StateStore::open(&store_path)
            .with_context(|| format!("opening state store {}", store_path.display()))?;
        info!(path = %store_path.display(), "state store opened");

        let predictor = HttpPredictor::new(&config.predictor.endpoint, config.predictor.timeout())
            .context("invalid predictor endpoint")?;
        match predictor.health().await {
            Ok(()) => info!(endpoint = predictor.endpoint(), "predictor reachable"),
            Err(e) if config.predictor.required => {
                bail!("predictor {} unreachable: {e}", predictor.endpoint());
            }
            Err(e) => warn!(
                endpoint = predictor.endpoint(),
                error = %e,
                "predictor unreachable, continuing without predictions"
            ),
        }
        let predictor: Arc<dyn Predictor> = Arc::new(predictor);

        let socket = UdpSocket::bind(config.heartbeat.listen)
            .await
            .with_context(|| format!("binding heartbeat socket {}", config.heartbeat.listen))?;
        let heartbeat_addr = socket.local_addr()?;

        let mut local = config.platform.local.clone();
        if local.heartbeat_target.is_none() {
            local.heartbeat_target = Some(loopback_target(heartbeat_addr));
        }
        let provisioner: Arc<dyn ClusterProvisioner> = Arc::new(LocalProvisioner::new(local));

        let pool = Arc::new(Pool::new().with_store(store.clone()));
        let monitor_interval = Duration::from_secs(config.pool.monitor_interval_secs);
        let submitter = Submitter::new(
            Arc::clone(&pool),
            Arc::clone(&provisioner),
            store.clone(),
            config.autoscaler.clone(),
        )?
        .with_predictor(Arc::clone(&predictor))
        .with_cluster_spec(config.pool.cluster.clone())
        .with_monitor_interval(monitor_interval);

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.levels.clone(),
            Arc::new(submitter),
            store.clone(),
        )?);
        let intake = SubmissionIntake::new(Arc::clone(&scheduler), store.clone())
            .with_predictor(Arc::clone(&predictor));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let receiver = HeartbeatReceiver::from_socket(
            socket,
            Arc::clone(&pool),
            Arc::clone(&provisioner),
            store.clone(),
        )
        .with_recovery(config.recovery.autoscaler())
        .with_predictor(Arc::clone(&predictor))
        .with_monitor_interval(monitor_interval);
        tasks.push(tokio::spawn(receiver.run(shutdown_rx.clone())));

        let liveliness_pool = Arc::clone(&pool);
        let liveliness_interval = Duration::from_secs(config.pool.liveliness_interval_secs);
        let liveliness_timeout = Duration::from_secs(config.pool.liveliness_timeout_secs);
        let liveliness_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            liveliness_pool
                .run_liveliness(liveliness_interval, liveliness_timeout, liveliness_rx)
                .await;
        }));

        tasks.extend(scheduler.spawn_flush_loops(&shutdown_rx));

        let recovered = match intake.recover_pending().await {
            Ok(recovered) => recovered,
            Err(e) => {
                shutdown_tx.send_replace(true);
                pool.stop_all().await;
                return Err(anyhow::Error::new(e).context("rescheduling pending jobs"));
            }
        };

        info!(
            heartbeat = %heartbeat_addr,
            levels = scheduler.level_count(),
            policy = config.autoscaler.policy.kind(),
            recovered,
            "control plane started"
        );

        Ok(Self {
            store,
            pool,
            scheduler,
            intake,
            heartbeat_addr,
            recovered,
            shutdown_tx,
            tasks,
        })
    }

    pub async fn submit(&self, request: JobRequest) -> anyhow::Result<Job> {
        Ok(self.intake.submit(request).await?)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn heartbeat_addr(&self) -> SocketAddr {
        self.heartbeat_addr
    }

    /// Pending jobs rescheduled at startup.
    pub fn recovered_jobs(&self) -> usize {
        self.recovered
    }

    /// Stop every loop, wait for in-flight deployments, then stop every
    /// cluster's autoscaler. Clusters are left
    /// running so that a restarted daemon can adopt them from heartbeats.
    pub async fn shutdown(self) {
        info!("control plane shutting down");
        self.shutdown_tx.send_replace(true);
        self.scheduler.wait_for_deployments().await;
        let stopped = self.pool.stop_all().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(autoscalers = stopped, "control plane stopped");
    }
}

/// Start from `config` and run until Ctrl-C.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let plane = ControlPlane::start(config).await?;
    tokio::signal::ctrl_c().await?;
    plane.shutdown().await;
    Ok(())
}

fn loopback_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}
