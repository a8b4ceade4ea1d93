//! Local simulated platform.
//!
//! Runs clusters entirely in-process: nodes are counters, jobs finish once
//! their predicted duration (times `time_scale`) has elapsed, and YARN-style
//! telemetry is synthesized from the simulated load. When a heartbeat
//! target is configured, every allocated cluster emits that telemetry over
//! UDP exactly as a real cluster agent would, so the full control loop can
//! run without a cloud account.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use batchgrid_state::{Job, MetricsSnapshot, Platform, epoch_secs};

use crate::driver::{ClusterDriver, ClusterProvisioner, ClusterSpec, DriverFuture, JobProgress};
use crate::error::ClusterError;
use crate::handle::ClusterHandle;

/// Tunables of the simulated platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPlatformConfig {
    /// Multiplier applied to predicted durations. `0.01` runs a one-hour
    /// job in 36 seconds.
    pub time_scale: f64,
    pub containers_per_node: i32,
    pub container_mb: i32,
    /// Where simulated clusters send heartbeats. `None` disables emission.
    pub heartbeat_target: Option<SocketAddr>,
    pub heartbeat_interval_secs: u64,
    pub cost_per_node_hour: f32,
}

impl Default for LocalPlatformConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            containers_per_node: 2,
            container_mb: 1024,
            heartbeat_target: None,
            heartbeat_interval_secs: 10,
            cost_per_node_hour: 0.05,
        }
    }
}

struct SimJob {
    finish_at: Instant,
    fails: bool,
    released: bool,
}

struct SimCluster {
    name: String,
    spec: ClusterSpec,
    elastic: i32,
    allocated: bool,
    started: Instant,
    jobs: HashMap<String, SimJob>,
    containers_allocated: i32,
    containers_released: i32,
    emitter: Option<watch::Sender<bool>>,
}

impl SimCluster {
    fn nodes(&self) -> i32 {
        self.spec.workers + self.elastic
    }

    /// Synthesize telemetry from the current simulated load.
    fn snapshot(&mut self, config: &LocalPlatformConfig) -> MetricsSnapshot {
        let now = Instant::now();
        let per_job = config.containers_per_node.max(1);
        for job in self.jobs.values_mut() {
            if !job.released && now >= job.finish_at {
                job.released = true;
                self.containers_released += per_job;
            }
        }

        let active = self.jobs.values().filter(|job| !job.released).count() as i32;
        let capacity = self.nodes() * per_job;
        let demand = active * per_job;
        let allocated = demand.min(capacity);
        let pending = demand - allocated;
        let hours = self.started.elapsed().as_secs_f32() / 3600.0;

        MetricsSnapshot {
            timestamp: epoch_secs(),
            pending_containers: pending,
            allocated_containers: allocated,
            pending_mb: pending * config.container_mb,
            pending_vcores: pending,
            available_mb: (capacity - allocated) * config.container_mb,
            available_vcores: capacity - allocated,
            allocated_mb: allocated * config.container_mb,
            allocated_vcores: allocated,
            aggregate_containers_allocated: self.containers_allocated,
            aggregate_containers_released: self.containers_released,
            number_of_nodes: self.nodes(),
            cost: self.nodes() as f32 * hours * config.cost_per_node_hour,
            ..Default::default()
        }
    }
}

type SharedSim = Arc<Mutex<SimCluster>>;
type SimRegistry = Arc<Mutex<HashMap<String, SharedSim>>>;

fn lock(sim: &SharedSim) -> MutexGuard<'_, SimCluster> {
    sim.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_registry(registry: &SimRegistry) -> MutexGuard<'_, HashMap<String, SharedSim>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Driver for one simulated cluster.
pub struct LocalDriver {
    sim: SharedSim,
    registry: SimRegistry,
    config: Arc<LocalPlatformConfig>,
    job_seq: Arc<AtomicU64>,
}

impl LocalDriver {
    /// Current synthesized telemetry.
    pub fn metrics(&self) -> MetricsSnapshot {
        lock(&self.sim).snapshot(&self.config)
    }
}

impl ClusterDriver for LocalDriver {
    fn allocate_resources<'a>(&'a self, spec: &'a ClusterSpec) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let mut sim = lock(&self.sim);
            if sim.allocated {
                return Ok(());
            }
            sim.spec = spec.clone();
            sim.elastic = spec.elastic_nodes.max(spec.min_elastic_nodes);
            sim.allocated = true;
            sim.started = Instant::now();
            if let Some(target) = self.config.heartbeat_target {
                let (tx, rx) = watch::channel(false);
                sim.emitter = Some(tx);
                tokio::spawn(emit_heartbeats(
                    Arc::clone(&self.sim),
                    Arc::clone(&self.config),
                    target,
                    rx,
                ));
            }
            info!(cluster = %sim.name, nodes = sim.nodes(), "local cluster allocated");
            Ok(())
        })
    }

    fn free_resources(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let name = {
                let mut sim = lock(&self.sim);
                if let Some(emitter) = sim.emitter.take() {
                    let _ = emitter.send(true);
                }
                sim.allocated = false;
                sim.jobs.clear();
                sim.name.clone()
            };
            let mut registry = lock_registry(&self.registry);
            if registry
                .get(&name)
                .is_some_and(|known| Arc::ptr_eq(known, &self.sim))
            {
                registry.remove(&name);
            }
            info!(cluster = %name, "local cluster deleted");
            Ok(())
        })
    }

    fn submit_job<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, String> {
        Box::pin(async move {
            let mut sim = lock(&self.sim);
            if !sim.allocated {
                return Err(ClusterError::Submit {
                    cluster: sim.name.clone(),
                    job: job.id,
                    reason: "cluster not allocated".into(),
                });
            }
            let platform_id = format!("local-{}", self.job_seq.fetch_add(1, Ordering::Relaxed));
            let secs = job.predicted_duration.max(1) as f64 * self.config.time_scale.max(0.0);
            let fails = rand::thread_rng()
                .gen_bool(f64::from(job.failure_probability).clamp(0.0, 1.0));
            sim.jobs.insert(
                platform_id.clone(),
                SimJob {
                    finish_at: Instant::now() + Duration::from_secs_f64(secs),
                    fails,
                    released: false,
                },
            );
            sim.containers_allocated += self.config.containers_per_node.max(1);
            debug!(cluster = %sim.name, job = job.id, %platform_id, secs, "local job started");
            Ok(platform_id)
        })
    }

    fn scale(&self, delta: i32) -> DriverFuture<'_, bool> {
        Box::pin(async move {
            let mut sim = lock(&self.sim);
            if !sim.allocated {
                return Err(ClusterError::Scale {
                    cluster: sim.name.clone(),
                    reason: "cluster not allocated".into(),
                });
            }
            sim.elastic = (sim.elastic + delta).max(sim.spec.min_elastic_nodes);
            debug!(cluster = %sim.name, delta, elastic = sim.elastic, "local cluster scaled");
            Ok(sim.elastic == 0)
        })
    }

    fn job_status<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, JobProgress> {
        Box::pin(async move {
            let sim = lock(&self.sim);
            let sim_job = job
                .platform_job_id
                .as_ref()
                .and_then(|id| sim.jobs.get(id))
                .ok_or(ClusterError::UnknownJob { job: job.id })?;
            let progress = if Instant::now() < sim_job.finish_at {
                JobProgress::Running
            } else if sim_job.fails {
                JobProgress::Failed
            } else {
                JobProgress::Completed
            };
            Ok(progress)
        })
    }
}

async fn emit_heartbeats(
    sim: SharedSim,
    config: Arc<LocalPlatformConfig>,
    target: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    #[derive(Serialize)]
    struct Beat<'a> {
        cluster_name: &'a str,
        service_type: &'static str,
        #[serde(flatten)]
        metrics: &'a MetricsSnapshot,
    }

    let bind: SocketAddr = if target.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "local heartbeat socket bind failed");
            return;
        }
    };
    let interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        let (name, metrics) = {
            let mut guard = lock(&sim);
            (guard.name.clone(), guard.snapshot(&config))
        };
        let beat = Beat {
            cluster_name: &name,
            service_type: Platform::Local.as_str(),
            metrics: &metrics,
        };
        match serde_json::to_vec(&beat) {
            Ok(payload) => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    debug!(cluster = %name, error = %e, "heartbeat send failed");
                }
            }
            Err(e) => warn!(cluster = %name, error = %e, "heartbeat encode failed"),
        }
    }
}

/// Provisioner for the local platform. Remembers every cluster it created
/// until it is freed, so that heartbeats from them can be recovered after
/// a restart of the registry.
pub struct LocalProvisioner {
    config: Arc<LocalPlatformConfig>,
    clusters: SimRegistry,
    job_seq: Arc<AtomicU64>,
}

impl LocalProvisioner {
    pub fn new(config: LocalPlatformConfig) -> Self {
        Self {
            config: Arc::new(config),
            clusters: Arc::new(Mutex::new(HashMap::new())),
            job_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    fn driver(&self, sim: SharedSim) -> LocalDriver {
        LocalDriver {
            sim,
            registry: Arc::clone(&self.clusters),
            config: Arc::clone(&self.config),
            job_seq: Arc::clone(&self.job_seq),
        }
    }

    fn clusters(&self) -> MutexGuard<'_, HashMap<String, SharedSim>> {
        lock_registry(&self.clusters)
    }
}

impl ClusterProvisioner for LocalProvisioner {
    fn create<'a>(
        &'a self,
        name: &'a str,
        spec: &'a ClusterSpec,
    ) -> DriverFuture<'a, ClusterHandle> {
        Box::pin(async move {
            let sim = Arc::new(Mutex::new(SimCluster {
                name: name.to_string(),
                spec: spec.clone(),
                elastic: spec.elastic_nodes,
                allocated: false,
                started: Instant::now(),
                jobs: HashMap::new(),
                containers_allocated: 0,
                containers_released: 0,
                emitter: None,
            }));
            {
                let mut clusters = self.clusters();
                if clusters.contains_key(name) {
                    return Err(ClusterError::Provision(format!(
                        "cluster {name} already exists"
                    )));
                }
                clusters.insert(name.to_string(), Arc::clone(&sim));
            }
            let driver = self.driver(sim);
            Ok(ClusterHandle::new(
                name,
                Platform::Local,
                spec.clone(),
                Box::new(driver),
            ))
        })
    }

    fn recover<'a>(
        &'a self,
        name: &'a str,
        platform: Platform,
    ) -> DriverFuture<'a, Option<ClusterHandle>> {
        Box::pin(async move {
            if platform != Platform::Local {
                return Ok(None);
            }
            let Some(sim) = self.clusters().get(name).cloned() else {
                return Ok(None);
            };
            let spec = {
                let guard = lock(&sim);
                if !guard.allocated {
                    return Ok(None);
                }
                let mut spec = guard.spec.clone();
                spec.elastic_nodes = guard.elastic;
                spec
            };
            let driver = self.driver(sim);
            Ok(Some(ClusterHandle::new(
                name,
                Platform::Local,
                spec,
                Box::new(driver),
            )))
        })
    }
}
