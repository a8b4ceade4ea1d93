//! Domain types shared by the batchgrid control loops.
//!
//! All persisted types are serializable to/from JSON for storage in redb
//! tables. `MetricsSnapshot` doubles as the payload of the heartbeat wire
//! message, so its field names are part of the external contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Unique identifier of a job.
pub type JobId = u64;

// ── Platforms ──────────────────────────────────────────────────────

/// The platform a cluster runs on.
///
/// Heartbeats carry this as their `service_type`; the provisioner uses it
/// to pick the driver implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Google Cloud Dataproc.
    Dataproc,
    /// In-process simulated platform.
    Local,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Dataproc => "dataproc",
            Platform::Local => "local",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dataproc" => Ok(Platform::Dataproc),
            "local" => Ok(Platform::Local),
            other => Err(StateError::UnknownPlatform(other.to_string())),
        }
    }
}

// ── Clusters ───────────────────────────────────────────────────────

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Running,
    Closed,
}

/// Persisted view of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub name: String,
    pub platform: Platform,
    pub status: ClusterStatus,
    /// Unix timestamp (seconds) when the cluster was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: u64,
    /// Number of worker nodes, elastic nodes included.
    pub node_count: i32,
    /// Jobs currently attached to the cluster.
    pub assigned_jobs: u32,
    pub high_performance: bool,
}

impl ClusterRecord {
    /// Key used in the clusters table.
    pub fn table_key(&self) -> &str {
        &self.name
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

/// Execution status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Kind of executable a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    PySpark,
    Undefined,
}

/// A data-processing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub executable_path: String,
    /// Whitespace-separated arguments passed to the executable.
    pub args: String,
    pub job_type: JobType,
    /// Scheduling level. Values at or above the configured level count
    /// bypass bin packing.
    pub priority: i32,
    /// Predicted run time in seconds.
    pub predicted_duration: i64,
    pub failure_probability: f32,
    pub status: JobStatus,
    /// Name of the cluster running this job, once deployed.
    pub cluster: Option<String>,
    /// Identifier the platform assigned on submission.
    pub platform_job_id: Option<String>,
    pub driver_output_path: Option<String>,
    pub author: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Job {
    /// Build a pending job with no prediction attached.
    pub fn new(id: JobId, executable_path: impl Into<String>, priority: i32) -> Self {
        let now = crate::epoch_secs();
        Self {
            id,
            executable_path: executable_path.into(),
            args: String::new(),
            job_type: JobType::default(),
            priority,
            predicted_duration: 0,
            failure_probability: 0.0,
            status: JobStatus::Pending,
            cluster: None,
            platform_job_id: None,
            driver_output_path: None,
            author: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key used in the jobs table. Zero-padded so keys sort by id.
    pub fn table_key(&self) -> String {
        job_key(self.id)
    }
}

/// Table key for a job id.
pub fn job_key(id: JobId) -> String {
    format!("{id:020}")
}

// ── Metrics ────────────────────────────────────────────────────────

/// YARN resource-manager counters forwarded verbatim to the predictor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct YarnCounters {
    pub am_resource_limit_mb: i32,
    pub am_resource_limit_vcores: i32,
    pub used_am_resource_mb: i32,
    pub used_am_resource_vcores: i32,
    pub apps_submitted: i32,
    pub apps_running: i32,
    pub apps_pending: i32,
    pub apps_completed: i32,
    pub apps_killed: i32,
    pub apps_failed: i32,
    pub aggregate_containers_preempted: i32,
    pub active_applications: i32,
    pub app_attempt_first_container_allocation_delay_num_ops: i32,
    pub app_attempt_first_container_allocation_delay_avg_time: f32,
}

/// Point-in-time telemetry of one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Unix timestamp (seconds) the snapshot describes.
    pub timestamp: u64,
    pub pending_containers: i32,
    pub allocated_containers: i32,
    pub pending_mb: i32,
    pub pending_vcores: i32,
    pub available_mb: i32,
    pub available_vcores: i32,
    pub allocated_mb: i32,
    pub allocated_vcores: i32,
    /// Cumulative containers allocated since cluster start.
    pub aggregate_containers_allocated: i32,
    /// Cumulative containers released since cluster start.
    pub aggregate_containers_released: i32,
    pub number_of_nodes: i32,
    /// Cost accrued so far, in dollars.
    pub cost: f32,
    #[serde(flatten)]
    pub yarn: YarnCounters,
}

// ── Autoscaler feedback ────────────────────────────────────────────

/// One training sample for the predictor: the cluster state before a
/// scaling action paired with the state observed after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub cluster: String,
    /// Node count when the action was decided.
    pub nodes: i32,
    pub scaling_factor: i32,
    pub performance_before: f32,
    pub metrics_before: MetricsSnapshot,
    pub performance_after: Option<f32>,
    pub metrics_after: Option<MetricsSnapshot>,
}

impl PolicyRecord {
    /// Open a record for a scaling decision taken on `metrics`.
    pub fn open(
        cluster: impl Into<String>,
        scaling_factor: i32,
        performance: f32,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            nodes: metrics.number_of_nodes,
            scaling_factor,
            performance_before: performance,
            metrics_before: metrics,
            performance_after: None,
            metrics_after: None,
        }
    }

    /// Attach the post-action observation.
    pub fn close(mut self, performance: f32, metrics: MetricsSnapshot) -> Self {
        self.performance_after = Some(performance);
        self.metrics_after = Some(metrics);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.metrics_after.is_some()
    }
}
