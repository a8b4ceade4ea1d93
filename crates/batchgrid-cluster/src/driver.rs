//! Platform contracts.
//!
//! A [`ClusterDriver`] talks to one concrete cluster on one platform. A
//! [`ClusterProvisioner`] builds handles around drivers, either for a fresh
//! cluster or for one that already exists and has just been rediscovered
//! through its heartbeats. Both are injected, so tests and the local
//! platform plug in the same way a cloud backend would.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use batchgrid_state::{Job, JobStatus, Platform};

use crate::error::ClusterResult;
use crate::handle::ClusterHandle;

/// Boxed future returned by driver and provisioner calls.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = ClusterResult<T>> + Send + 'a>>;

/// Shape of a cluster to allocate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Fixed worker nodes.
    pub workers: i32,
    /// Elastic nodes at creation.
    pub elastic_nodes: i32,
    /// Elastic nodes never scale below this.
    pub min_elastic_nodes: i32,
    /// Request the high-performance machine type.
    pub high_performance: bool,
    /// Metrics snapshots kept per cluster.
    pub window_capacity: usize,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            workers: 2,
            elastic_nodes: 0,
            min_elastic_nodes: 0,
            high_performance: false,
            window_capacity: batchgrid_state::DEFAULT_METRICS_CAPACITY,
        }
    }
}

impl ClusterSpec {
    pub fn with_high_performance(mut self, high_performance: bool) -> Self {
        self.high_performance = high_performance;
        self
    }
}

/// Platform-reported progress of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    /// Accepted or executing.
    Running,
    Completed,
    /// Errored or cancelled.
    Failed,
}

impl JobProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobProgress::Running)
    }

    pub fn as_status(&self) -> JobStatus {
        match self {
            JobProgress::Running => JobStatus::Running,
            JobProgress::Completed => JobStatus::Completed,
            JobProgress::Failed => JobStatus::Failed,
        }
    }
}

/// Operations a platform performs on one cluster.
pub trait ClusterDriver: Send + Sync {
    /// Create the physical resources backing the cluster.
    fn allocate_resources<'a>(&'a self, spec: &'a ClusterSpec) -> DriverFuture<'a, ()>;

    /// Delete the physical resources.
    fn free_resources(&self) -> DriverFuture<'_, ()>;

    /// Submit a job; returns the platform's identifier for it.
    fn submit_job<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, String>;

    /// Add (`delta > 0`) or remove (`delta < 0`) elastic nodes.
    /// Returns true when no elastic capacity is left afterwards.
    fn scale(&self, delta: i32) -> DriverFuture<'_, bool>;

    /// Query the platform for a submitted job.
    fn job_status<'a>(&'a self, job: &'a Job) -> DriverFuture<'a, JobProgress>;
}

/// Builds cluster handles for one or more platforms.
pub trait ClusterProvisioner: Send + Sync {
    /// Build a handle for a new cluster. Resources are not allocated yet.
    fn create<'a>(&'a self, name: &'a str, spec: &'a ClusterSpec)
    -> DriverFuture<'a, ClusterHandle>;

    /// Rebuild a handle for a running cluster known only by name.
    /// `Ok(None)` means the platform does not know the cluster.
    fn recover<'a>(
        &'a self,
        name: &'a str,
        platform: Platform,
    ) -> DriverFuture<'a, Option<ClusterHandle>>;
}
