//! Error types for cluster drivers and provisioners.

use thiserror::Error;

use batchgrid_state::JobId;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by a platform driver or provisioner.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to allocate cluster {cluster}: {reason}")]
    Allocate { cluster: String, reason: String },

    #[error("failed to free cluster {cluster}: {reason}")]
    Free { cluster: String, reason: String },

    #[error("failed to submit job {job} to {cluster}: {reason}")]
    Submit {
        cluster: String,
        job: JobId,
        reason: String,
    },

    #[error("failed to scale {cluster}: {reason}")]
    Scale { cluster: String, reason: String },

    #[error("job {job} is unknown to the platform")]
    UnknownJob { job: JobId },

    #[error("provisioning error: {0}")]
    Provision(String),

    #[error("cluster {0} is closed")]
    Closed(String),
}
