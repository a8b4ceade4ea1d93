//! Heartbeat ingestion error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("failed to bind heartbeat socket {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("malformed heartbeat: {0}")]
    Decode(String),

    #[error("state store error: {0}")]
    State(#[from] batchgrid_state::StateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] batchgrid_cluster::ClusterError),

    #[error("policy error: {0}")]
    Policy(#[from] batchgrid_autoscale::PolicyError),
}

pub type HeartbeatResult<T> = Result<T, HeartbeatError>;
