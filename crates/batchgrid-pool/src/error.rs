//! Pool error types.

use thiserror::Error;

/// Errors from registry, deployment, and teardown operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("deployment has no jobs")]
    EmptyDeployment,

    #[error("cluster not registered: {0}")]
    UnknownCluster(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] batchgrid_cluster::ClusterError),

    #[error("state store error: {0}")]
    State(#[from] batchgrid_state::StateError),

    #[error("policy error: {0}")]
    Policy(#[from] batchgrid_autoscale::PolicyError),
}

pub type PoolResult<T> = Result<T, PoolError>;
