//! batchgrid-pool — the registry of live clusters and their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! Submitter::deploy(jobs)
//!   ├── ClusterProvisioner::create + allocate
//!   ├── Pool::add_cluster(handle, Autoscaler)
//!   ├── ClusterHandle::submit_job (each)
//!   ├── StateStore (jobs + cluster)
//!   └── JobMonitor ──all jobs done──▶ free ▶ Closed ▶ Pool::remove_cluster
//!
//! Pool
//!   └── name → { Arc<ClusterHandle>, AutoscalerHandle, MonitorHandle }
//!         ▲
//!         └── liveliness loop: evict when now - last heartbeat > timeout
//! ```

pub mod error;
pub mod monitor;
pub mod registry;
pub mod submitter;

pub use error::{PoolError, PoolResult};
pub use monitor::{JobMonitor, MonitorHandle, MonitorPass};
pub use registry::Pool;
pub use submitter::{Submitter, random_cluster_name};
