//! batchgrid-cluster — cluster handles and platform drivers.
//!
//! A [`ClusterHandle`] is what the rest of batchgrid holds for a running
//! cluster: identity, node count, a bounded metrics window, the list of
//! attached jobs, and the platform driver that does the real work.
//!
//! # Architecture
//!
//! ```text
//! ClusterProvisioner ──create/recover──▶ ClusterHandle
//!                                          ├── MetricsWindow (bounded)
//!                                          ├── JobList (tombstoned)
//!                                          └── Box<dyn ClusterDriver>
//!                                                ├── LocalDriver (simulated)
//!                                                └── ... cloud drivers
//! ```

pub mod driver;
pub mod error;
pub mod handle;
pub mod local;

pub use driver::{ClusterDriver, ClusterProvisioner, ClusterSpec, DriverFuture, JobProgress};
pub use error::{ClusterError, ClusterResult};
pub use handle::ClusterHandle;
pub use local::{LocalDriver, LocalPlatformConfig, LocalProvisioner};
