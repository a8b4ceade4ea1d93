//! batchgrid-state — shared domain model and persistence for batchgrid.
//!
//! Holds the types every control loop agrees on (jobs, clusters, metrics
//! snapshots, autoscaler feedback records), the concurrency-safe
//! [`ConcurrentWindow`] that backs per-cluster metrics history and job
//! lists, and the [`StateStore`] used to persist jobs and clusters.
//!
//! # Architecture
//!
//! ```text
//! types    ── Job, ClusterRecord, MetricsSnapshot, PolicyRecord
//! window   ── ConcurrentWindow<T> (bounded FIFO, tombstones + compaction)
//! store    ── StateStore (redb, JSON values)
//!   ├── jobs      keyed by zero-padded job id
//!   ├── clusters  keyed by cluster name
//!   └── meta      counters (job id sequence)
//! ```

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod window;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
pub use window::{
    ConcurrentWindow, DEFAULT_METRICS_CAPACITY, JobList, MetricsWindow, WindowEntry, WindowView,
};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
