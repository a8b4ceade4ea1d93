//! batchgrid-heartbeat — telemetry ingestion.
//!
//! Cluster agents send one JSON heartbeat per UDP datagram. The receiver
//! feeds each into the matching cluster's metrics window and adopts
//! clusters it has never seen, so a restarted control plane picks up the
//! clusters that are still running.
//!
//! ```text
//! UDP ──▶ HeartbeatMessage::decode ──▶ Pool::get_cluster
//!                                        ├── found   ▶ add_metrics_snapshot
//!                                        └── missing ▶ ClusterProvisioner::recover
//!                                                       ▶ reattach running jobs
//!                                                       ▶ register + JobMonitor
//! ```

pub mod error;
pub mod message;
pub mod receiver;

pub use error::{HeartbeatError, HeartbeatResult};
pub use message::HeartbeatMessage;
pub use receiver::{HeartbeatReceiver, Ingest, MAX_DATAGRAM};
