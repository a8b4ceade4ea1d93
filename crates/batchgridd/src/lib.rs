//! batchgridd — the batchgrid resource-control plane.
//!
//! ```text
//! batchgridd.toml ─▶ DaemonConfig ─▶ ControlPlane::start
//!                                      ├── StateStore (redb)
//!                                      ├── HttpPredictor
//!                                      ├── LocalProvisioner
//!                                      ├── Pool ◀── liveliness loop
//!                                      ├── HeartbeatReceiver (UDP)
//!                                      └── SubmissionIntake ─▶ Scheduler ─▶ Submitter
//! ```

pub mod config;
pub mod control_plane;

pub use config::DaemonConfig;
pub use control_plane::{ControlPlane, run};
