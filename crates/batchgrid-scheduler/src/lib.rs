//! batchgrid-scheduler — priority batching of jobs onto new clusters.
//!
//! # Architecture
//!
//! ```text
//! SubmissionIntake::submit(JobRequest)
//!   ├── Predictor (duration, failure probability)
//!   ├── StateStore (job persisted Pending)
//!   └── Scheduler::schedule_job
//!         ├── level 0..n: Mutex<Vec<PriorityBin>> ◀── flush loop per level
//!         └── fast path ──────────────┐
//!                                     ▼
//!                     Deployer (Submitter) ── one cluster per bin
//! ```

pub mod deploy;
pub mod error;
pub mod intake;
pub mod scheduler;

pub use deploy::{DeployFuture, Deployer};
pub use error::{SchedulerError, SchedulerResult};
pub use intake::{JobRequest, SubmissionIntake};
pub use scheduler::{Admission, LevelConfig, PackingPolicy, PriorityBin, Scheduler};
