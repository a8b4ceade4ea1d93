//! batchgrid-autoscale — elastic scaling for batch clusters.
//!
//! Each registered cluster gets one [`Autoscaler`] loop bound to one
//! [`Policy`]. Policies read the cluster's metrics window and return a node
//! delta (positive adds nodes). Feedback-driven policies pair each action
//! with the metrics that followed and ship the pair to the [`Predictor`].
//!
//! # Architecture
//!
//! ```text
//! MetricsWindow ──snapshot──▶ Policy::apply ──delta──▶ ClusterHandle::scale
//!                                │
//!                                ├── ExpWorkloadPolicy   (doubling steps)
//!                                ├── TimeoutPolicy       (random periodic)
//!                                ├── MlPolicy            (asks Predictor)
//!                                └── ProportionalPolicy  (sized from load)
//!
//! FeedbackRecorder ──PolicyRecord──▶ Predictor::collect_autoscaler_data
//! ```

pub mod error;
pub mod feedback;
pub mod policies;
pub mod predictor;
pub mod scaler;
pub mod stats;

pub use error::{PolicyError, PolicyResult, PredictorError, PredictorResult};
pub use feedback::FeedbackRecorder;
pub use policies::{
    DEFAULT_LOWER_BOUND_NODES, ExpWorkloadConfig, ExpWorkloadPolicy, MlConfig, MlPolicy, Policy,
    PolicyFuture, PolicySpec, ProportionalConfig, ProportionalPolicy, TimeoutConfig,
    TimeoutPolicy,
};
pub use predictor::{HttpPredictor, Prediction, PredictionRequest, Predictor, PredictorFuture};
pub use scaler::{Autoscaler, AutoscalerConfig, AutoscalerHandle};
pub use stats::WorkloadStats;
