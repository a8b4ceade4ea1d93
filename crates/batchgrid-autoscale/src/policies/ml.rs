//! Prediction-driven policy.
//!
//! Computes the same performance score as the workload policies and, when
//! its magnitude exceeds `trigger`, asks the predictor for a node delta.
//! Every action it takes is paired with the observation that follows and
//! fed back to the predictor as a training sample.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use batchgrid_state::{MetricsSnapshot, WindowView};

use super::{DEFAULT_LOWER_BOUND_NODES, Policy, PolicyFuture, crosses_lower_bound};
use crate::error::{PolicyError, PolicyResult};
use crate::feedback::FeedbackRecorder;
use crate::predictor::{PredictionRequest, Predictor};
use crate::stats::WorkloadStats;

pub(crate) const NAME: &str = "ml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Ask the predictor only when `|performance|` exceeds this.
    pub trigger: f32,
    pub lower_bound_nodes: i32,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            trigger: 6.0,
            lower_bound_nodes: DEFAULT_LOWER_BOUND_NODES,
        }
    }
}

impl MlConfig {
    pub(crate) fn validate(&self) -> PolicyResult<()> {
        if !self.trigger.is_finite() || self.trigger < 0.0 {
            return Err(PolicyError::InvalidSetting {
                policy: NAME,
                reason: format!("trigger must be a non-negative number, got {}", self.trigger),
            });
        }
        Ok(())
    }
}

pub struct MlPolicy {
    config: MlConfig,
    predictor: Arc<dyn Predictor>,
    feedback: FeedbackRecorder,
}

impl MlPolicy {
    pub fn new(config: MlConfig, cluster: &str, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            config,
            feedback: FeedbackRecorder::new(cluster, Some(Arc::clone(&predictor))),
            predictor,
        }
    }

    async fn decide(&mut self, window: &WindowView<MetricsSnapshot>) -> i32 {
        let (Some(stats), Some(last)) = (WorkloadStats::from_window(window), window.last()) else {
            return 0;
        };
        let performance = stats.performance();
        self.feedback.close(performance, last);

        let mut delta = 0;
        if performance.abs() > self.config.trigger {
            let request = PredictionRequest::for_scaling(last.clone(), performance);
            match self.predictor.request_prediction(&request).await {
                Ok(prediction) => delta = prediction.scaling_factor,
                Err(e) => error!(error = %e, "scaling prediction failed"),
            }
        }
        if crosses_lower_bound(last.number_of_nodes, delta, self.config.lower_bound_nodes) {
            delta = 0;
        }
        debug!(performance, delta, "ml decision");

        self.feedback.open(delta, performance, last);
        delta
    }
}

impl Policy for MlPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply<'a>(&'a mut self, window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a> {
        Box::pin(self.decide(window))
    }
}
