//! Before/after scaling samples for the predictor.
//!
//! A policy opens a [`PolicyRecord`] when it decides a non-zero delta and
//! closes it on its next invocation with data, attaching the metrics and
//! performance observed after the action. Closed records are shipped to
//! the predictor from a detached task so a slow predictor never delays a
//! scaling decision. At most one record is open at a time.

use std::sync::Arc;

use tracing::{debug, warn};

use batchgrid_state::{MetricsSnapshot, PolicyRecord};

use crate::predictor::Predictor;

pub struct FeedbackRecorder {
    cluster: String,
    predictor: Option<Arc<dyn Predictor>>,
    open: Option<PolicyRecord>,
}

impl FeedbackRecorder {
    /// A recorder that keeps no records when `predictor` is `None`.
    pub fn new(cluster: impl Into<String>, predictor: Option<Arc<dyn Predictor>>) -> Self {
        Self {
            cluster: cluster.into(),
            predictor,
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Close the open record, if any, and submit it.
    pub fn close(&mut self, performance: f32, metrics: &MetricsSnapshot) {
        let Some(record) = self.open.take() else {
            return;
        };
        let Some(predictor) = self.predictor.clone() else {
            return;
        };
        let record = record.close(performance, metrics.clone());
        debug!(
            cluster = %self.cluster,
            factor = record.scaling_factor,
            before = record.performance_before,
            after = performance,
            "submitting scaling sample"
        );
        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = predictor.collect_autoscaler_data(&record).await {
                warn!(%cluster, error = %e, "failed to submit scaling sample");
            }
        });
    }

    /// Open a record for `delta` unless one is already open or `delta` is 0.
    pub fn open(&mut self, delta: i32, performance: f32, metrics: &MetricsSnapshot) {
        if delta == 0 || self.open.is_some() || self.predictor.is_none() {
            return;
        }
        self.open = Some(PolicyRecord::open(
            self.cluster.clone(),
            delta,
            performance,
            metrics.clone(),
        ));
    }
}
