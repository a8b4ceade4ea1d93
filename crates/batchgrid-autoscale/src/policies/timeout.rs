//! Randomized timeout policy.
//!
//! Ignores load: once every `period` checks, while the cluster is below
//! `upper_bound_nodes`, it scales by a random step in `1..max_step`. Used
//! as a conservative grow-until-cap fallback and to explore the scaling
//! space for the predictor's training data.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use batchgrid_state::{MetricsSnapshot, WindowView};

use super::{DEFAULT_LOWER_BOUND_NODES, Policy, PolicyFuture, crosses_lower_bound};
use crate::error::{PolicyError, PolicyResult};
use crate::feedback::FeedbackRecorder;
use crate::predictor::Predictor;
use crate::stats::WorkloadStats;

pub(crate) const NAME: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Checks between two scaling actions.
    pub period: u32,
    /// No scaling at or above this node count.
    pub upper_bound_nodes: i32,
    /// Exclusive upper end of the random step.
    pub max_step: i32,
    /// Let the random step be negative half of the time.
    pub allow_negative: bool,
    pub lower_bound_nodes: i32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            period: 2,
            upper_bound_nodes: 50,
            max_step: 15,
            allow_negative: false,
            lower_bound_nodes: DEFAULT_LOWER_BOUND_NODES,
        }
    }
}

impl TimeoutConfig {
    pub(crate) fn validate(&self) -> PolicyResult<()> {
        if self.max_step < 2 {
            return Err(PolicyError::InvalidSetting {
                policy: NAME,
                reason: format!("max_step must be at least 2, got {}", self.max_step),
            });
        }
        Ok(())
    }
}

pub struct TimeoutPolicy {
    config: TimeoutConfig,
    countdown: u32,
    rng: StdRng,
    feedback: FeedbackRecorder,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutConfig, cluster: &str, predictor: Option<Arc<dyn Predictor>>) -> Self {
        Self::with_rng(config, cluster, predictor, StdRng::from_entropy())
    }

    /// Build with an explicit random source.
    pub fn with_rng(
        config: TimeoutConfig,
        cluster: &str,
        predictor: Option<Arc<dyn Predictor>>,
        rng: StdRng,
    ) -> Self {
        Self {
            countdown: config.period,
            config,
            rng,
            feedback: FeedbackRecorder::new(cluster, predictor),
        }
    }

    fn random_step(&mut self) -> i32 {
        let step = self.rng.gen_range(1..self.config.max_step.max(2));
        if self.config.allow_negative && self.rng.gen_bool(0.5) {
            -step
        } else {
            step
        }
    }

    fn decide(&mut self, window: &WindowView<MetricsSnapshot>) -> i32 {
        let (Some(stats), Some(last)) = (WorkloadStats::from_window(window), window.last()) else {
            return 0;
        };
        let performance = stats.performance();
        self.feedback.close(performance, last);

        let mut delta = 0;
        let headroom = self
            .config
            .upper_bound_nodes
            .saturating_sub(last.number_of_nodes);
        if self.countdown == 0 && headroom > 0 {
            // Never grow past the upper bound.
            delta = self.random_step().min(headroom);
            self.countdown = self.config.period;
        }
        self.countdown = self.countdown.saturating_sub(1);

        if crosses_lower_bound(last.number_of_nodes, delta, self.config.lower_bound_nodes) {
            delta = 0;
        }
        debug!(delta, countdown = self.countdown, "timeout decision");

        self.feedback.open(delta, performance, last);
        delta
    }
}

impl Policy for TimeoutPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply<'a>(&'a mut self, window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a> {
        let delta = self.decide(window);
        Box::pin(async move { delta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(nodes: i32) -> WindowView<MetricsSnapshot> {
        WindowView::from_values((0..2).map(|_| MetricsSnapshot {
            number_of_nodes: nodes,
            ..Default::default()
        }))
    }

    fn policy(config: TimeoutConfig) -> TimeoutPolicy {
        TimeoutPolicy::with_rng(config, "c1", None, StdRng::seed_from_u64(7))
    }

    #[tokio::test]
    async fn scales_once_per_period() {
        let mut p = policy(TimeoutConfig::default());
        let w = window(4);
        let mut deltas = Vec::new();
        for _ in 0..8 {
            deltas.push(p.apply(&w).await);
        }
        let active: Vec<_> = deltas.iter().map(|d| *d != 0).collect();
        assert_eq!(
            active,
            vec![false, false, true, false, true, false, true, false]
        );
        assert!(deltas.iter().all(|d| (0..15).contains(d)));
    }

    #[tokio::test]
    async fn stops_at_upper_bound() {
        let mut p = policy(TimeoutConfig::default());
        let w = window(50);
        for _ in 0..6 {
            assert_eq!(p.apply(&w).await, 0);
        }
        // Scaling resumes as soon as the cluster drops below the bound.
        assert_ne!(p.apply(&window(49)).await, 0);
    }

    #[tokio::test]
    async fn growth_is_capped_at_upper_bound() {
        let mut p = policy(TimeoutConfig {
            period: 0,
            ..Default::default()
        });
        for _ in 0..50 {
            assert_eq!(p.apply(&window(49)).await, 1);
        }
        for _ in 0..50 {
            let delta = p.apply(&window(45)).await;
            assert!((1..=5).contains(&delta));
        }
    }

    #[tokio::test]
    async fn negative_steps_respect_lower_bound() {
        let mut p = policy(TimeoutConfig {
            period: 0,
            allow_negative: true,
            lower_bound_nodes: 3,
            ..Default::default()
        });
        let w = window(3);
        for _ in 0..50 {
            assert!(p.apply(&w).await >= 0);
        }
    }

    #[tokio::test]
    async fn positive_only_by_default() {
        let mut p = policy(TimeoutConfig {
            period: 0,
            ..Default::default()
        });
        let w = window(10);
        for _ in 0..50 {
            let delta = p.apply(&w).await;
            assert!((1..15).contains(&delta));
        }
    }

    #[tokio::test]
    async fn empty_window_is_no_decision() {
        let mut p = policy(TimeoutConfig {
            period: 0,
            ..Default::default()
        });
        let w = WindowView::from_values(Vec::<MetricsSnapshot>::new());
        assert_eq!(p.apply(&w).await, 0);
    }
}
