//! Scaling policies.
//!
//! A policy turns a cluster's metrics window into a node delta: positive
//! adds nodes, negative removes them, zero holds. Policies keep their own
//! state between invocations (exponential step, countdown, open feedback
//! record) and only ever read the window.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use batchgrid_state::{MetricsSnapshot, WindowView};

use crate::error::PolicyResult;
use crate::predictor::Predictor;

pub mod exp_workload;
pub mod ml;
pub mod proportional;
pub mod timeout;

pub use exp_workload::{ExpWorkloadConfig, ExpWorkloadPolicy};
pub use ml::{MlConfig, MlPolicy};
pub use proportional::{ProportionalConfig, ProportionalPolicy};
pub use timeout::{TimeoutConfig, TimeoutPolicy};

/// Boxed future returned by [`Policy::apply`].
pub type PolicyFuture<'a> = Pin<Box<dyn Future<Output = i32> + Send + 'a>>;

/// A scaling strategy.
pub trait Policy: Send {
    fn name(&self) -> &'static str;

    /// Decide the node delta for the current window.
    fn apply<'a>(&'a mut self, window: &'a WindowView<MetricsSnapshot>) -> PolicyFuture<'a>;
}

/// Node count floor that policies never scale below.
pub const DEFAULT_LOWER_BOUND_NODES: i32 = 2;

/// Whether applying `delta` to `nodes` would cross `lower_bound`.
pub(crate) fn crosses_lower_bound(nodes: i32, delta: i32, lower_bound: i32) -> bool {
    delta < 0 && nodes + delta < lower_bound
}

/// Serializable policy selection, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySpec {
    ExpWorkload(ExpWorkloadConfig),
    Timeout(TimeoutConfig),
    Ml(MlConfig),
    Proportional(ProportionalConfig),
}

impl Default for PolicySpec {
    fn default() -> Self {
        PolicySpec::ExpWorkload(ExpWorkloadConfig::default())
    }
}

impl PolicySpec {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicySpec::ExpWorkload(_) => exp_workload::NAME,
            PolicySpec::Timeout(_) => timeout::NAME,
            PolicySpec::Ml(_) => ml::NAME,
            PolicySpec::Proportional(_) => proportional::NAME,
        }
    }

    /// Check settings without building anything.
    pub fn validate(&self) -> PolicyResult<()> {
        match self {
            PolicySpec::ExpWorkload(c) => c.validate(),
            PolicySpec::Timeout(c) => c.validate(),
            PolicySpec::Ml(c) => c.validate(),
            PolicySpec::Proportional(c) => c.validate(),
        }
    }

    /// Build a fresh policy instance for `cluster`.
    pub fn build(
        &self,
        cluster: &str,
        predictor: Option<Arc<dyn Predictor>>,
    ) -> PolicyResult<Box<dyn Policy>> {
        self.validate()?;
        let policy: Box<dyn Policy> = match self {
            PolicySpec::ExpWorkload(c) => {
                Box::new(ExpWorkloadPolicy::new(c.clone(), cluster, predictor))
            }
            PolicySpec::Timeout(c) => Box::new(TimeoutPolicy::new(c.clone(), cluster, predictor)),
            PolicySpec::Ml(c) => {
                let predictor =
                    predictor.ok_or(crate::error::PolicyError::MissingPredictor(ml::NAME))?;
                Box::new(MlPolicy::new(c.clone(), cluster, predictor))
            }
            PolicySpec::Proportional(c) => Box::new(ProportionalPolicy::new(c.clone())),
        };
        Ok(policy)
    }
}
