//! Error types for policies and the predictor client.

use thiserror::Error;

/// Result type alias for predictor calls.
pub type PredictorResult<T> = Result<T, PredictorError>;

/// Result type alias for policy construction.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors raised while talking to the predictor service.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("invalid predictor endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("predictor connection failed: {0}")]
    Connect(String),

    #[error("predictor request failed: {0}")]
    Request(String),

    #[error("predictor returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("predictor request timed out")]
    Timeout,

    #[error("failed to encode predictor request: {0}")]
    Encode(String),

    #[error("failed to decode predictor response: {0}")]
    Decode(String),
}

/// Errors raised while building a policy from its spec.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy {0} requires a predictor")]
    MissingPredictor(&'static str),

    #[error("invalid {policy} setting: {reason}")]
    InvalidSetting {
        policy: &'static str,
        reason: String,
    },
}
