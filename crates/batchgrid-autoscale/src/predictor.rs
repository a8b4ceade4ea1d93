//! Predictor contract and its HTTP client.
//!
//! The predictor is an external service that estimates job durations and
//! recommends scaling factors. It learns from [`PolicyRecord`]s that the
//! feedback-driven policies send back after every scaling action.
//!
//! [`HttpPredictor`] speaks JSON over plain HTTP/1.1:
//!
//! ```text
//! POST /predictions       PredictionRequest  → Prediction
//! POST /autoscaler-data   PolicyRecord       → 2xx
//! GET  /healthz                              → 2xx
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use batchgrid_state::{MetricsSnapshot, PolicyRecord};

use crate::error::{PredictorError, PredictorResult};

/// Boxed future returned by predictor calls.
pub type PredictorFuture<'a, T> = Pin<Box<dyn Future<Output = PredictorResult<T>> + Send + 'a>>;

/// Input of a prediction. Job fields are empty when the request comes from
/// an autoscaling policy rather than from job admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub executable_path: String,
    pub args: String,
    pub metrics: MetricsSnapshot,
    pub performance: f32,
}

impl PredictionRequest {
    /// Request for a job about to be scheduled.
    pub fn for_job(executable_path: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
            args: args.into(),
            ..Default::default()
        }
    }

    /// Request for a scaling recommendation.
    pub fn for_scaling(metrics: MetricsSnapshot, performance: f32) -> Self {
        Self {
            metrics,
            performance,
            ..Default::default()
        }
    }
}

/// Predictor output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prediction {
    /// Predicted job duration in seconds.
    pub duration: i64,
    pub failure_probability: f32,
    pub label: String,
    /// Recommended node delta.
    pub scaling_factor: i32,
}

/// External prediction service.
pub trait Predictor: Send + Sync {
    fn request_prediction<'a>(
        &'a self,
        request: &'a PredictionRequest,
    ) -> PredictorFuture<'a, Prediction>;

    /// Submit one before/after training sample.
    fn collect_autoscaler_data<'a>(&'a self, record: &'a PolicyRecord) -> PredictorFuture<'a, ()>;
}

/// JSON-over-HTTP predictor client.
#[derive(Debug, Clone)]
pub struct HttpPredictor {
    /// `host:port` of the predictor service.
    endpoint: String,
    timeout: Duration,
}

impl HttpPredictor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> PredictorResult<Self> {
        let endpoint = endpoint.into();
        let endpoint = endpoint
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        if endpoint.is_empty() || endpoint.contains('/') {
            return Err(PredictorError::InvalidEndpoint(endpoint));
        }
        Ok(Self { endpoint, timeout })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Probe `GET /healthz`.
    pub async fn health(&self) -> PredictorResult<()> {
        self.call(http::Method::GET, "/healthz", None).await?;
        Ok(())
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> PredictorResult<Bytes> {
        let payload = serde_json::to_vec(body).map_err(|e| PredictorError::Encode(e.to_string()))?;
        self.call(http::Method::POST, path, Some(payload)).await
    }

    async fn call(
        &self,
        method: http::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> PredictorResult<Bytes> {
        let uri = format!("http://{}{path}", self.endpoint);
        tokio::time::timeout(self.timeout, self.exchange(method, &uri, body))
            .await
            .map_err(|_| PredictorError::Timeout)?
    }

    async fn exchange(
        &self,
        method: http::Method,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> PredictorResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| PredictorError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| PredictorError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", &self.endpoint)
            .header("user-agent", "batchgrid/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| PredictorError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| PredictorError::Request(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| PredictorError::Request(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(PredictorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        debug!(%uri, %status, len = bytes.len(), "predictor call complete");
        Ok(bytes)
    }
}

impl Predictor for HttpPredictor {
    fn request_prediction<'a>(
        &'a self,
        request: &'a PredictionRequest,
    ) -> PredictorFuture<'a, Prediction> {
        Box::pin(async move {
            let bytes = self.post_json("/predictions", request).await?;
            serde_json::from_slice(&bytes).map_err(|e| PredictorError::Decode(e.to_string()))
        })
    }

    fn collect_autoscaler_data<'a>(&'a self, record: &'a PolicyRecord) -> PredictorFuture<'a, ()> {
        Box::pin(async move {
            self.post_json("/autoscaler-data", record).await?;
            Ok(())
        })
    }
}
