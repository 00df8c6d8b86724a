use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use strum::AsRefStr;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ExtractionConfig;
use crate::services::normalize::normalize_response;
use crate::services::retry::Transient;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OPERATION_LOCATION_HEADER: &str = "Operation-Location";

type ExtractionRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Document kinds accepted for extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Jpeg,
    Png,
}

impl DocumentKind {
    /// Detect the kind from the file extension (case-insensitive).
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (_, ext) = file_name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ExtractionError {
    #[error("unsupported file type for `{file_name}`; expected pdf, jpeg, jpg or png")]
    InvalidInput { file_name: String },
    #[error("invalid extraction endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("request error during `{stage}`: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("unexpected HTTP status {status} during `{stage}`")]
    HttpStatus { stage: &'static str, status: u16 },
    #[error("extraction service accepted the document without an Operation-Location header")]
    MissingOperationLocation,
    #[error("extraction did not finish after {polls} polls")]
    PollTimeout { polls: u32 },
}

impl ExtractionError {
    pub fn request(stage: &'static str, error: reqwest::Error) -> Self {
        Self::Request {
            stage,
            source: Arc::new(error),
        }
    }
}

impl Transient for ExtractionError {
    fn is_transient(&self) -> bool {
        match self {
            ExtractionError::Request { .. } | ExtractionError::PollTimeout { .. } => true,
            ExtractionError::HttpStatus { status, .. } => is_transient_status(*status),
            ExtractionError::InvalidInput { .. }
            | ExtractionError::InvalidEndpoint(_)
            | ExtractionError::MissingOperationLocation => false,
        }
    }
}

/// 408, 429 and 5xx are worth another attempt.
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Turns document bytes into a structured result.
///
/// `Ok(None)` means the service answered but produced nothing usable
/// (failed analysis, malformed body); callers record that as `failed`.
#[async_trait::async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(&self, file_name: &str, data: Bytes) -> Result<Option<Value>, ExtractionError>;
}

/// Client for an asynchronous analyze-style HTTP service: submit, then poll
/// `Operation-Location` until the analysis finishes.
pub struct HttpExtractionClient {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
    limiter: Arc<ExtractionRateLimiter>,
}

impl HttpExtractionClient {
    pub fn from_config(cfg: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let endpoint = Url::parse(&cfg.endpoint)
            .map_err(|_| ExtractionError::InvalidEndpoint(cfg.endpoint.clone()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .user_agent("docflow-extraction/0.1")
            .build()
            .map_err(|err| ExtractionError::request("build_client", err))?;
        let rps = NonZeroU32::new(cfg.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.api_key.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            max_polls: cfg.max_polls.max(1),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => request.header(SUBSCRIPTION_KEY_HEADER, key),
            None => request,
        }
    }

    async fn submit(&self, kind: DocumentKind, data: Bytes) -> Result<Submitted, ExtractionError> {
        let stage = "submit";
        self.limiter.until_ready().await;
        let response = self
            .with_key(self.http.post(self.endpoint.clone()))
            .header(header::CONTENT_TYPE, kind.mime_type())
            .body(data)
            .send()
            .await
            .map_err(|err| ExtractionError::request(stage, err))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            let location = response
                .headers()
                .get(OPERATION_LOCATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or(ExtractionError::MissingOperationLocation)?;
            let url = self
                .endpoint
                .join(location)
                .map_err(|_| ExtractionError::MissingOperationLocation)?;
            return Ok(Submitted::Pending(url));
        }
        if !status.is_success() {
            return Err(ExtractionError::HttpStatus {
                stage,
                status: status.as_u16(),
            });
        }
        let payload = response
            .bytes()
            .await
            .map_err(|err| ExtractionError::request(stage, err))?;
        Ok(Submitted::Done(parse_body(&payload)))
    }

    async fn poll(&self, operation: &Url) -> Result<Option<Value>, ExtractionError> {
        let stage = "poll";
        for attempt in 1..=self.max_polls {
            self.limiter.until_ready().await;
            let response = self
                .with_key(self.http.get(operation.clone()))
                .send()
                .await
                .map_err(|err| ExtractionError::request(stage, err))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ExtractionError::HttpStatus {
                    stage,
                    status: status.as_u16(),
                });
            }
            let payload = response
                .bytes()
                .await
                .map_err(|err| ExtractionError::request(stage, err))?;
            let Some(body) = parse_body(&payload) else {
                warn!(attempt, "extraction poll returned a malformed body");
                return Ok(None);
            };

            match analysis_state(&body) {
                AnalysisState::Succeeded => return Ok(normalize_response(&body)),
                AnalysisState::Failed => {
                    warn!(attempt, "extraction service reported a failed analysis");
                    return Ok(None);
                }
                AnalysisState::Running => {
                    debug!(attempt, max = self.max_polls, "extraction still running");
                }
            }
            if attempt < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(ExtractionError::PollTimeout {
            polls: self.max_polls,
        })
    }
}

enum Submitted {
    Pending(Url),
    Done(Option<Value>),
}

#[derive(Debug, PartialEq, Eq)]
enum AnalysisState {
    Running,
    Succeeded,
    Failed,
}

fn analysis_state(body: &Value) -> AnalysisState {
    if body.get("analyzeResult").is_some() {
        return AnalysisState::Succeeded;
    }
    match body.get("status").and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("succeeded") => AnalysisState::Succeeded,
        Some(s) if s.eq_ignore_ascii_case("failed") => AnalysisState::Failed,
        _ => AnalysisState::Running,
    }
}

fn parse_body(payload: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(payload).ok()
}

#[async_trait::async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract(&self, file_name: &str, data: Bytes) -> Result<Option<Value>, ExtractionError> {
        let kind =
            DocumentKind::from_file_name(file_name).ok_or_else(|| ExtractionError::InvalidInput {
                file_name: file_name.to_string(),
            })?;
        debug!(file_name, kind = kind.as_ref(), bytes = data.len(), "submitting document");

        match self.submit(kind, data).await? {
            Submitted::Done(Some(body)) => {
                if analysis_state(&body) == AnalysisState::Failed {
                    return Ok(None);
                }
                Ok(normalize_response(&body))
            }
            Submitted::Done(None) => {
                warn!(file_name, "extraction service returned a malformed body");
                Ok(None)
            }
            Submitted::Pending(operation) => self.poll(&operation).await,
        }
    }
}
