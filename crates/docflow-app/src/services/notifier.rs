use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthScheme, DownstreamConfig};
use crate::services::extraction::is_transient_status;
use crate::services::retry::Transient;

const API_KEY_HEADER: &str = "API-Key";
/// Longest downstream body kept on a record, in bytes.
pub const MAX_RESPONSE_BODY_BYTES: usize = 2048;

/// Extraction outcome reported to the downstream workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Completed,
    Failed,
}

impl DocStatus {
    pub fn from_result(result: Option<&Value>) -> Self {
        if result.is_some() {
            DocStatus::Completed
        } else {
            DocStatus::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub uid: Option<String>,
    pub doc_id: String,
    pub file_name: String,
    pub doc_status: DocStatus,
    pub extracted_details: Option<Value>,
}

/// Successful (2xx) downstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error, Clone)]
pub enum NotifyError {
    #[error("invalid downstream url `{0}`")]
    InvalidUrl(String),
    #[error("downstream request failed: {source}")]
    Request {
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("downstream responded with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

impl NotifyError {
    /// HTTP status code, when the downstream answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NotifyError::HttpStatus { status, .. } => Some(*status),
            NotifyError::Request { source } => source.status().map(|s| s.as_u16()),
            NotifyError::InvalidUrl(_) => None,
        }
    }
}

impl Transient for NotifyError {
    fn is_transient(&self) -> bool {
        match self {
            NotifyError::Request { .. } => true,
            NotifyError::HttpStatus { status, .. } => is_transient_status(*status),
            NotifyError::InvalidUrl(_) => false,
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &NotificationPayload) -> Result<NotifyOutcome, NotifyError>;
}

/// POSTs notification payloads as JSON.
pub struct HttpNotifier {
    http: Client,
    url: url::Url,
    api_key: Option<String>,
    auth_scheme: AuthScheme,
}

impl HttpNotifier {
    pub fn from_config(cfg: &DownstreamConfig) -> Result<Self, NotifyError> {
        let url = url::Url::parse(&cfg.api_url)
            .map_err(|_| NotifyError::InvalidUrl(cfg.api_url.clone()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .user_agent("docflow-notifier/0.1")
            .build()
            .map_err(|err| NotifyError::Request {
                source: Arc::new(err),
            })?;
        Ok(Self {
            http,
            url,
            api_key: cfg.api_key.clone(),
            auth_scheme: cfg.auth_scheme,
        })
    }
}

#[async_trait::async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<NotifyOutcome, NotifyError> {
        let mut request = self
            .http
            .post(self.url.clone())
            .header(header::ACCEPT, "application/json")
            .json(payload);
        if let Some(key) = self.api_key.as_deref() {
            request = match self.auth_scheme {
                AuthScheme::ApiKey => request.header(API_KEY_HEADER, key),
                AuthScheme::Bearer => request.bearer_auth(key),
            };
        }

        let response = request.send().await.map_err(|err| NotifyError::Request {
            source: Arc::new(err),
        })?;
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => truncate_body(body),
            Err(err) => {
                warn!(
                    doc_id = %payload.doc_id,
                    status,
                    error = %err,
                    "failed to read downstream response body"
                );
                String::new()
            }
        };
        debug!(doc_id = %payload.doc_id, status, "downstream notified");

        if !(200..300).contains(&status) {
            return Err(NotifyError::HttpStatus { status, body });
        }
        Ok(NotifyOutcome { status, body })
    }
}

/// Cut `body` to at most `MAX_RESPONSE_BODY_BYTES`, on a char boundary.
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_BODY_BYTES {
        let mut end = MAX_RESPONSE_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        assert_eq!(truncate_body("short".into()), "short");
        // Two-byte chars after one ASCII byte: the byte limit falls mid-char.
        let long = format!("a{}", "ż".repeat(MAX_RESPONSE_BODY_BYTES));
        let cut = truncate_body(long);
        assert_eq!(cut.len(), MAX_RESPONSE_BODY_BYTES - 1);
        assert!(cut.ends_with('ż'));
    }
    #[test]
    fn payload_serializes_wire_shape() {
        let payload = NotificationPayload {
            uid: Some("u-1".into()),
            doc_id: "A1".into(),
            file_name: "sample.pdf".into(),
            doc_status: DocStatus::from_result(None),
            extracted_details: None,
        };
        assert_eq!(
            serde_json::to_value(&payload).expect("json"),
            json!({
                "uid": "u-1",
                "doc_id": "A1",
                "file_name": "sample.pdf",
                "doc_status": "failed",
                "extracted_details": null
            })
        );
    }

    #[test]
    fn status_codes_drive_retry_classification() {
        let err = |status| NotifyError::HttpStatus {
            status,
            body: String::new(),
        };
        assert!(err(503).is_transient());
        assert!(!err(400).is_transient());
        assert_eq!(err(400).status_code(), Some(400));
        assert!(!NotifyError::InvalidUrl("x".into()).is_transient());
    }
}
