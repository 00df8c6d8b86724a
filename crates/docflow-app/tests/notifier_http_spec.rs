use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use docflow_app::config::{AuthScheme, DownstreamConfig};
use docflow_app::services::notifier::MAX_RESPONSE_BODY_BYTES;
use docflow_app::services::{
    DocStatus, HttpNotifier, NotificationPayload, Notifier, NotifyError, Transient,
};

fn notifier_for(server: &MockServer, scheme: AuthScheme) -> HttpNotifier {
    let cfg = DownstreamConfig {
        api_url: format!("{}/status", server.uri()),
        api_key: Some("secret-token".into()),
        auth_scheme: scheme,
        request_timeout_secs: 5,
    };
    HttpNotifier::from_config(&cfg).expect("notifier from config")
}

fn payload() -> NotificationPayload {
    NotificationPayload {
        uid: Some("u-1".into()),
        doc_id: "A1".into(),
        file_name: "bucket.com/x/sample.pdf".into(),
        doc_status: DocStatus::Completed,
        extracted_details: Some(json!({"Invoice Total": "$10"})),
    }
}

#[tokio::test]
async fn api_key_scheme_sends_api_key_header_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .and(header("API-Key", "secret-token"))
        .and(body_json(json!({
            "uid": "u-1",
            "doc_id": "A1",
            "file_name": "bucket.com/x/sample.pdf",
            "doc_status": "completed",
            "extracted_details": {"Invoice Total": "$10"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = notifier_for(&server, AuthScheme::ApiKey)
        .notify(&payload())
        .await
        .expect("notification accepted");
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "{\"ok\":true}");
}

#[tokio::test]
async fn bearer_scheme_sends_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .and(header("Authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = notifier_for(&server, AuthScheme::Bearer)
        .notify(&payload())
        .await
        .expect("notification accepted");
    assert_eq!(outcome.status, 204);
}

#[tokio::test]
async fn unavailable_downstream_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = notifier_for(&server, AuthScheme::ApiKey)
        .notify(&payload())
        .await
        .expect_err("503");
    assert!(err.is_transient());
    assert_eq!(err.status_code(), Some(503));
}

#[tokio::test]
async fn rejected_payload_is_terminal_and_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("missing doc_id"))
        .mount(&server)
        .await;

    let err = notifier_for(&server, AuthScheme::ApiKey)
        .notify(&payload())
        .await
        .expect_err("400");
    assert!(!err.is_transient());
    match err {
        NotifyError::HttpStatus { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "missing doc_id");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn oversized_error_body_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("x".repeat(100_000)))
        .mount(&server)
        .await;

    let err = notifier_for(&server, AuthScheme::ApiKey)
        .notify(&payload())
        .await
        .expect_err("422");
    match err {
        NotifyError::HttpStatus { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body.len(), MAX_RESPONSE_BODY_BYTES);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
