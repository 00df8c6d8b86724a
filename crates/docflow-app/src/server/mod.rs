//! Status HTTP surface: health, processing records, and checkpoints.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

use crate::config::AppConfig;
use crate::events::{CheckpointState, CheckpointStore};
use crate::services::records::{ProcessingRecord, RecordStore};

pub const HEALTHZ_PATH: &str = "/v1/healthz";
pub const DOCUMENT_PATH: &str = "/v1/documents/{document_id}";
pub const CHECKPOINTS_PATH: &str = "/v1/checkpoints";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

/// Read-only handles the status routes query.
#[derive(Clone)]
pub struct ApiState {
    pub records: Arc<dyn RecordStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn build_api_router(state: ApiState) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(DOCUMENT_PATH.starts_with("/v1/"));

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(DOCUMENT_PATH, get(get_document))
        .route(CHECKPOINTS_PATH, get(list_checkpoints))
        .with_state(state)
}

/// Serve the status routes until `shutdown` flips to `true`.
pub async fn serve(
    config: &AppConfig,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    debug_assert!(!config.server.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.server.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "docflow status server listening");

    let app = build_api_router(state);
    let mut server_future = Box::pin({
        let rx = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(wait_until_true(rx))
                .await
        }
    });
    let mut drain_timeout = Box::pin(drain_timeout_future(shutdown));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Dropping the server future forces termination.
        }
    }
    tracing::info!("status server stopped");
    Ok(())
}

/// Spawn a task that flips the returned receiver to `true` on Ctrl+C or SIGTERM.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let event = wait_for_shutdown().await;
        tracing::info!(?event, "shutdown signal received");
        if let Err(error) = tx.send(true) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown");
        }
        // Keep the sender alive so receivers observe `true` instead of a closed channel.
        tx.closed().await;
    });
    rx
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn get_document(
    State(state): State<ApiState>,
    Path(document_id): Path<String>,
) -> Result<Json<ProcessingRecord>, ApiError> {
    match state.records.get(&document_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(ApiError::NotFound(format!(
            "document `{document_id}` not found"
        ))),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

async fn list_checkpoints(
    State(state): State<ApiState>,
) -> Result<Json<Vec<CheckpointState>>, ApiError> {
    state
        .checkpoints
        .list()
        .await
        .map(Json)
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

/// Resolves once the channel holds `true` or its sender is gone.
pub async fn wait_until_true(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        tracing::debug!("shutdown channel closed");
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn drain_timeout_future(receiver: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(DRAIN_TIMEOUT.as_secs() >= 1);
    async move {
        wait_until_true(receiver).await;
        tokio::time::sleep(DRAIN_TIMEOUT).await;
        tracing::warn!(
            seconds = DRAIN_TIMEOUT.as_secs(),
            "graceful shutdown timed out; continuing shutdown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_validation() {
        assert!(matches!(
            parse_listen_addr("  "),
            Err(ServerError::EmptyListenAddr)
        ));
        assert!(matches!(
            parse_listen_addr("localhost"),
            Err(ServerError::InvalidListenAddr { .. })
        ));
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").expect("addr").port(),
            8080
        );
    }
}
