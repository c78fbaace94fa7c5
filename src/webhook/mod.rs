//! Mutating Admission Webhook transport
//!
//! HTTPS front for the [`SidecarInjector`]: decodes AdmissionReview envelopes,
//! runs the injector under a deadline and encodes the response envelope.
//!
//! Routes:
//! - POST /mutate - Inject sidecars into Pods
//! - GET /healthz - Liveness probe

pub mod pod;
pub mod review;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::admission::SidecarInjector;
use crate::error::Error;
use crate::DEFAULT_REQUEST_TIMEOUT_MS;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Decision engine shared by every request
    pub injector: Arc<SidecarInjector>,
    /// Deadline for answering a single admission request
    pub request_timeout: Duration,
}

impl WebhookState {
    /// Create webhook state with the default request deadline
    pub fn new(injector: SidecarInjector) -> Self {
        Self {
            injector: Arc::new(injector),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Override the request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Create the webhook router with all endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// Path to the PEM serving certificate
    pub cert_file: PathBuf,
    /// Path to the PEM private key
    pub key_file: PathBuf,
}

impl ServerConfig {
    /// Listen on all interfaces on `port`
    pub fn new(port: u16, cert_file: PathBuf, key_file: PathBuf) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            cert_file,
            key_file,
        }
    }
}

/// Serve the webhook over TLS until the server fails
pub async fn serve(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), Error> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .map_err(|e| {
            Error::tls(format!(
                "failed to load {} / {}: {}",
                config.cert_file.display(),
                config.key_file.display(),
                e
            ))
        })?;

    info!(addr = %config.addr, "Starting sidecar injector webhook");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::server(e.to_string()))
}
