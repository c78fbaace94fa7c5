//! Sidecar Injector - mutating admission webhook for Pods
//!
//! The webhook is consulted by the API server before a Pod is persisted and
//! answers with a JSON Patch that appends the configured sidecar containers,
//! volumes and annotations to the Pod.
//!
//! # Architecture
//!
//! - The sidecar configuration is loaded once at startup and shared read-only
//! - The decision engine is synchronous and pure: admission request in,
//!   admission decision out
//! - Failures admit the Pod unmutated unless the operator opts into the
//!   fail-closed policy
//!
//! # Modules
//!
//! - [`config`] - Sidecar configuration model and loading
//! - [`patch`] - JSON Patch builders for list and map fields
//! - [`admission`] - Admission decision engine and failure policy
//! - [`webhook`] - HTTPS transport (axum router, TLS serving)
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the webhook

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod error;
pub mod patch;
pub mod telemetry;
pub mod webhook;

pub use admission::{AdmissionDecision, FailurePolicy, Mutation, SidecarInjector};
pub use config::SidecarConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8088;

/// Default path of the serving certificate (mounted from a TLS Secret)
pub const DEFAULT_TLS_CERT_FILE: &str = "/run/secrets/tls/tls.crt";

/// Default path of the serving private key (mounted from a TLS Secret)
pub const DEFAULT_TLS_KEY_FILE: &str = "/run/secrets/tls/tls.key";

/// Default path of the sidecar configuration file (mounted from a ConfigMap)
pub const DEFAULT_SIDECAR_CONFIG_FILE: &str = "/etc/sidecar-injector/sidecar-config.yaml";

/// Default deadline for answering a single admission request
///
/// Kept below the API server's default webhook timeout (10s) so the webhook
/// always answers before the API server gives up on it.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
