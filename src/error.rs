//! Error types for the sidecar injector

use thiserror::Error;

/// Main error type for sidecar injector operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Sidecar configuration is missing, unreadable or malformed
    #[error("sidecar config error: {0}")]
    ConfigLoad(String),

    /// Admission object could not be decoded into a supported resource kind
    #[error("failed to decode admission object: {0}")]
    Decode(#[source] serde_json::Error),

    /// AdmissionReview envelope is malformed or carries no request
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// Patch operations could not be serialized
    #[error("failed to serialize patch ({operations} operations): {reason}")]
    PatchSerialization {
        /// Number of operations the patch was meant to carry
        operations: usize,
        /// Underlying serializer message
        reason: String,
    },

    /// Serving certificate or key could not be loaded
    #[error("TLS config error: {0}")]
    Tls(String),

    /// HTTPS server failed while serving
    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    /// Create a config load error with the given message
    pub fn config_load(msg: impl Into<String>) -> Self {
        Self::ConfigLoad(msg.into())
    }

    /// Create an invalid review error with the given message
    pub fn invalid_review(msg: impl Into<String>) -> Self {
        Self::InvalidReview(msg.into())
    }

    /// Create a patch serialization error for a patch of `operations` operations
    pub fn patch_serialization(operations: usize, reason: impl std::fmt::Display) -> Self {
        Self::PatchSerialization {
            operations,
            reason: reason.to_string(),
        }
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }
}
