//! Error types for the multidimensional pod autoscaler

use thiserror::Error;

/// Main error type for autoscaler operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// MPA object failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Ownership chain loops back on itself
    #[error("Cycle detected in ownership chain: {0}")]
    OwnerCycle(String),

    /// Owner reference points at something that cannot own pods
    #[error("invalid owner: {0}")]
    InvalidOwner(String),

    /// Pod or container is not tracked by the cluster model
    #[error("key error: {0} not found")]
    UnknownKey(String),

    /// Checkpoint could not be saved or restored
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Histogram operation failed
    #[error("histogram error: {0}")]
    Histogram(String),

    /// Resource quantity could not be parsed or is too fine-grained
    #[error("quantity error: {0}")]
    Quantity(String),

    /// Scale sub-resource could not be read or written
    #[error("scale error: {0}")]
    Scale(String),

    /// Usage metrics missing or unusable for a horizontal decision
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Pod could not be evicted or resized
    #[error("eviction error: {0}")]
    Eviction(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded
    #[error("tls error: {0}")]
    Tls(String),

    /// Operation exceeded its deadline
    #[error("deadline exceeded: {0}")]
    Timeout(String),
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an ownership cycle error naming the controller that repeated
    pub fn owner_cycle(msg: impl Into<String>) -> Self {
        Self::OwnerCycle(msg.into())
    }

    /// Create an invalid owner error
    pub fn invalid_owner(msg: impl Into<String>) -> Self {
        Self::InvalidOwner(msg.into())
    }

    /// Create a key error for an untracked pod or container
    pub fn unknown_key(key: impl Into<String>) -> Self {
        Self::UnknownKey(key.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a histogram error
    pub fn histogram(msg: impl Into<String>) -> Self {
        Self::Histogram(msg.into())
    }

    /// Create a quantity error
    pub fn quantity(msg: impl Into<String>) -> Self {
        Self::Quantity(msg.into())
    }

    /// Create a scale error
    pub fn scale(msg: impl Into<String>) -> Self {
        Self::Scale(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create an eviction error
    pub fn eviction(msg: impl Into<String>) -> Self {
        Self::Eviction(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a deadline error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Returns true for transient control-plane failures worth retrying:
    /// throttling, server errors, and broken connections.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 429 || resp.code >= 500,
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => true,
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Returns true when the API server answered 409
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Returns true when the API server refused the request with 429
    /// (eviction blocked by a disruption budget)
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 429)
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    }))
}
