//! Error types shared across the control plane.

use thiserror::Error;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no authorization header")]
    MissingHeader,

    /// The identity provider refused the token.
    #[error("token rejected by identity provider")]
    Rejected,

    /// The identity provider could not be reached or returned garbage.
    #[error("identity provider failure: {0}")]
    Provider(String),
}

/// Failures talking to the compute cluster.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The request payload is missing something the allocator needs.
    #[error("invalid allocation payload: {0}")]
    InvalidPayload(String),

    /// The cluster refused to start the job.
    #[error("job allocation failed: {reason}")]
    AllocationFailed { reason: String },

    /// The job id does not name a live cluster task.
    #[error("invalid job id {id}")]
    InvalidJob { id: String },

    /// The cluster no longer knows this job.
    #[error("job {id} not found")]
    JobNotFound { id: String },

    /// The operation is not available on this allocator variant.
    #[error("{operation} is not supported by this allocator")]
    Unsupported { operation: &'static str },

    /// Malformed response or other protocol violation from the cluster.
    #[error("allocator failure: {0}")]
    Internal(String),
}

/// Failures of the job registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no job found with id {id}")]
    NotFound { id: String },

    #[error("job {id} already registered")]
    Duplicate { id: String },

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("registry backend error: {0}")]
    Backend(String),
}

impl From<deadpool_postgres::PoolError> for RegistryError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        RegistryError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for RegistryError {
    fn from(e: tokio_postgres::Error) -> Self {
        RegistryError::Backend(e.to_string())
    }
}

/// Problems with the process environment, raised before serving anything.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("cannot build outbound HTTP client: {0}")]
    Client(String),
}

/// Failures binding or running an HTTP listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("server failure: {0}")]
    Serve(String),
}
