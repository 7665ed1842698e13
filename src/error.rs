//! Error types for clone-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Durable key-value storage
//! - Priority queue backends
//! - Clone type registration and instantiation
//! - Clone manager bookkeeping
//! - Worker pool lifecycle
//! - Administrative requests
//! - Runtime assembly
//!
//! Lifecycle transitions themselves never produce these errors: an illegal
//! transition is reported as `false`, and a failing hook becomes a FAILED
//! clone. These types cover the surrounding plumbing.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during key-value store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend unavailable: {0}")]
    Unavailable(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The shared backend could not be reached. This is the only error that
    /// moves a [`CloneQueue`](crate::scheduler::CloneQueue) into fallback mode.
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    /// Redis answered but the command failed.
    #[error("Redis operation failed: {0}")]
    Redis(redis::RedisError),

    /// Failed to connect within the allotted time.
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),
}

impl QueueError {
    /// Returns true when the error reflects lost connectivity rather than a
    /// rejected command.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ConnectTimeout(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            QueueError::Unavailable(err.to_string())
        } else {
            QueueError::Redis(err)
        }
    }
}

/// Errors that can occur during clone type registration and instantiation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Clone type '{0}' is not registered")]
    UnknownType(String),

    #[error("Clone type '{0}' is already registered")]
    DuplicateType(String),

    #[error("Clone type name cannot be empty")]
    EmptyTypeName,
}

/// Errors that can occur in the clone manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Clone '{0}' already exists")]
    DuplicateId(String),

    #[error("Clone '{0}' not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Manager is already running")]
    AlreadyRunning,
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors returned by the administrative request layer.
///
/// Each variant maps to the status code a transport would answer with.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdminError {
    /// Returns the HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AdminError::NotFound(_) => 404,
            AdminError::BadRequest(_) => 400,
            AdminError::Internal(_) => 500,
        }
    }
}

impl From<ManagerError> for AdminError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Registry(RegistryError::UnknownType(name)) => {
                AdminError::BadRequest(format!("unknown clone type '{}'", name))
            }
            ManagerError::DuplicateId(_) | ManagerError::Registry(_) => {
                AdminError::BadRequest(err.to_string())
            }
            ManagerError::NotFound(id) => AdminError::NotFound(format!("clone '{}'", id)),
            ManagerError::Storage(_) | ManagerError::AlreadyRunning => {
                AdminError::Internal(err.to_string())
            }
        }
    }
}

/// Errors that can occur while assembling or starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}
