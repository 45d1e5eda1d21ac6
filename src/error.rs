//! Unified error handling for the portico proxy.
//!
//! Every fallible operation on the request path returns `ProxyResult`; the
//! session layer converts errors into client-visible `-ERR` replies rather
//! than dropping connections.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;
use crate::proto::RespError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// RESP protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] RespError),

    /// Backend connection errors
    #[error("backend error: {message}")]
    Backend { message: String },

    /// Cluster topology errors
    #[error("cluster error: {message}")]
    Cluster { message: String },

    /// Backend dial timeout
    #[error("dial timeout connecting to {endpoint}")]
    DialTimeout { endpoint: String },
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        ProxyError::Backend {
            message: message.into(),
        }
    }

    /// Create a cluster topology error
    pub fn cluster<S: Into<String>>(message: S) -> Self {
        ProxyError::Cluster {
            message: message.into(),
        }
    }
}
