//! Error types for the relay proxy

use protocol::ProtocolError;
use thiserror::Error;

/// Failures of the backend discovery collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no backend known for service class {0:?}")]
    UnknownServiceClass(String),
    #[error("resolving service class {0:?} timed out")]
    Timeout(String),
    #[error("backend lookup failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
