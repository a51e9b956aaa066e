//! Error types for meridian-dns.

use thiserror::Error;

/// Errors that can occur while configuring or running the edge server.
#[derive(Debug, Error)]
pub enum EdgeError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse an upstream address
    #[error("Invalid upstream address: {0}")]
    InvalidAddress(String),

    /// TLS material could not be loaded or parsed
    #[error("TLS setup error: {0}")]
    Tls(String),
}

/// Errors surfaced by the forward helper.
///
/// Transport failures inside the proxy loop are absorbed per-proxy; only the
/// last one is surfaced once every candidate has been tried.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The helper was called before an engine was bound to it.
    #[error("no edge engine bound")]
    NoEdge,

    /// Every upstream proxy was unusable and no transport error was captured.
    #[error("no healthy upstream proxies")]
    NoHealthy,

    /// The last upstream transport error.
    #[error("upstream transport error: {0}")]
    Transport(#[from] std::io::Error),
}
