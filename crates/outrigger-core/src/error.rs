//! Application-wide error types
//!
//! This module defines the closed error taxonomy surfaced by the connection
//! lifecycle (`ErrorCode`) and the internal error type used across the crate
//! (`AppError`), both built on `thiserror`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connection failure taxonomy surfaced by `ConnectionController::connect`
///
/// Each variant maps 1:1 to the pipeline stage that failed. Stage-internal
/// causes (timeout, explicit rejection, spawn error) are logged but never
/// distinguished here; callers only learn which layer broke. The serialized
/// names are a stable contract with frontends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The remote server did not accept a TCP connection
    #[error("server is unreachable")]
    ServerUnreachable,

    /// The local Shadowsocks proxy process could not be started
    #[error("failed to start the local proxy process")]
    ShadowsocksStartFailure,

    /// The server rejected the supplied credentials (or the probe failed)
    #[error("server credentials were rejected")]
    InvalidServerCredentials,

    /// The SOCKS-to-TUN tunnel process could not be started
    #[error("failed to start the tunnel process")]
    HttpProxyStartFailure,

    /// The routing service failed to install system routes
    #[error("failed to configure system routing")]
    ConfigureSystemProxyFailure,

    /// The routing service cannot manage this host's routing table at all
    #[error("the system routing table is unsupported")]
    UnsupportedRoutingTable,

    /// The user declined the elevation prompt for the routing service
    #[error("administrator permissions were denied")]
    NoAdminPermissions,
}

/// Application-wide error type
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum AppError {
    /// A connection attempt is already in flight
    #[error("a connection attempt is already active")]
    ConnectionInProgress,

    /// A connect pipeline stage failed
    #[error(transparent)]
    Connect(#[from] ErrorCode),

    /// Failed to spawn or supervise a child process
    #[error("process error: {0}")]
    Process(String),

    /// Connection store error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convert AppError to String for frontend command boundaries
impl From<AppError> for String {
    fn from(error: AppError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
