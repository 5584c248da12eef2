//! Error types for minilock

use crate::common::auth::AuthError;
use crate::common::types::{LockKind, RpcErrorCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Authentication Errors ===
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    // === Protocol Misuse ===
    #[error("Unlock attempted on an unlocked entity: {resource}")]
    NotLocked { resource: String },

    #[error("Release attempted on a {held} locked entity: {resource}")]
    WrongLockKind { resource: String, held: LockKind },

    #[error("Unable to find corresponding lock for uid {uid} on {resource}")]
    HolderNotFound { resource: String, uid: String },

    #[error("Force unlock requires an empty uid, got {uid}")]
    ForceUnlockWithUid { uid: String },

    // === Remote Errors ===
    #[error("Remote error ({code}): {message}")]
    Remote { code: RpcErrorCode, message: String },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Quorum Errors ===
    #[error("Quorum not reached: {achieved} of {needed} required")]
    QuorumNotReached { achieved: usize, needed: usize },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Http(_) => true,
            Error::Remote { code, .. } => *code == RpcErrorCode::Internal,
            _ => false,
        }
    }

    /// Did the caller misuse the lock protocol (releasing something it does not hold)?
    pub fn is_misuse(&self) -> bool {
        match self {
            Error::NotLocked { .. }
            | Error::WrongLockKind { .. }
            | Error::HolderNotFound { .. }
            | Error::ForceUnlockWithUid { .. } => true,
            Error::Remote { code, .. } => code.is_misuse(),
            _ => false,
        }
    }

    /// Was the call rejected by the authentication gate?
    pub fn is_auth(&self) -> bool {
        match self {
            Error::Auth(_) => true,
            Error::Remote { code, .. } => *code == RpcErrorCode::Unauthorized,
            _ => false,
        }
    }

    /// Stable wire code for RPC responses
    pub fn rpc_code(&self) -> RpcErrorCode {
        match self {
            Error::Auth(_) => RpcErrorCode::Unauthorized,
            Error::NotLocked { .. } => RpcErrorCode::NotLocked,
            Error::WrongLockKind { .. } => RpcErrorCode::WrongLockKind,
            Error::HolderNotFound { .. } => RpcErrorCode::HolderNotFound,
            Error::ForceUnlockWithUid { .. } => RpcErrorCode::ForceUnlockWithUid,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => RpcErrorCode::InvalidArgument,
            Error::Remote { code, .. } => *code,
            _ => RpcErrorCode::Internal,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.rpc_code() {
            RpcErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            RpcErrorCode::NotLocked
            | RpcErrorCode::WrongLockKind
            | RpcErrorCode::HolderNotFound
            | RpcErrorCode::ForceUnlockWithUid => StatusCode::CONFLICT,
            RpcErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            RpcErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", e))
    }
}
