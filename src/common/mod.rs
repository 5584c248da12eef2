//! Common utilities and types shared across minilock

pub mod auth;
pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod types;
pub mod utils;

pub use auth::{AuthError, Credentials, TokenIssuer};
pub use config::{AuthConfig, Config, QuorumConfig, ReaperConfig, ServerConfig};
pub use error::{Error, Result};
pub use hash::select_replica_indices;
pub use types::{
    AuthArgs, LockArgs, LockKind, LockReply, LockRequesterInfo, LockRpcArgs, LoginArgs,
    LoginReply, RpcErrorBody, RpcErrorCode, LOCK_RPC_PREFIX, RPC_PROTOCOL_VERSION,
};
pub use utils::{generate_uid, parse_duration, retry_with_backoff, validate_resource, with_deadline};
