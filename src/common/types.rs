//! Lock arguments, lock table entries and the RPC envelopes exchanged between nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version tag checked at login; nodes speaking another tag are refused
pub const RPC_PROTOCOL_VERSION: &str = "minilock-rpc/1";

/// Path prefix every lock server is mounted under
pub const LOCK_RPC_PREFIX: &str = "/minilock/lock";

/// Exclusive (write) or shared (read) access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Write,
    Read,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Write => write!(f, "write"),
            LockKind::Read => write!(f, "read"),
        }
    }
}

/// Arguments of every lock operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArgs {
    /// Identifier of this lock attempt
    pub uid: String,
    /// Name of the locked resource (object or shard key)
    pub resource: String,
    /// Network identity of the requesting client
    pub node: String,
    /// RPC path of the lock server the request is addressed to
    pub service_endpoint: String,
}

impl LockArgs {
    pub fn new(
        uid: impl Into<String>,
        resource: impl Into<String>,
        node: impl Into<String>,
        service_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            resource: resource.into(),
            node: node.into(),
            service_endpoint: service_endpoint.into(),
        }
    }

    /// Arguments for a force unlock (uid must stay empty)
    pub fn force(
        resource: impl Into<String>,
        node: impl Into<String>,
        service_endpoint: impl Into<String>,
    ) -> Self {
        Self::new("", resource, node, service_endpoint)
    }
}

/// One granted lock held in a node's lock table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequesterInfo {
    pub writer: bool,
    pub node: String,
    pub service_endpoint: String,
    pub uid: String,
    /// Grant time, for diagnostics and staleness checks only
    pub timestamp: DateTime<Utc>,
}

impl LockRequesterInfo {
    pub fn from_args(args: &LockArgs, writer: bool) -> Self {
        Self {
            writer,
            node: args.node.clone(),
            service_endpoint: args.service_endpoint.clone(),
            uid: args.uid.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Does this entry belong to the holder described by `args`?
    pub fn matches(&self, args: &LockArgs) -> bool {
        self.uid == args.uid
            && self.node == args.node
            && self.service_endpoint == args.service_endpoint
    }
}

/// Authentication envelope carried by every lock RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthArgs {
    #[serde(default)]
    pub auth_token: String,
    pub request_time: DateTime<Utc>,
}

impl AuthArgs {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            request_time: Utc::now(),
        }
    }
}

/// Wire request for the six lock operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRpcArgs {
    #[serde(flatten)]
    pub auth: AuthArgs,
    #[serde(flatten)]
    pub args: LockArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReply {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginArgs {
    pub username: String,
    pub password: String,
    pub version: String,
    pub request_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReply {
    pub auth_token: String,
}

/// Stable error codes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    Unauthorized,
    NotLocked,
    WrongLockKind,
    HolderNotFound,
    ForceUnlockWithUid,
    InvalidArgument,
    Internal,
}

impl RpcErrorCode {
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            RpcErrorCode::NotLocked
                | RpcErrorCode::WrongLockKind
                | RpcErrorCode::HolderNotFound
                | RpcErrorCode::ForceUnlockWithUid
        )
    }
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            RpcErrorCode::Unauthorized => "unauthorized",
            RpcErrorCode::NotLocked => "not_locked",
            RpcErrorCode::WrongLockKind => "wrong_lock_kind",
            RpcErrorCode::HolderNotFound => "holder_not_found",
            RpcErrorCode::ForceUnlockWithUid => "force_unlock_with_uid",
            RpcErrorCode::InvalidArgument => "invalid_argument",
            RpcErrorCode::Internal => "internal",
        };
        f.write_str(code)
    }
}

/// Error body returned by a lock server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: RpcErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_args_flatten() {
        let req = LockRpcArgs {
            auth: AuthArgs::new("token"),
            args: LockArgs::new("0123-4567", "name", "node", "rpc-path"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["auth_token"], "token");
        assert_eq!(json["uid"], "0123-4567");
        assert_eq!(json["service_endpoint"], "rpc-path");

        let back: LockRpcArgs = serde_json::from_value(json).unwrap();
        assert_eq!(back.args, req.args);
    }

    #[test]
    fn test_requester_matches() {
        let args = LockArgs::new("0123-4567", "name", "node", "rpc-path");
        let info = LockRequesterInfo::from_args(&args, true);
        assert!(info.matches(&args));

        let other_node = LockArgs::new("0123-4567", "name", "other", "rpc-path");
        assert!(!info.matches(&other_node));
    }

    #[test]
    fn test_error_code_wire_format() {
        let body = RpcErrorBody {
            code: RpcErrorCode::ForceUnlockWithUid,
            message: "uid".into(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("force_unlock_with_uid"));
        assert!(RpcErrorCode::NotLocked.is_misuse());
        assert!(!RpcErrorCode::Unauthorized.is_misuse());
    }
}
