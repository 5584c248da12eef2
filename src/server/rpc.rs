//! Authenticated lock RPC service
//!
//! Wraps a [`LockServer`] so that every operation first passes the authentication
//! gate. A rejected call never reaches the lock table.

use std::sync::Arc;

use crate::common::auth::TokenIssuer;
use crate::common::types::{LockArgs, LockRpcArgs, LoginArgs, LoginReply};
use crate::common::{Error, Result};
use crate::server::locker::LockServer;

/// Lock operations exposed over RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Lock,
    Unlock,
    RLock,
    RUnlock,
    ForceUnlock,
    Expired,
}

impl LockOp {
    pub const ALL: [LockOp; 6] = [
        LockOp::Lock,
        LockOp::Unlock,
        LockOp::RLock,
        LockOp::RUnlock,
        LockOp::ForceUnlock,
        LockOp::Expired,
    ];

    /// Route segment under the lock server's service endpoint
    pub fn route(&self) -> &'static str {
        match self {
            LockOp::Lock => "/lock",
            LockOp::Unlock => "/unlock",
            LockOp::RLock => "/rlock",
            LockOp::RUnlock => "/runlock",
            LockOp::ForceUnlock => "/force-unlock",
            LockOp::Expired => "/expired",
        }
    }

    /// Apply this operation to a lock server, bypassing authentication
    pub fn apply(&self, server: &LockServer, args: &LockArgs) -> Result<bool> {
        match self {
            LockOp::Lock => server.lock(args),
            LockOp::Unlock => server.unlock(args),
            LockOp::RLock => server.rlock(args),
            LockOp::RUnlock => server.runlock(args),
            LockOp::ForceUnlock => server.force_unlock(args),
            LockOp::Expired => server.expired(args),
        }
    }
}

impl std::fmt::Display for LockOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.route().trim_start_matches('/'))
    }
}

/// Lock server guarded by token and request-time checks
#[derive(Clone)]
pub struct LockRpcService {
    issuer: Arc<TokenIssuer>,
    server: Arc<LockServer>,
}

impl LockRpcService {
    pub fn new(issuer: Arc<TokenIssuer>, server: Arc<LockServer>) -> Self {
        Self { issuer, server }
    }

    pub fn server(&self) -> &Arc<LockServer> {
        &self.server
    }

    pub fn service_endpoint(&self) -> &str {
        self.server.service_endpoint()
    }

    /// Verify credentials and issue a token. The password hash check is CPU-bound and
    /// runs on the blocking pool.
    pub async fn login(&self, args: &LoginArgs) -> Result<LoginReply> {
        let issuer = self.issuer.clone();
        let login = args.clone();
        let outcome = tokio::task::spawn_blocking(move || issuer.login(&login))
            .await
            .map_err(|e| Error::Internal(format!("login task failed: {}", e)))?;

        match outcome {
            Ok(reply) => {
                tracing::debug!(user = %args.username, "login accepted");
                Ok(reply)
            }
            Err(e) => {
                tracing::warn!(user = %args.username, "login rejected: {}", e);
                Err(e.into())
            }
        }
    }

    /// Authenticate the envelope, then run the operation
    pub fn call(&self, op: LockOp, req: &LockRpcArgs) -> Result<bool> {
        if let Err(e) = self.issuer.authorize(&req.auth) {
            tracing::warn!(op = %op, resource = %req.args.resource, "rejected: {}", e);
            return Err(e.into());
        }
        op.apply(&self.server, &req.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::auth::{AuthError, Credentials};
    use crate::common::types::AuthArgs;
    use chrono::{Duration as ChronoDuration, Utc};

    async fn service() -> (LockRpcService, String) {
        let creds = Credentials::new("minilock-admin", "minilock-secret");
        let issuer = Arc::new(TokenIssuer::new(&creds).unwrap());
        let service = LockRpcService::new(issuer, Arc::new(LockServer::new("rpc-path")));
        let token = service.login(&creds.login_args()).await.unwrap().auth_token;
        (service, token)
    }

    fn request(token: &str, uid: &str) -> LockRpcArgs {
        LockRpcArgs {
            auth: AuthArgs::new(token),
            args: LockArgs::new(uid, "name", "node", "rpc-path"),
        }
    }

    #[tokio::test]
    async fn test_authenticated_lock_cycle() {
        let (service, token) = service().await;
        let la = request(&token, "0123-4567");

        assert!(service.call(LockOp::Lock, &la).unwrap());
        assert!(!service.call(LockOp::Expired, &la).unwrap());
        assert!(service.call(LockOp::Unlock, &la).unwrap());
        assert!(service.call(LockOp::Expired, &la).unwrap());
    }

    #[tokio::test]
    async fn test_missing_token_never_reaches_table() {
        let (service, _) = service().await;
        let la = request("", "0123-4567");

        for op in LockOp::ALL {
            let err = service.call(op, &la).unwrap_err();
            assert!(matches!(err, Error::Auth(AuthError::MissingToken)));
        }
        assert!(service.server().is_empty());
    }

    #[tokio::test]
    async fn test_stale_request_time_rejected() {
        let (service, token) = service().await;
        let mut la = request(&token, "0123-4567");
        la.auth.request_time = Utc::now() - ChronoDuration::hours(2);

        let err = service.call(LockOp::Lock, &la).unwrap_err();
        assert!(err.is_auth());
        assert!(service.server().is_empty());
    }

    #[tokio::test]
    async fn test_bad_login() {
        let (service, _) = service().await;
        let bad = Credentials::new("minilock-admin", "not-the-secret").login_args();
        assert!(service.login(&bad).await.unwrap_err().is_auth());
    }

    #[test]
    fn test_routes_are_distinct() {
        let mut routes: Vec<_> = LockOp::ALL.iter().map(|op| op.route()).collect();
        routes.sort();
        routes.dedup();
        assert_eq!(routes.len(), 6);
    }
}
