//! Transport seam between the quorum coordinator and lock servers

use async_trait::async_trait;
use std::sync::Arc;

use crate::common::types::LockArgs;
use crate::common::Result;
use crate::server::locker::LockServer;
use crate::server::rpc::LockOp;

/// A lock server as seen by a client, local or across the network
#[async_trait]
pub trait NetLocker: Send + Sync {
    /// Run one lock operation against this server
    async fn call(&self, op: LockOp, args: &LockArgs) -> Result<bool>;

    /// RPC path of the server, placed in `LockArgs.service_endpoint`
    fn service_endpoint(&self) -> &str;

    /// Human-readable location, for logs
    fn address(&self) -> String;

    fn is_local(&self) -> bool {
        false
    }

    async fn lock(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::Lock, args).await
    }

    async fn unlock(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::Unlock, args).await
    }

    async fn rlock(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::RLock, args).await
    }

    async fn runlock(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::RUnlock, args).await
    }

    async fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::ForceUnlock, args).await
    }

    async fn expired(&self, args: &LockArgs) -> Result<bool> {
        self.call(LockOp::Expired, args).await
    }
}

/// Lock server living in this process; calls skip the network and the auth gate
pub struct LocalLocker {
    server: Arc<LockServer>,
}

impl LocalLocker {
    pub fn new(server: Arc<LockServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<LockServer> {
        &self.server
    }
}

#[async_trait]
impl NetLocker for LocalLocker {
    async fn call(&self, op: LockOp, args: &LockArgs) -> Result<bool> {
        op.apply(&self.server, args)
    }

    fn service_endpoint(&self) -> &str {
        self.server.service_endpoint()
    }

    fn address(&self) -> String {
        format!("local{}", self.server.service_endpoint())
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_locker_delegates() {
        let server = Arc::new(LockServer::new("rpc-path"));
        let locker = LocalLocker::new(server.clone());
        let args = LockArgs::new("0123-4567", "name", "node", locker.service_endpoint());

        assert!(locker.lock(&args).await.unwrap());
        assert!(!locker.expired(&args).await.unwrap());
        assert_eq!(server.holders("name").len(), 1);
        assert!(locker.unlock(&args).await.unwrap());
        assert!(locker.is_local());
        assert_eq!(locker.address(), "localrpc-path");
    }
}
