//! HTTP client for a remote lock server
//!
//! Logs in lazily and keeps the token. Login runs in its own task under the login
//! timeout, not the per-call one: a caller that gives up still leaves the token cached
//! for the next call, and concurrent callers share a single login. When a call is
//! rejected by the authentication gate (expired token, rotated secret) it logs in
//! again once and repeats the call.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::client::net_locker::NetLocker;
use crate::common::auth::Credentials;
use crate::common::types::{AuthArgs, LockArgs, LockReply, LockRpcArgs, LoginReply, RpcErrorBody};
use crate::common::{Error, Result};
use crate::server::registry::LockServerPlacement;
use crate::server::rpc::LockOp;

/// Upper bound of a login round trip; the server hashes the secret before answering
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state shared with background login tasks
struct Session {
    url: String,
    client: Client,
    credentials: Credentials,
    login_timeout: Duration,
    token: Mutex<Option<String>>,
}

impl Session {
    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        route: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let response = self
            .client
            .post(format!("{}{}", self.url, route))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RpcErrorBody>(&text) {
            Ok(body) => Err(Error::Remote {
                code: body.code,
                message: body.message,
            }),
            Err(_) if status == StatusCode::REQUEST_TIMEOUT => Err(Error::Timeout(text)),
            Err(_) => Err(Error::Http(format!("{} from {}: {}", status, self.url, text))),
        }
    }

    /// Cached token, or a fresh one when none is cached or the cached one is `rejected`
    async fn token(&self, rejected: Option<String>) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if rejected.as_ref() != Some(token) {
                return Ok(token.clone());
            }
        }
        *cached = None;

        let reply: LoginReply = self
            .post("/login", &self.credentials.login_args(), self.login_timeout)
            .await?;
        tracing::debug!(server = %self.url, "logged in");
        *cached = Some(reply.auth_token.clone());
        Ok(reply.auth_token)
    }
}

pub struct RemoteLocker {
    placement: LockServerPlacement,
    call_timeout: Duration,
    session: Arc<Session>,
}

impl RemoteLocker {
    pub fn new(
        placement: LockServerPlacement,
        credentials: Credentials,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().connect_timeout(call_timeout).build()?;
        Ok(Self::with_client(placement, credentials, client, call_timeout))
    }

    pub fn with_client(
        placement: LockServerPlacement,
        credentials: Credentials,
        client: Client,
        call_timeout: Duration,
    ) -> Self {
        Self {
            session: Arc::new(Session {
                url: placement.url(),
                client,
                credentials,
                login_timeout: DEFAULT_LOGIN_TIMEOUT,
                token: Mutex::new(None),
            }),
            placement,
            call_timeout,
        }
    }

    /// Replace the login timeout; only valid before the first call
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        if let Some(session) = Arc::get_mut(&mut self.session) {
            session.login_timeout = timeout;
        }
        self
    }

    pub fn placement(&self) -> &LockServerPlacement {
        &self.placement
    }

    /// Token for the next call. The login, if any, completes in the background even
    /// when this future is dropped.
    async fn token(&self, rejected: Option<String>) -> Result<String> {
        let session = self.session.clone();
        tokio::spawn(async move { session.token(rejected).await })
            .await
            .map_err(|e| Error::Internal(format!("login task failed: {}", e)))?
    }

    /// Log in now unless a token is already cached
    pub async fn login(&self) -> Result<()> {
        self.token(None).await.map(|_| ())
    }

    async fn send(&self, op: LockOp, args: &LockArgs, token: String) -> Result<bool> {
        let req = LockRpcArgs {
            auth: AuthArgs::new(token),
            args: args.clone(),
        };
        let reply: LockReply = self.session.post(op.route(), &req, self.call_timeout).await?;
        Ok(reply.ok)
    }
}

#[async_trait]
impl NetLocker for RemoteLocker {
    async fn call(&self, op: LockOp, args: &LockArgs) -> Result<bool> {
        let token = self.token(None).await?;
        match self.send(op, args, token.clone()).await {
            Err(e) if e.is_auth() => {
                tracing::debug!(server = %self.session.url, "token rejected ({}), logging in again", e);
                let token = self.token(Some(token)).await?;
                self.send(op, args, token).await
            }
            other => other,
        }
    }

    fn service_endpoint(&self) -> &str {
        &self.placement.service_endpoint
    }

    fn address(&self) -> String {
        self.session.url.clone()
    }
}
