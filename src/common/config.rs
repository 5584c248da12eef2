//! Configuration for minilock nodes and clients

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::client::quorum::majority;
use crate::common::auth::{Credentials, MIN_SECRET_KEY_LENGTH};
use crate::common::{Error, Result};
use crate::server::registry::{Endpoint, NodeRegistry};

/// Environment variable prefix, e.g. `MINILOCK__AUTH__SECRET_KEY`
pub const ENV_PREFIX: &str = "MINILOCK";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID, sent as the requester identity in every lock request
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub quorum: QuorumConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            log_level: default_log_level(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            quorum: QuorumConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

/// Node server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the lock RPC surface
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Authority (host[:port]) under which this node appears in `endpoints`
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Storage endpoints of the whole cluster (`scheme://host[:port]/path`)
    #[serde(default)]
    pub endpoints: Vec<String>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9000))
}

fn default_local_host() -> String {
    "localhost:9000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            local_host: default_local_host(),
            endpoints: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse the configured endpoint list
    pub fn parse_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.endpoints.iter().map(|e| e.parse()).collect()
    }
}

/// Inter-node authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Lifetime of tokens issued at login
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Allowed distance between request time and server time
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: u64,
}

fn default_token_ttl() -> u64 {
    86_400
}
fn default_max_skew() -> u64 {
    900
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            token_ttl_secs: default_token_ttl(),
            max_skew_secs: default_max_skew(),
        }
    }
}

impl AuthConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.access_key.clone(), self.secret_key.clone())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn max_skew(&self) -> Duration {
        Duration::from_secs(self.max_skew_secs)
    }
}

/// Quorum coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Deadline of a single lock RPC
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Attempts for releases and expiry checks
    #[serde(default = "default_release_retries")]
    pub release_retries: usize,

    /// Initial backoff between those attempts (doubled each time)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Upper bound for `acquire` retry loops
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Override of the write quorum (never below strict majority)
    #[serde(default)]
    pub write_quorum: Option<usize>,

    /// Override of the read quorum (never below strict majority)
    #[serde(default)]
    pub read_quorum: Option<usize>,

    /// Number of nodes holding a resource's lock, picked by HRW hashing; all nodes when unset
    #[serde(default)]
    pub replicas: Option<usize>,
}

fn default_call_timeout() -> u64 {
    2_000
}
fn default_release_retries() -> usize {
    3
}
fn default_retry_backoff() -> u64 {
    100
}
fn default_acquire_timeout() -> u64 {
    10_000
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            release_retries: default_release_retries(),
            retry_backoff_ms: default_retry_backoff(),
            acquire_timeout_ms: default_acquire_timeout(),
            write_quorum: None,
            read_quorum: None,
            replicas: None,
        }
    }
}

impl QuorumConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause between reaper passes
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    /// Age after which a local lock entry is checked across the cluster
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Passes a candidate may stay unresolved before it is dropped
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,

    /// Candidates checked at the same time within one pass
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Queue bound; the oldest candidates are dropped beyond it
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_true() -> bool {
    true
}
fn default_reaper_interval() -> u64 {
    60
}
fn default_stale_after() -> u64 {
    60
}
fn default_max_passes() -> u32 {
    5
}
fn default_max_concurrent() -> usize {
    16
}
fn default_max_pending() -> usize {
    1024
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval(),
            stale_after_secs: default_stale_after(),
            max_passes: default_max_passes(),
            max_concurrent: default_max_concurrent(),
            max_pending: default_max_pending(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, overlaid with `MINILOCK__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Check settings every node and client relies on
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.auth.access_key.is_empty() {
            return Err(Error::InvalidConfig("auth.access_key cannot be empty".into()));
        }
        if self.auth.secret_key.len() < MIN_SECRET_KEY_LENGTH {
            return Err(Error::InvalidConfig(format!(
                "auth.secret_key must be at least {} characters",
                MIN_SECRET_KEY_LENGTH
            )));
        }
        if self.quorum.call_timeout_ms == 0 {
            return Err(Error::InvalidConfig("quorum.call_timeout_ms must be > 0".into()));
        }
        if self.quorum.release_retries == 0 {
            return Err(Error::InvalidConfig("quorum.release_retries must be > 0".into()));
        }
        if self.reaper.enabled && self.reaper.interval_secs == 0 {
            return Err(Error::InvalidConfig("reaper.interval_secs must be > 0".into()));
        }
        if self.reaper.max_concurrent == 0 || self.reaper.max_pending == 0 {
            return Err(Error::InvalidConfig(
                "reaper.max_concurrent and reaper.max_pending must be > 0".into(),
            ));
        }
        if self.quorum.replicas == Some(0) {
            return Err(Error::InvalidConfig("quorum.replicas must be > 0".into()));
        }

        let endpoints = self.server.parse_endpoints()?;
        let nodes = NodeRegistry::new(&endpoints).len();
        let replica_set = self.quorum.replicas.map_or(nodes, |r| r.min(nodes));
        for (name, value) in [
            ("write_quorum", self.quorum.write_quorum),
            ("read_quorum", self.quorum.read_quorum),
        ] {
            if let Some(q) = value {
                if nodes > 0 && (q < majority(replica_set) || q > replica_set) {
                    return Err(Error::InvalidConfig(format!(
                        "quorum.{} must lie between {} and {}",
                        name,
                        majority(replica_set),
                        replica_set
                    )));
                }
            }
        }

        Ok(())
    }
}
