//! Node registry and lock server placement
//!
//! A cluster is described by its storage endpoints (`scheme://host[:port]/path`). Lock
//! granularity is per node, not per disk: every distinct host gets exactly one lock
//! server no matter how many paths it serves. Hosts are kept in order of first
//! appearance, so every node derives the same registry from the same endpoint list.

use reqwest::Url;
use std::collections::HashSet;
use std::str::FromStr;

use crate::common::types::LOCK_RPC_PREFIX;
use crate::common::{Error, Result};

/// One storage location of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    /// Authority: host plus port when one was given
    pub host: String,
    pub path: String,
}

impl Endpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into().to_ascii_lowercase(),
            path: path.into(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s)
            .map_err(|e| Error::InvalidConfig(format!("invalid endpoint {}: {}", s, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "unsupported endpoint scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidConfig(format!("endpoint {} has no host", s)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Endpoint::new(url.scheme(), host, url.path()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// Where one lock server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockServerPlacement {
    pub scheme: String,
    pub host: String,
    /// RPC path of the lock server on that host
    pub service_endpoint: String,
}

impl LockServerPlacement {
    fn for_endpoint(endpoint: &Endpoint) -> Self {
        let path = endpoint.path.trim_end_matches('/');
        Self {
            scheme: endpoint.scheme.clone(),
            host: endpoint.host.clone(),
            service_endpoint: format!("{}{}", LOCK_RPC_PREFIX, path),
        }
    }

    /// Base URL of the node, without the service path
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Full URL of the lock server
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url(), self.service_endpoint)
    }
}

/// One lock server per distinct host of the cluster
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    placements: Vec<LockServerPlacement>,
}

impl NodeRegistry {
    pub fn new(endpoints: &[Endpoint]) -> Self {
        let mut seen = HashSet::new();
        let placements = endpoints
            .iter()
            .filter(|e| seen.insert(e.host.clone()))
            .map(LockServerPlacement::for_endpoint)
            .collect();
        Self { placements }
    }

    /// Parse endpoint strings and build the registry
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        let endpoints = urls
            .iter()
            .map(|u| u.as_ref().parse())
            .collect::<Result<Vec<Endpoint>>>()?;
        Ok(Self::new(&endpoints))
    }

    pub fn placements(&self) -> &[LockServerPlacement] {
        &self.placements
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Lock servers this node must run (at most one)
    pub fn local(&self, local_host: &str) -> Vec<&LockServerPlacement> {
        let local_host = local_host.to_ascii_lowercase();
        self.placements
            .iter()
            .filter(|p| p.host == local_host)
            .collect()
    }

    pub fn is_local(&self, placement: &LockServerPlacement, local_host: &str) -> bool {
        placement.host.eq_ignore_ascii_case(local_host)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.placements.iter().map(|p| p.host.clone()).collect()
    }
}
