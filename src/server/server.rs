//! Node server
//!
//! Wires one node together: the registry derived from the endpoint list, the lock
//! server this node hosts, the authenticated HTTP surface and the background cleanup.

use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::client::{connect_cluster, QuorumCoordinator, StaleLock};
use crate::common::auth::TokenIssuer;
use crate::common::types::LockKind;
use crate::common::{Config, Error, Result};
use crate::server::http::{create_router, NodeState};
use crate::server::locker::LockServer;
use crate::server::registry::NodeRegistry;
use crate::server::rpc::LockRpcService;

pub struct NodeServer {
    config: Config,
    registry: NodeRegistry,
    services: Vec<LockRpcService>,
    coordinator: Option<Arc<QuorumCoordinator>>,
}

impl NodeServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = NodeRegistry::new(&config.server.parse_endpoints()?);
        let local = registry.local(&config.server.local_host);
        if local.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "local host {} does not appear in server.endpoints",
                config.server.local_host
            )));
        }

        let issuer = Arc::new(TokenIssuer::with_settings(
            &config.auth.credentials(),
            config.auth.token_ttl(),
            config.auth.max_skew(),
        )?);
        let servers: Vec<Arc<LockServer>> = local
            .iter()
            .map(|p| Arc::new(LockServer::new(p.service_endpoint.clone())))
            .collect();
        let services = servers
            .iter()
            .map(|s| LockRpcService::new(issuer.clone(), s.clone()))
            .collect();

        let coordinator = if config.reaper.enabled {
            let lockers = connect_cluster(
                &registry,
                &config.server.local_host,
                &servers,
                &config.auth.credentials(),
                config.quorum.call_timeout(),
            )?;
            let coordinator = QuorumCoordinator::new(
                config.node_id.clone(),
                lockers,
                config.quorum.clone(),
            )?
            .with_reaper(config.reaper.clone());
            Some(Arc::new(coordinator))
        } else {
            None
        };

        Ok(Self {
            config,
            registry,
            services,
            coordinator,
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn services(&self) -> &[LockRpcService] {
        &self.services
    }

    pub fn router(&self) -> Router {
        create_router(NodeState {
            node_id: self.config.node_id.clone(),
            services: Arc::new(self.services.clone()),
        })
    }

    /// Hand local entries older than `reaper.stale_after` to the reaper.
    /// Returns how many were reported.
    pub fn collect_stale(&self) -> usize {
        let Some(coordinator) = &self.coordinator else {
            return 0;
        };
        let Some(reaper) = coordinator.reaper() else {
            return 0;
        };

        let mut reported = 0;
        for service in &self.services {
            for (resource, holder) in service
                .server()
                .entries_older_than(self.config.reaper.stale_after())
            {
                let nodes = coordinator.replica_set(&resource);
                reaper.report(StaleLock {
                    resource,
                    uid: holder.uid,
                    owner: holder.node,
                    kind: if holder.writer {
                        LockKind::Write
                    } else {
                        LockKind::Read
                    },
                    nodes,
                });
                reported += 1;
            }
        }
        reported
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.bind_addr).await?;
        self.serve_on(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Serve on an already bound listener until `shutdown` completes
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!("Starting lock node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", addr);
        tracing::info!("  Cluster: {} lock servers", self.registry.len());
        for service in &self.services {
            tracing::info!("  Local lock server: {}", service.service_endpoint());
        }

        let router = self.router();
        let this = Arc::new(self);

        let mut background = Vec::new();
        if let Some(reaper) = this.coordinator.as_ref().and_then(|c| c.reaper()) {
            background.push(reaper.clone().start());

            let node = this.clone();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(node.config.reaper.interval());
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let reported = node.collect_stale();
                    if reported > 0 {
                        tracing::debug!(reported, "stale local entries queued for probing");
                    }
                }
            }));
        }

        tracing::info!("✓ Lock node ready");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        for task in background {
            task.abort();
        }
        tracing::info!("Lock node stopped");
        result.map_err(Error::from)
    }
}
