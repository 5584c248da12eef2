//! Client side: transports, quorum coordinator and reaper

pub mod net_locker;
pub mod quorum;
pub mod reaper;
pub mod remote;

pub use net_locker::{LocalLocker, NetLocker};
pub use quorum::{majority, HeldLock, QuorumCoordinator};
pub use reaper::{ReapReport, Reaper, StaleLock};
pub use remote::RemoteLocker;

use std::sync::Arc;
use std::time::Duration;

use crate::common::auth::Credentials;
use crate::common::Result;
use crate::server::locker::LockServer;
use crate::server::registry::NodeRegistry;

/// Build one locker per registry placement, in registry order.
///
/// Placements on `local_host` whose service endpoint matches one of `local` are served
/// in-process; everything else goes over HTTP.
pub fn connect_cluster(
    registry: &NodeRegistry,
    local_host: &str,
    local: &[Arc<LockServer>],
    credentials: &Credentials,
    call_timeout: Duration,
) -> Result<Vec<Arc<dyn NetLocker>>> {
    registry
        .placements()
        .iter()
        .map(|placement| {
            let in_process = registry
                .is_local(placement, local_host)
                .then(|| {
                    local
                        .iter()
                        .find(|s| s.service_endpoint() == placement.service_endpoint)
                })
                .flatten();

            let locker: Arc<dyn NetLocker> = match in_process {
                Some(server) => Arc::new(LocalLocker::new(server.clone())),
                None => Arc::new(RemoteLocker::new(
                    placement.clone(),
                    credentials.clone(),
                    call_timeout,
                )?),
            };
            Ok(locker)
        })
        .collect()
}
