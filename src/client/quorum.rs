//! Quorum coordinator
//!
//! Turns "lock resource R" into agreement among the lock servers holding R:
//!
//! 1. pick a fresh uid for the attempt
//! 2. send Lock/RLock to every node of R's replica set in parallel, each call bounded
//!    by the call timeout (a call that times out counts as a denial)
//! 3. succeed once at least a strict majority granted
//! 4. otherwise undo the partial grants with compensating Unlock/RUnlock calls
//!
//! Contention is not an error: `try_lock` answers `None` and the caller retries
//! (`acquire` does so with randomised backoff until a deadline). Nothing queues on
//! the servers.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::net_locker::NetLocker;
use crate::client::reaper::{Reaper, StaleLock};
use crate::common::config::{QuorumConfig, ReaperConfig};
use crate::common::types::{LockArgs, LockKind};
use crate::common::{
    generate_uid, retry_with_backoff, select_replica_indices, validate_resource, with_deadline,
    Error, Result,
};
use crate::server::rpc::LockOp;

/// Strict majority of `n` nodes
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

impl LockKind {
    pub fn acquire_op(&self) -> LockOp {
        match self {
            LockKind::Write => LockOp::Lock,
            LockKind::Read => LockOp::RLock,
        }
    }

    pub fn release_op(&self) -> LockOp {
        match self {
            LockKind::Write => LockOp::Unlock,
            LockKind::Read => LockOp::RUnlock,
        }
    }
}

/// A lock granted by a quorum of nodes
///
/// Releasing is explicit: pass it back to [`QuorumCoordinator::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub resource: String,
    pub uid: String,
    pub kind: LockKind,
    /// Indices of the nodes that granted
    pub nodes: Vec<usize>,
    pub acquired_at: DateTime<Utc>,
}

/// Result of one call during a fan-out
#[derive(Debug)]
enum CallOutcome {
    Granted,
    Denied,
    Failed,
}

pub struct QuorumCoordinator {
    node: String,
    lockers: Vec<Arc<dyn NetLocker>>,
    addresses: Vec<String>,
    config: QuorumConfig,
    reaper: Option<Arc<Reaper>>,
}

impl QuorumCoordinator {
    /// `node` is this client's identity; `lockers` are the cluster's lock servers in
    /// registry order (every client must use the same order).
    pub fn new(
        node: impl Into<String>,
        lockers: Vec<Arc<dyn NetLocker>>,
        config: QuorumConfig,
    ) -> Result<Self> {
        if lockers.is_empty() {
            return Err(Error::InvalidConfig("no lock servers configured".into()));
        }
        let addresses = lockers.iter().map(|l| l.address()).collect();
        Ok(Self {
            node: node.into(),
            lockers,
            addresses,
            config,
            reaper: None,
        })
    }

    /// Attach a reaper sharing this coordinator's lockers; cleanups that cannot finish
    /// are handed to it.
    pub fn with_reaper(mut self, config: ReaperConfig) -> Self {
        let reaper = Reaper::new(self.lockers.clone(), self.config.clone(), config);
        self.reaper = Some(Arc::new(reaper));
        self
    }

    pub fn reaper(&self) -> Option<&Arc<Reaper>> {
        self.reaper.as_ref()
    }

    pub fn lockers(&self) -> &[Arc<dyn NetLocker>] {
        &self.lockers
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Nodes that hold the lock replicas of `resource`
    pub fn replica_set(&self, resource: &str) -> Vec<usize> {
        match self.config.replicas {
            Some(n) if n < self.lockers.len() => select_replica_indices(resource, &self.addresses, n),
            _ => (0..self.lockers.len()).collect(),
        }
    }

    /// Grants needed among `n` nodes
    pub fn quorum(&self, kind: LockKind, n: usize) -> usize {
        let configured = match kind {
            LockKind::Write => self.config.write_quorum,
            LockKind::Read => self.config.read_quorum,
        };
        configured.map_or(majority(n), |q| q.clamp(majority(n), n.max(1)))
    }

    fn args_for(&self, idx: usize, uid: &str, resource: &str) -> LockArgs {
        LockArgs::new(uid, resource, self.node.clone(), self.lockers[idx].service_endpoint())
    }

    async fn fan_out(
        &self,
        op: LockOp,
        nodes: &[usize],
        uid: &str,
        resource: &str,
    ) -> Vec<(usize, CallOutcome)> {
        let timeout = self.config.call_timeout();
        let calls = nodes.iter().map(|&idx| {
            let locker = self.lockers[idx].clone();
            let args = self.args_for(idx, uid, resource);
            async move {
                let outcome = match with_deadline(timeout, "lock call", locker.call(op, &args)).await {
                    Ok(true) => CallOutcome::Granted,
                    Ok(false) => CallOutcome::Denied,
                    Err(e) => {
                        tracing::debug!(
                            server = %locker.address(),
                            resource = %args.resource,
                            "{} failed: {}",
                            op,
                            e
                        );
                        CallOutcome::Failed
                    }
                };
                (idx, outcome)
            }
        });
        join_all(calls).await
    }

    /// Send `op` to every node in `nodes` with bounded retries.
    /// Returns (released, failed); misuse replies mean "already released".
    async fn release_on(
        &self,
        op: LockOp,
        nodes: &[usize],
        uid: &str,
        resource: &str,
    ) -> (Vec<usize>, Vec<usize>) {
        let timeout = self.config.call_timeout();
        let retries = self.config.release_retries;
        let backoff = self.config.retry_backoff();

        let calls = nodes.iter().map(|&idx| {
            let locker = self.lockers[idx].clone();
            let args = self.args_for(idx, uid, resource);
            async move {
                let result = retry_with_backoff(
                    || with_deadline(timeout, "release", locker.call(op, &args)),
                    retries,
                    backoff,
                )
                .await;
                match result {
                    Ok(_) => (idx, true),
                    Err(e) if e.is_misuse() => {
                        tracing::debug!(
                            server = %locker.address(),
                            resource = %args.resource,
                            uid = %args.uid,
                            "{} on already released lock: {}",
                            op,
                            e
                        );
                        (idx, true)
                    }
                    Err(e) => {
                        tracing::warn!(
                            server = %locker.address(),
                            resource = %args.resource,
                            uid = %args.uid,
                            "{} failed after {} attempts: {}",
                            op,
                            retries,
                            e
                        );
                        (idx, false)
                    }
                }
            }
        });

        let mut released = Vec::new();
        let mut failed = Vec::new();
        for (idx, ok) in join_all(calls).await {
            if ok {
                released.push(idx);
            } else {
                failed.push(idx);
            }
        }
        (released, failed)
    }

    fn defer_to_reaper(&self, resource: &str, uid: &str, kind: LockKind) {
        match &self.reaper {
            Some(reaper) => reaper.report(StaleLock {
                resource: resource.to_string(),
                uid: uid.to_string(),
                owner: self.node.clone(),
                kind,
                nodes: self.replica_set(resource),
            }),
            None => tracing::warn!(
                resource = %resource,
                uid = %uid,
                "cleanup incomplete and no reaper attached"
            ),
        }
    }

    /// One attempt at a quorum lock. `None` means the quorum was not reached and the
    /// partial grants were rolled back.
    pub async fn try_lock(&self, resource: &str, kind: LockKind) -> Result<Option<HeldLock>> {
        validate_resource(resource)?;

        let uid = generate_uid();
        let nodes = self.replica_set(resource);
        let needed = self.quorum(kind, nodes.len());

        let outcomes = self.fan_out(kind.acquire_op(), &nodes, &uid, resource).await;

        let mut granted = Vec::new();
        let mut unanswered = 0;
        for (idx, outcome) in outcomes {
            match outcome {
                CallOutcome::Granted => granted.push(idx),
                CallOutcome::Denied => {}
                CallOutcome::Failed => unanswered += 1,
            }
        }

        if granted.len() >= needed {
            tracing::debug!(
                resource = %resource,
                uid = %uid,
                kind = %kind,
                granted = granted.len(),
                nodes = nodes.len(),
                "lock acquired"
            );
            return Ok(Some(HeldLock {
                resource: resource.to_string(),
                uid,
                kind,
                nodes: granted,
                acquired_at: Utc::now(),
            }));
        }

        tracing::debug!(
            resource = %resource,
            uid = %uid,
            kind = %kind,
            granted = granted.len(),
            needed,
            "quorum not reached, releasing partial grants"
        );

        let (_, failed) = self
            .release_on(kind.release_op(), &granted, &uid, resource)
            .await;

        // A call that failed may still have been granted after we stopped waiting.
        if !failed.is_empty() || unanswered > 0 {
            self.defer_to_reaper(resource, &uid, kind);
        }

        Ok(None)
    }

    /// Retry `try_lock` with randomised backoff until granted or `timeout` elapses
    pub async fn acquire(
        &self,
        resource: &str,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<HeldLock> {
        let deadline = Instant::now() + timeout;
        let base = self.config.retry_backoff().max(Duration::from_millis(10));
        let mut attempt: u32 = 0;

        loop {
            if let Some(held) = self.try_lock(resource, kind).await? {
                return Ok(held);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "{} lock on {} not acquired within {:?}",
                    kind, resource, timeout
                )));
            }

            attempt = attempt.saturating_add(1);
            let ceiling = base.saturating_mul(1 << attempt.min(4));
            let pause = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(base.as_millis() as u64..=ceiling.as_millis() as u64))
            };
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    /// Acquire an exclusive lock within the configured acquire timeout
    pub async fn lock(&self, resource: &str) -> Result<HeldLock> {
        self.acquire(resource, LockKind::Write, self.config.acquire_timeout())
            .await
    }

    /// Acquire a shared lock within the configured acquire timeout
    pub async fn rlock(&self, resource: &str) -> Result<HeldLock> {
        self.acquire(resource, LockKind::Read, self.config.acquire_timeout())
            .await
    }

    /// Release a held lock on every node that granted it.
    ///
    /// Succeeds once a majority of those nodes confirmed; nodes that could not be
    /// reached are left to the reaper.
    pub async fn unlock(&self, held: HeldLock) -> Result<()> {
        let (released, failed) = self
            .release_on(held.kind.release_op(), &held.nodes, &held.uid, &held.resource)
            .await;

        if !failed.is_empty() {
            self.defer_to_reaper(&held.resource, &held.uid, held.kind);
        }

        let needed = majority(held.nodes.len());
        if released.len() < needed {
            return Err(Error::QuorumNotReached {
                achieved: released.len(),
                needed,
            });
        }

        tracing::debug!(
            resource = %held.resource,
            uid = %held.uid,
            released = released.len(),
            "lock released"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::net_locker::LocalLocker;
    use crate::server::locker::LockServer;

    fn cluster(n: usize) -> (Vec<Arc<LockServer>>, QuorumCoordinator) {
        let servers: Vec<Arc<LockServer>> = (0..n)
            .map(|i| Arc::new(LockServer::new(format!("/minilock/lock/disk{}", i))))
            .collect();
        let lockers: Vec<Arc<dyn NetLocker>> = servers
            .iter()
            .map(|s| Arc::new(LocalLocker::new(s.clone())) as Arc<dyn NetLocker>)
            .collect();
        let coordinator = QuorumCoordinator::new("client-1", lockers, QuorumConfig::default()).unwrap();
        (servers, coordinator)
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn test_quorum_overrides_clamped() {
        let (_, coordinator) = cluster(4);
        assert_eq!(coordinator.quorum(LockKind::Write, 4), 3);

        let mut config = QuorumConfig::default();
        config.write_quorum = Some(1);
        config.read_quorum = Some(9);
        let coordinator = QuorumCoordinator::new("c", coordinator.lockers().to_vec(), config).unwrap();
        assert_eq!(coordinator.quorum(LockKind::Write, 4), 3);
        assert_eq!(coordinator.quorum(LockKind::Read, 4), 4);
    }

    #[test]
    fn test_replica_subset() {
        let (_, coordinator) = cluster(5);
        let mut config = QuorumConfig::default();
        config.replicas = Some(3);
        let coordinator = QuorumCoordinator::new("c", coordinator.lockers().to_vec(), config).unwrap();

        let set = coordinator.replica_set("bucket/object");
        assert_eq!(set.len(), 3);
        assert_eq!(set, coordinator.replica_set("bucket/object"));
    }

    #[tokio::test]
    async fn test_lock_unlock_all_nodes() {
        let (servers, coordinator) = cluster(4);

        let held = coordinator
            .try_lock("bucket/object", LockKind::Write)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.nodes.len(), 4);
        for server in &servers {
            let holders = server.holders("bucket/object");
            assert_eq!(holders.len(), 1);
            assert_eq!(holders[0].uid, held.uid);
            assert_eq!(holders[0].node, "client-1");
        }

        coordinator.unlock(held).await.unwrap();
        assert!(servers.iter().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn test_second_writer_denied() {
        let (_, coordinator) = cluster(3);
        let held = coordinator
            .try_lock("bucket/object", LockKind::Write)
            .await
            .unwrap();
        assert!(held.is_some());
        assert!(coordinator
            .try_lock("bucket/object", LockKind::Write)
            .await
            .unwrap()
            .is_none());
        assert!(coordinator
            .try_lock("bucket/object", LockKind::Read)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_readers_share() {
        let (servers, coordinator) = cluster(3);
        let a = coordinator.rlock("bucket/object").await.unwrap();
        let b = coordinator.rlock("bucket/object").await.unwrap();
        assert_ne!(a.uid, b.uid);
        assert_eq!(servers[0].holders("bucket/object").len(), 2);

        coordinator.unlock(a).await.unwrap();
        let remaining = servers[0].holders("bucket/object");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].uid, b.uid);
    }

    #[tokio::test]
    async fn test_acquire_times_out_under_contention() {
        let (_, coordinator) = cluster(3);
        let _held = coordinator.lock("bucket/object").await.unwrap();

        let err = coordinator
            .acquire("bucket/object", LockKind::Write, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unlock_tolerates_already_released() {
        let (servers, coordinator) = cluster(3);
        let held = coordinator.lock("bucket/object").await.unwrap();

        let force = LockArgs::force("bucket/object", "admin", servers[0].service_endpoint());
        servers[0].force_unlock(&force).unwrap();

        coordinator.unlock(held).await.unwrap();
        assert!(servers.iter().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn test_invalid_resource() {
        let (_, coordinator) = cluster(3);
        assert!(matches!(
            coordinator.try_lock("", LockKind::Write).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
