//! Expiry reaper
//!
//! Background cleanup for locks whose owner is gone: a client that crashed while
//! holding a lock, or a release that could not reach every node. Each candidate is
//! checked with `Expired` on every node of its replica set. When a majority no longer
//! know the (resource, uid) pair, the holder is presumed dead and the nodes that still
//! report it get that exact entry released, so all replicas converge to "unlocked".
//! Other holders of the resource are never touched; `ForceUnlock` stays an operator
//! action.
//!
//! A node that gave no answer blocks the cleanup of that candidate: it is kept for the
//! next pass rather than acted on blindly.
//!
//! Mutual exclusion never depends on the reaper; it only keeps dead holders from
//! wedging a resource forever.

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use crate::client::net_locker::NetLocker;
use crate::client::quorum::majority;
use crate::common::config::{QuorumConfig, ReaperConfig};
use crate::common::types::{LockArgs, LockKind};
use crate::common::{retry_with_backoff, with_deadline, Result};
use crate::server::rpc::LockOp;

/// A lock presumed abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLock {
    pub resource: String,
    pub uid: String,
    /// Requester identity the entry was granted to
    pub owner: String,
    pub kind: LockKind,
    /// Nodes (registry indices) that may still hold an entry
    pub nodes: Vec<usize>,
}

/// Outcome of one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub checked: usize,
    /// Candidates whose replicas all converged to unlocked
    pub reclaimed: usize,
    /// Candidates still held by a majority
    pub live: usize,
    /// Candidates kept for the next pass
    pub deferred: usize,
    /// Candidates given up after too many passes
    pub dropped: usize,
}

#[derive(Debug)]
struct Candidate {
    lock: StaleLock,
    passes: u32,
}

enum Verdict {
    Reclaimed,
    Live,
    Unresolved,
}

/// Add a candidate, merging it into one already queued for the same (resource, uid)
fn enqueue(pending: &mut Vec<Candidate>, candidate: Candidate) -> bool {
    let lock = &candidate.lock;
    if let Some(existing) = pending
        .iter_mut()
        .find(|c| c.lock.resource == lock.resource && c.lock.uid == lock.uid)
    {
        for idx in &lock.nodes {
            if !existing.lock.nodes.contains(idx) {
                existing.lock.nodes.push(*idx);
            }
        }
        return false;
    }
    pending.push(candidate);
    true
}

pub struct Reaper {
    lockers: Vec<Arc<dyn NetLocker>>,
    quorum: QuorumConfig,
    config: ReaperConfig,
    pending: Mutex<Vec<Candidate>>,
}

impl Reaper {
    pub fn new(
        lockers: Vec<Arc<dyn NetLocker>>,
        quorum: QuorumConfig,
        config: ReaperConfig,
    ) -> Self {
        Self {
            lockers,
            quorum,
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a candidate; a (resource, uid) pair already queued is merged
    pub fn report(&self, lock: StaleLock) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (resource, uid) = (lock.resource.clone(), lock.uid.clone());
        if enqueue(&mut pending, Candidate { lock, passes: 0 }) {
            tracing::debug!(resource = %resource, uid = %uid, "queued for reaping");
            self.trim(&mut pending);
        }
    }

    fn trim(&self, pending: &mut Vec<Candidate>) {
        let excess = pending.len().saturating_sub(self.config.max_pending);
        if excess > 0 {
            for candidate in pending.drain(..excess) {
                tracing::warn!(
                    resource = %candidate.lock.resource,
                    uid = %candidate.lock.uid,
                    "reaper queue full, dropping oldest candidate"
                );
            }
        }
    }

    /// Candidates waiting for the next pass
    pub fn pending(&self) -> Vec<StaleLock> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.lock.clone())
            .collect()
    }

    fn args_for(&self, idx: usize, lock: &StaleLock) -> LockArgs {
        LockArgs::new(
            lock.uid.clone(),
            lock.resource.clone(),
            lock.owner.clone(),
            self.lockers[idx].service_endpoint(),
        )
    }

    async fn call_with_retries(&self, op: LockOp, idx: usize, lock: &StaleLock) -> Result<bool> {
        let locker = self.lockers[idx].clone();
        let args = self.args_for(idx, lock);
        let timeout = self.quorum.call_timeout();
        let result = retry_with_backoff(
            || with_deadline(timeout, "reaper call", locker.call(op, &args)),
            self.quorum.release_retries,
            self.quorum.retry_backoff(),
        )
        .await;

        if let Err(e) = &result {
            tracing::debug!(
                server = %locker.address(),
                resource = %args.resource,
                "{} failed: {}",
                op,
                e
            );
        }
        result
    }

    async fn reap(&self, lock: &StaleLock) -> Verdict {
        let nodes: Vec<usize> = lock
            .nodes
            .iter()
            .copied()
            .filter(|&idx| idx < self.lockers.len())
            .collect();
        if nodes.is_empty() {
            return Verdict::Reclaimed;
        }

        let checks = nodes.iter().map(|&idx| async move {
            let answer = self.call_with_retries(LockOp::Expired, idx, lock).await.ok();
            (idx, answer)
        });
        let answers = join_all(checks).await;

        let expired = answers.iter().filter(|(_, a)| *a == Some(true)).count();
        let holding: Vec<usize> = answers
            .iter()
            .filter(|(_, a)| *a == Some(false))
            .map(|(idx, _)| *idx)
            .collect();
        let unanswered = answers.iter().filter(|(_, a)| a.is_none()).count();
        let needed = majority(nodes.len());

        if expired < needed {
            return if holding.len() >= needed {
                Verdict::Live
            } else {
                Verdict::Unresolved
            };
        }

        let release = lock.kind.release_op();
        let releases = holding.iter().map(|&idx| async move {
            match self.call_with_retries(release, idx, lock).await {
                Ok(_) => true,
                // Already gone on that node
                Err(e) => e.is_misuse(),
            }
        });
        let released = join_all(releases).await.into_iter().all(|ok| ok);

        if !holding.is_empty() && released {
            tracing::info!(
                resource = %lock.resource,
                uid = %lock.uid,
                nodes = holding.len(),
                "released stale lock"
            );
        }

        if released && unanswered == 0 {
            Verdict::Reclaimed
        } else {
            Verdict::Unresolved
        }
    }

    /// Check every queued candidate once, up to `max_concurrent` at a time
    pub async fn run_pass(&self) -> ReapReport {
        let candidates = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut report = ReapReport {
            checked: candidates.len(),
            ..Default::default()
        };

        let outcomes: Vec<(Candidate, Verdict)> = stream::iter(candidates)
            .map(|candidate| async move {
                let verdict = self.reap(&candidate.lock).await;
                (candidate, verdict)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        let mut retained = Vec::new();
        for (mut candidate, verdict) in outcomes {
            match verdict {
                Verdict::Reclaimed => {
                    report.reclaimed += 1;
                    continue;
                }
                Verdict::Live => report.live += 1,
                Verdict::Unresolved => {}
            }

            candidate.passes += 1;
            if candidate.passes >= self.config.max_passes {
                tracing::warn!(
                    resource = %candidate.lock.resource,
                    uid = %candidate.lock.uid,
                    passes = candidate.passes,
                    "giving up on stale lock candidate"
                );
                report.dropped += 1;
            } else {
                report.deferred += 1;
                retained.push(candidate);
            }
        }

        if !retained.is_empty() {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            // Candidates reported during the pass are newer than the retained ones
            let fresh = std::mem::replace(&mut *pending, retained);
            for candidate in fresh {
                enqueue(&mut pending, candidate);
            }
            self.trim(&mut pending);
        }

        if report.checked > 0 {
            tracing::debug!(
                checked = report.checked,
                reclaimed = report.reclaimed,
                live = report.live,
                deferred = report.deferred,
                dropped = report.dropped,
                "reaper pass done"
            );
        }
        report
    }

    /// Run passes on the configured interval until the task is aborted
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_pass().await;
            }
        })
    }
}
