//! Per-node lock table and lock server
//!
//! The lock table maps a resource name to the holders currently granted on this node.
//! A writer entry is always alone; reader entries may pile up. Requests never queue:
//! a conflicting Lock/RLock is answered with `false` and the caller decides whether to
//! retry. Every operation runs under one mutex, so the six operations are linearizable
//! on a given node.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::common::types::{LockArgs, LockKind, LockRequesterInfo};
use crate::common::{validate_resource, Error, Result};

/// Resource name → holders in grant order
pub type LockTable = HashMap<String, Vec<LockRequesterInfo>>;

/// In-memory lock authority of one node
pub struct LockServer {
    service_endpoint: String,
    table: Mutex<LockTable>,
}

fn is_write_lock(entries: &[LockRequesterInfo]) -> bool {
    entries.len() == 1 && entries[0].writer
}

/// Remove the entry held by the requester in `args`; drops the key once empty.
fn remove_entry(table: &mut LockTable, args: &LockArgs) -> bool {
    let Some(entries) = table.get_mut(&args.resource) else {
        return false;
    };
    let Some(pos) = entries.iter().position(|e| e.matches(args)) else {
        return false;
    };
    entries.remove(pos);
    if entries.is_empty() {
        table.remove(&args.resource);
    }
    true
}

impl LockServer {
    pub fn new(service_endpoint: impl Into<String>) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            table: Mutex::new(LockTable::new()),
        }
    }

    /// RPC path this server is reachable under
    pub fn service_endpoint(&self) -> &str {
        &self.service_endpoint
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        // Every mutation leaves the table consistent before it can panic.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_grant_args(args: &LockArgs) -> Result<()> {
        validate_resource(&args.resource)?;
        if args.uid.is_empty() {
            return Err(Error::InvalidArgument("lock uid cannot be empty".into()));
        }
        Ok(())
    }

    /// Grant an exclusive lock if the resource is free
    pub fn lock(&self, args: &LockArgs) -> Result<bool> {
        Self::check_grant_args(args)?;
        let mut table = self.table();

        if table.get(&args.resource).is_some_and(|e| !e.is_empty()) {
            tracing::debug!(resource = %args.resource, uid = %args.uid, "write lock denied");
            return Ok(false);
        }

        table.insert(
            args.resource.clone(),
            vec![LockRequesterInfo::from_args(args, true)],
        );
        tracing::debug!(resource = %args.resource, uid = %args.uid, node = %args.node, "write lock granted");
        Ok(true)
    }

    /// Release an exclusive lock held by the requester in `args`
    pub fn unlock(&self, args: &LockArgs) -> Result<bool> {
        let mut table = self.table();

        let Some(entries) = table.get(&args.resource) else {
            return Err(Error::NotLocked {
                resource: args.resource.clone(),
            });
        };
        if !is_write_lock(entries) {
            return Err(Error::WrongLockKind {
                resource: args.resource.clone(),
                held: LockKind::Read,
            });
        }
        if !remove_entry(&mut table, args) {
            return Err(Error::HolderNotFound {
                resource: args.resource.clone(),
                uid: args.uid.clone(),
            });
        }

        tracing::debug!(resource = %args.resource, uid = %args.uid, "write lock released");
        Ok(true)
    }

    /// Grant a shared lock unless a writer holds the resource
    pub fn rlock(&self, args: &LockArgs) -> Result<bool> {
        Self::check_grant_args(args)?;
        let mut table = self.table();

        let entries = table.entry(args.resource.clone()).or_default();
        if is_write_lock(entries) {
            tracing::debug!(resource = %args.resource, uid = %args.uid, "read lock denied");
            return Ok(false);
        }

        entries.push(LockRequesterInfo::from_args(args, false));
        tracing::debug!(
            resource = %args.resource,
            uid = %args.uid,
            readers = entries.len(),
            "read lock granted"
        );
        Ok(true)
    }

    /// Release the shared lock held by the requester in `args`; other readers stay
    pub fn runlock(&self, args: &LockArgs) -> Result<bool> {
        let mut table = self.table();

        let Some(entries) = table.get(&args.resource) else {
            return Err(Error::NotLocked {
                resource: args.resource.clone(),
            });
        };
        if is_write_lock(entries) {
            return Err(Error::WrongLockKind {
                resource: args.resource.clone(),
                held: LockKind::Write,
            });
        }
        if !remove_entry(&mut table, args) {
            return Err(Error::HolderNotFound {
                resource: args.resource.clone(),
                uid: args.uid.clone(),
            });
        }

        tracing::debug!(resource = %args.resource, uid = %args.uid, "read lock released");
        Ok(true)
    }

    /// Drop every holder of the resource; the uid must be empty
    pub fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        if !args.uid.is_empty() {
            return Err(Error::ForceUnlockWithUid {
                uid: args.uid.clone(),
            });
        }

        let removed = self.table().remove(&args.resource);
        if let Some(entries) = removed {
            tracing::warn!(
                resource = %args.resource,
                holders = entries.len(),
                requested_by = %args.node,
                "lock force-released"
            );
        }
        Ok(true)
    }

    /// Is `(resource, uid)` unknown to this node?
    pub fn expired(&self, args: &LockArgs) -> Result<bool> {
        let table = self.table();
        let held = table
            .get(&args.resource)
            .is_some_and(|entries| entries.iter().any(|e| e.uid == args.uid));
        Ok(!held)
    }

    /// Current holders of a resource, in grant order
    pub fn holders(&self, resource: &str) -> Vec<LockRequesterInfo> {
        self.table().get(resource).cloned().unwrap_or_default()
    }

    /// Number of locked resources
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries granted more than `age` ago, as (resource, holder) pairs
    pub fn entries_older_than(&self, age: Duration) -> Vec<(String, LockRequesterInfo)> {
        let cutoff = ChronoDuration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };
        self.table()
            .iter()
            .flat_map(|(resource, entries)| {
                entries
                    .iter()
                    .filter(|e| e.timestamp <= cutoff)
                    .map(move |e| (resource.clone(), e.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(uid: &str) -> LockArgs {
        LockArgs::new(uid, "name", "node", "rpc-path")
    }

    /// (writer, uid) pairs of the current holders, timing info left out
    fn summary(server: &LockServer, resource: &str) -> Vec<(bool, String)> {
        server
            .holders(resource)
            .into_iter()
            .map(|e| {
                assert_eq!(e.node, "node");
                assert_eq!(e.service_endpoint, "rpc-path");
                (e.writer, e.uid)
            })
            .collect()
    }

    #[test]
    fn test_lock() {
        let server = LockServer::new("rpc-path");

        assert!(server.lock(&args("0123-4567")).unwrap());
        assert_eq!(
            summary(&server, "name"),
            vec![(true, "0123-4567".to_string())]
        );

        // Same resource, different uid: denied without error, table unchanged
        assert!(!server.lock(&args("89ab-cdef")).unwrap());
        assert_eq!(
            summary(&server, "name"),
            vec![(true, "0123-4567".to_string())]
        );
    }

    #[test]
    fn test_lock_denied_while_read_locked() {
        let server = LockServer::new("rpc-path");
        assert!(server.rlock(&args("reader")).unwrap());
        assert!(!server.lock(&args("writer")).unwrap());
        assert_eq!(summary(&server, "name"), vec![(false, "reader".to_string())]);
    }

    #[test]
    fn test_unlock() {
        let server = LockServer::new("rpc-path");
        let la = args("0123-4567");

        assert!(matches!(server.unlock(&la), Err(Error::NotLocked { .. })));

        assert!(server.lock(&la).unwrap());
        assert!(server.unlock(&la).unwrap());
        assert!(summary(&server, "name").is_empty());
        assert!(server.is_empty());
    }

    #[test]
    fn test_unlock_requires_matching_holder() {
        let server = LockServer::new("rpc-path");
        assert!(server.lock(&args("0123-4567")).unwrap());

        assert!(matches!(
            server.unlock(&args("89ab-cdef")),
            Err(Error::HolderNotFound { .. })
        ));
        let other_node = LockArgs::new("0123-4567", "name", "elsewhere", "rpc-path");
        assert!(server.unlock(&other_node).is_err());
        assert_eq!(summary(&server, "name").len(), 1);
    }

    #[test]
    fn test_unlock_on_read_lock() {
        let server = LockServer::new("rpc-path");
        assert!(server.rlock(&args("0123-4567")).unwrap());
        assert!(matches!(
            server.unlock(&args("0123-4567")),
            Err(Error::WrongLockKind { .. })
        ));
    }

    #[test]
    fn test_rlock() {
        let server = LockServer::new("rpc-path");

        assert!(server.rlock(&args("0123-4567")).unwrap());
        assert_eq!(
            summary(&server, "name"),
            vec![(false, "0123-4567".to_string())]
        );

        assert!(server.rlock(&args("89ab-cdef")).unwrap());
        assert_eq!(
            summary(&server, "name"),
            vec![
                (false, "0123-4567".to_string()),
                (false, "89ab-cdef".to_string())
            ]
        );
    }

    #[test]
    fn test_rlock_denied_while_write_locked() {
        let server = LockServer::new("rpc-path");
        assert!(server.lock(&args("writer")).unwrap());
        assert!(!server.rlock(&args("reader")).unwrap());
        assert_eq!(summary(&server, "name"), vec![(true, "writer".to_string())]);
    }

    #[test]
    fn test_runlock() {
        let server = LockServer::new("rpc-path");
        let la = args("0123-4567");
        let la2 = args("89ab-cdef");

        assert!(matches!(server.runlock(&la), Err(Error::NotLocked { .. })));

        assert!(server.rlock(&la).unwrap());
        assert!(server.rlock(&la2).unwrap());

        assert!(server.runlock(&la).unwrap());
        assert_eq!(
            summary(&server, "name"),
            vec![(false, "89ab-cdef".to_string())]
        );

        assert!(server.runlock(&la2).unwrap());
        assert!(summary(&server, "name").is_empty());
    }

    #[test]
    fn test_runlock_on_write_lock() {
        let server = LockServer::new("rpc-path");
        assert!(server.lock(&args("0123-4567")).unwrap());
        assert!(matches!(
            server.runlock(&args("0123-4567")),
            Err(Error::WrongLockKind { .. })
        ));
        assert_eq!(summary(&server, "name").len(), 1);
    }

    #[test]
    fn test_force_unlock() {
        let server = LockServer::new("rpc-path");

        // Non-empty uid is refused whatever the table holds
        assert!(matches!(
            server.force_unlock(&args("1234-5678")),
            Err(Error::ForceUnlockWithUid { .. })
        ));

        // Unknown resource: still succeeds
        let force = args("");
        assert!(server.force_unlock(&force).unwrap());

        assert!(server.lock(&args("0123-4567")).unwrap());
        assert!(server.force_unlock(&force).unwrap());
        assert!(summary(&server, "name").is_empty());

        // Lock can be taken again and force-released once more
        assert!(server.lock(&args("0123-4567")).unwrap());
        assert!(server.force_unlock(&force).unwrap());
        assert!(server.is_empty());
    }

    #[test]
    fn test_force_unlock_clears_all_readers() {
        let server = LockServer::new("rpc-path");
        for uid in ["a", "b", "c"] {
            assert!(server.rlock(&args(uid)).unwrap());
        }
        assert!(server.force_unlock(&args("")).unwrap());
        assert!(server.holders("name").is_empty());
    }

    #[test]
    fn test_expired() {
        let server = LockServer::new("rpc-path");
        let la = args("0123-4567");

        assert!(server.expired(&la).unwrap());

        assert!(server.lock(&la).unwrap());
        assert!(!server.expired(&la).unwrap());
        assert!(server.expired(&args("89ab-cdef")).unwrap());

        assert!(server.unlock(&la).unwrap());
        assert!(server.expired(&la).unwrap());
    }

    #[test]
    fn test_expired_for_reader() {
        let server = LockServer::new("rpc-path");
        assert!(server.rlock(&args("reader")).unwrap());
        assert!(!server.expired(&args("reader")).unwrap());
    }

    #[test]
    fn test_invalid_grant_args() {
        let server = LockServer::new("rpc-path");
        assert!(matches!(
            server.lock(&LockArgs::new("uid", "", "node", "rpc-path")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            server.rlock(&args("")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_entries_older_than() {
        let server = LockServer::new("rpc-path");
        assert!(server.lock(&args("0123-4567")).unwrap());

        assert!(server.entries_older_than(Duration::from_secs(60)).is_empty());

        let stale = server.entries_older_than(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "name");
        assert_eq!(stale[0].1.uid, "0123-4567");
    }

    #[test]
    fn test_entries_older_than_huge_age() {
        let server = LockServer::new("rpc-path");
        assert!(server.lock(&args("0123-4567")).unwrap());

        assert!(server.entries_older_than(Duration::MAX).is_empty());
        assert!(server
            .entries_older_than(Duration::from_secs(u64::MAX / 2))
            .is_empty());
        // In range for a time delta, but reaches before the earliest representable time
        assert!(server
            .entries_older_than(Duration::from_secs(9_000_000_000_000))
            .is_empty());
    }

    #[test]
    fn test_concurrent_writers_exclusive() {
        use std::sync::Arc;

        let server = Arc::new(LockServer::new("rpc-path"));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let server = server.clone();
                std::thread::spawn(move || server.lock(&args(&format!("uid-{}", i))).unwrap())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 1);
        assert_eq!(server.holders("name").len(), 1);
    }
}
