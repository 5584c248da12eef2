//! # minilock
//!
//! A quorum-based distributed lock manager:
//! - one lock server per node, holding an in-memory lock table
//! - exclusive (write) and shared (read) locks, granted without queuing
//! - a client-side coordinator that needs a strict majority of nodes to agree
//! - token-authenticated RPC between nodes
//! - a reaper that force-releases locks whose holders are gone
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │      QuorumCoordinator       │
//!            │  fan-out, count, roll back   │
//!            └──────┬───────────┬───────────┘
//!                   │ HTTP+JWT  │
//!   ┌───────────────┼───────────┼──────────────┐
//!   │               │           │              │
//! ┌─▼──────────┐ ┌──▼─────────┐ ┌▼───────────┐ ┌▼───────────┐
//! │ Node 1     │ │ Node 2     │ │ Node 3     │ │ Node 4     │
//! │ LockServer │ │ LockServer │ │ LockServer │ │ LockServer │
//! └────────────┘ └────────────┘ └────────────┘ └────────────┘
//!          ▲ Expired checks and releases from the Reaper
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minilock-server serve \
//!   --config ./minilock.toml \
//!   --local-host node1:9000 \
//!   --endpoints http://node1:9000/mnt/disk1,http://node2:9000/mnt/disk1,http://node3:9000/mnt/disk1
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Hold an exclusive lock for 30 seconds
//! minilock --config ./minilock.toml hold bucket/object --duration 30s
//!
//! # Ask every node whether a lock is still known
//! minilock probe bucket/object --uid 6f1c...
//!
//! # Clear a resource on every node
//! minilock force-unlock bucket/object
//! ```

pub mod client;
pub mod common;
pub mod server;

// Re-export commonly used types
pub use client::{HeldLock, QuorumCoordinator};
pub use common::{Config, Error, Result};
pub use server::NodeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
