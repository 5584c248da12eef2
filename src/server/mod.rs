//! Node side: lock table, authenticated RPC service, HTTP surface and placement

pub mod http;
pub mod locker;
pub mod registry;
pub mod rpc;
pub mod server;

pub use locker::LockServer;
pub use registry::{Endpoint, LockServerPlacement, NodeRegistry};
pub use rpc::{LockOp, LockRpcService};
pub use server::NodeServer;
