//! CLI for lock operations against a running cluster

use clap::{Parser, Subcommand};
use minilock::client::connect_cluster;
use minilock::common::types::{LockArgs, LockKind};
use minilock::common::parse_duration;
use minilock::server::NodeRegistry;
use minilock::{Config, QuorumCoordinator};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minilock")]
#[command(about = "minilock distributed lock CLI")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); endpoints and credentials are read from it
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a lock, hold it, then release it
    Hold {
        /// Resource name
        resource: String,

        /// Take a shared lock instead of an exclusive one
        #[arg(long)]
        read: bool,

        /// How long to hold the lock
        #[arg(long, default_value = "30s")]
        duration: String,
    },

    /// Ask every node whether a lock is still known
    Probe {
        /// Resource name
        resource: String,

        /// Lock uid
        #[arg(long)]
        uid: String,
    },

    /// Clear a resource on every node
    ForceUnlock {
        /// Resource name
        resource: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    let registry = NodeRegistry::new(&config.server.parse_endpoints()?);
    let lockers = connect_cluster(
        &registry,
        "",
        &[],
        &config.auth.credentials(),
        config.quorum.call_timeout(),
    )?;

    match cli.command {
        Commands::Hold {
            resource,
            read,
            duration,
        } => {
            let hold_for = parse_duration(&duration)?;
            let kind = if read { LockKind::Read } else { LockKind::Write };
            let coordinator =
                QuorumCoordinator::new(config.node_id.clone(), lockers, config.quorum.clone())?;

            let held = coordinator
                .acquire(&resource, kind, config.quorum.acquire_timeout())
                .await?;
            println!("Acquired {} lock on {}", kind, resource);
            println!("  uid: {}", held.uid);
            println!("  nodes: {}/{}", held.nodes.len(), registry.len());

            tokio::select! {
                _ = tokio::time::sleep(hold_for) => {}
                _ = tokio::signal::ctrl_c() => println!("Interrupted, releasing"),
            }

            coordinator.unlock(held).await?;
            println!("Released {}", resource);
        }

        Commands::Probe { resource, uid } => {
            println!("Probe of {} (uid {}):", resource, uid);
            for locker in &lockers {
                let args = LockArgs::new(
                    uid.clone(),
                    resource.clone(),
                    config.node_id.clone(),
                    locker.service_endpoint(),
                );
                match locker.expired(&args).await {
                    Ok(true) => println!("  {}: not held", locker.address()),
                    Ok(false) => println!("  {}: held", locker.address()),
                    Err(e) => println!("  {}: error: {}", locker.address(), e),
                }
            }
        }

        Commands::ForceUnlock { resource } => {
            println!("Force unlock of {}:", resource);
            for locker in &lockers {
                let args = LockArgs::force(
                    resource.clone(),
                    config.node_id.clone(),
                    locker.service_endpoint(),
                );
                match locker.force_unlock(&args).await {
                    Ok(_) => println!("  {}: cleared", locker.address()),
                    Err(e) => println!("  {}: error: {}", locker.address(), e),
                }
            }
        }
    }

    Ok(())
}
