//! Lock node binary

use clap::{Parser, Subcommand};
use minilock::{Config, NodeServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minilock-server")]
#[command(about = "minilock lock node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a lock node
    Serve {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Authority (host:port) of this node in the endpoint list
        #[arg(long)]
        local_host: Option<String>,

        /// Cluster endpoints (comma-separated)
        #[arg(long, value_delimiter = ',')]
        endpoints: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            local_host,
            endpoints,
        } => {
            // File and environment first, CLI arguments on top
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind.parse()?;
            }
            if let Some(local_host) = local_host {
                config.server.local_host = local_host;
            }
            if !endpoints.is_empty() {
                config.server.endpoints = endpoints;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            tracing::info!("minilock {}", minilock::BUILD_INFO);
            let node = NodeServer::new(config)?;
            node.serve().await?;
        }
    }

    Ok(())
}
