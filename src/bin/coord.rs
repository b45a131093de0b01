//! Coordinator binary

use clap::{Parser, Subcommand};
use kvrelay::common::{Config, EngineFraming, NodeRole, ReplicationMode};
use kvrelay::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvrelay-coord")]
#[command(about = "kvrelay primary/secondary coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Config file (defaults to ./kvrelay.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node role: PRIMARY or SECONDARY
        #[arg(long)]
        role: Option<NodeRole>,

        /// Client-facing TCP port
        #[arg(long)]
        port: Option<u16>,

        /// Secondary coordinator address (primary only)
        #[arg(long)]
        secondary: Option<String>,

        /// Primary coordinator address, host:port (secondary only)
        #[arg(long)]
        primary: Option<String>,

        /// Storage engine Unix socket
        #[arg(long)]
        engine_socket: Option<PathBuf>,

        /// Use length-prefixed frames on the engine socket
        #[arg(long)]
        length_prefixed: bool,

        /// Replicate through the durable backlog instead of inline
        #[arg(long)]
        async_replication: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            role,
            port,
            secondary,
            primary,
            engine_socket,
            length_prefixed,
            async_replication,
        } => {
            // Load config from file and environment, then override with CLI arguments
            let mut config = Config::load_from(config.as_deref())?;
            init_tracing(&config.log_level);

            if role.is_some() {
                config.node_role = role;
            }
            if port.is_some() {
                config.node_tcp_port = port;
            }
            if secondary.is_some() {
                config.secondary_node_addr = secondary;
            }
            if primary.is_some() {
                config.primary_node_addr = primary;
            }
            if let Some(socket) = engine_socket {
                config.engine.socket_path = socket;
            }
            if length_prefixed {
                config.engine.framing = EngineFraming::LengthPrefixed;
            }
            if async_replication {
                config.replication.mode = ReplicationMode::Async;
            }

            let settings = match config.resolve().await {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::error!("FATAL: {}", e);
                    return Err(e.into());
                }
            };

            let coord = Coordinator::bind(settings).await?;
            coord.serve().await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
