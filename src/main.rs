//! DMQ node - gossip membership and broadcast messaging
//!
//! Entry point for the `dmq-node` binary. The node binds a TCP listener,
//! contacts its seed nodes, then keeps gossiping until Ctrl+C.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use dmq_node::config::{self, NodeConfig};
use dmq_node::dmq::{Dmq, InboundHandler};
use dmq_node::error::{Error, Result};
use dmq_node::transport::{self, TcpTransport};
use dmq_node::{logging, version};

use crate::cli::{Cli, Commands, ConfigSubcommand};

/// Interval of the status log line
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    if let Err(e) = try_main() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn try_main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run {
            config,
            listen,
            bootstrap,
        } => {
            let mut config = NodeConfig::load(config.as_deref())?;

            // CLI overrides win over file and environment
            if let Some(listen) = listen {
                config.transport.listen_addr = listen;
            }
            if !bootstrap.is_empty() {
                config.node.bootstrap_addresses = bootstrap;
            }
            config.validate()?;

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting DMQ node"
            );

            run_node(config)
        }
    }
}

/// Build the runtime and run the node until shutdown
fn run_node(config: NodeConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("dmq-node")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_node_main(config))
}

async fn async_node_main(config: NodeConfig) -> Result<()> {
    let dmq_config = config.dmq_config();
    info!(
        address = %dmq_config.server_address,
        workers = dmq_config.num_workers,
        ping_interval_ms = config.dmq.ping_interval_ms,
        hop_limit = dmq_config.hop_limit,
        seeds = dmq_config.bootstrap.len(),
        "Configuration loaded"
    );

    let transport = Arc::new(TcpTransport::new(config.tcp_config()));
    let dmq = Dmq::new(dmq_config, transport)?;

    let handler: Arc<dyn InboundHandler> = dmq.clone();
    let (listen_addr, listener_task) = transport::serve(config.listen_addr()?, handler, config.tcp_config()).await?;
    info!(addr = %listen_addr, "Listening for DMQ requests");

    dmq.start().await?;

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
    status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_timer.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown_signal => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
                } else {
                    info!("Shutdown signal received");
                }
                break;
            }

            _ = status_timer.tick() => {
                let status = dmq.status();
                info!(
                    known_nodes = status.known_nodes,
                    active_nodes = status.active_nodes,
                    peers = status.peers,
                    queue_depths = ?status.queue_depths,
                    jobs_completed = status.jobs_completed,
                    jobs_failed = status.jobs_failed,
                    "DMQ status"
                );
            }
        }
    }

    listener_task.abort();
    dmq.shutdown().await;
    info!("DMQ node stopped");
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", path.display());
        }
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
