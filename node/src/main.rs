use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, Command};
use relay_network::{Orchestrator, PeerAddress};
use relay_storage::{FileStorage, NoopStorage, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app_config;
mod version;

use app_config::AppConfig;
use version::{git_commit_hash, RELAY_VERSION};

fn cli() -> Command {
    Command::new("relay-node")
        .version(RELAY_VERSION)
        .about("Relay peer-to-peer node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .value_parser(value_parser!(SocketAddr))
                .help("Listen for inbound peers on this address"),
        )
        .arg(
            Arg::new("declared-address")
                .long("declared-address")
                .value_name("ADDR")
                .value_parser(value_parser!(PeerAddress))
                .help("Address announced to peers in the handshake"),
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .value_name("ADDR[,ADDR...]")
                .value_parser(value_parser!(PeerAddress))
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help("Seed peers to dial on startup"),
        )
        .arg(
            Arg::new("app-name")
                .long("app-name")
                .value_name("NAME")
                .help("Network identifier; peers with a different one are rejected"),
        )
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .value_name("NAME")
                .help("Human readable node name sent in the handshake"),
        )
        .arg(
            Arg::new("known-peers-file")
                .long("known-peers-file")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Where the known peers directory is persisted"),
        )
        .arg(
            Arg::new("no-persist")
                .long("no-persist")
                .action(ArgAction::SetTrue)
                .conflicts_with("known-peers-file")
                .help("Keep known peers in memory only"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "compact"])
                .help("Log output format"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let mut config = AppConfig::load(config_path.as_deref())?;
    config.apply_matches(&matches);

    init_logging(&config)?;
    info!(
        version = RELAY_VERSION,
        commit = git_commit_hash(),
        "starting relay node"
    );
    if config.network.declared_address.is_none() {
        warn!("no declared address configured; peers will not learn how to reach us");
    }

    let storage: Arc<dyn Storage> = match &config.known_peers_file {
        Some(path) => {
            info!(path = %path.display(), "persisting known peers");
            Arc::new(FileStorage::new(path)?)
        }
        None => {
            info!("known peers are kept in memory only");
            Arc::new(NoopStorage)
        }
    };

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(config.network, storage, cancel.clone())?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });

    orchestrator.run().await?;
    info!("relay node stopped");
    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}
