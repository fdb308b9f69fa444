use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::ArgMatches;
use config::{Config, File as ConfigFile};
use relay_network::{NetworkConfig, PeerAddress};
use serde::Deserialize;

/// Node configuration: the network layer's settings plus process concerns.
///
/// Layered as file, then `RELAY_` environment variables (nested keys use
/// `__`, e.g. `RELAY_NETWORK__NODE_NAME`), then command line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_format: String,
    /// Where the known-peers directory is kept; `None` keeps it in memory.
    pub known_peers_file: Option<PathBuf>,
    pub network: NetworkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            known_peers_file: Some(PathBuf::from("./data/known_peers.json")),
            network: NetworkConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!("configuration file {} does not exist", path.display());
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Apply command line overrides on top of the loaded layers.
    pub fn apply_matches(&mut self, matches: &ArgMatches) {
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.log_level = level.clone();
        }
        if let Some(format) = matches.get_one::<String>("log-format") {
            self.log_format = format.clone();
        }
        if let Some(path) = matches.get_one::<PathBuf>("known-peers-file") {
            self.known_peers_file = Some(path.clone());
        }
        if matches.get_flag("no-persist") {
            self.known_peers_file = None;
        }
        if let Some(bind) = matches.get_one::<SocketAddr>("bind") {
            self.network.bind_address = Some(*bind);
        }
        if let Some(declared) = matches.get_one::<PeerAddress>("declared-address") {
            self.network.declared_address = Some(*declared);
        }
        if let Some(peers) = matches.get_many::<PeerAddress>("peers") {
            for peer in peers {
                if !self.network.seed_peers.contains(peer) {
                    self.network.seed_peers.push(*peer);
                }
            }
        }
        if let Some(app_name) = matches.get_one::<String>("app-name") {
            self.network.app_name = app_name.clone();
        }
        if let Some(node_name) = matches.get_one::<String>("node-name") {
            self.network.node_name = node_name.clone();
        }
    }
}
