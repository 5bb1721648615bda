use crate::network::Network;
use crate::simulation::DEFAULT_MAX_CONCURRENT_SIMULATIONS;
use serde::Deserialize;
use std::{io, net::SocketAddr, path::Path};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,
    pub listen_addr: SocketAddr,
    pub beacon_endpoints: Vec<String>,
    pub block_sim_url: String,
    /// Connection strings for the shared cache and the audit database.
    /// Deployments that wire networked implementations consume these; the
    /// bundled in-memory stores ignore them.
    pub redis_uri: String,
    pub postgres_dsn: String,
    /// Hex-encoded BLS secret key the relay signs its bids with.
    pub secret_key: String,
    pub db_table_prefix: String,
    pub blocksim_max_concurrent: usize,
    /// Bids and payloads for slots older than `head - horizon` are purged.
    pub gc_horizon_slots: u64,
    pub force_get_header_204: bool,
    pub disable_block_publishing: bool,
    pub disable_low_prio_builders: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            listen_addr: "0.0.0.0:9062".parse().expect("valid address"),
            beacon_endpoints: vec!["http://127.0.0.1:5052".to_string()],
            block_sim_url: "http://127.0.0.1:8545".to_string(),
            redis_uri: "127.0.0.1:6379".to_string(),
            postgres_dsn: String::new(),
            secret_key: String::new(),
            db_table_prefix: "dev".to_string(),
            blocksim_max_concurrent: DEFAULT_MAX_CONCURRENT_SIMULATIONS,
            gc_horizon_slots: 0,
            force_get_header_204: false,
            disable_block_publishing: false,
            disable_low_prio_builders: false,
        }
    }
}

impl Config {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_data = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = toml::from_str(&config_data)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment flags override whatever the file says, matching the
    /// operational surface of existing relay deployments.
    pub fn apply_env_overrides(&mut self) {
        if env_flag("FORCE_GET_HEADER_204") {
            warn!("env: FORCE_GET_HEADER_204 - forcing getHeader to always return 204");
            self.force_get_header_204 = true;
        }
        if env_flag("DISABLE_BLOCK_PUBLISHING") {
            warn!("env: DISABLE_BLOCK_PUBLISHING - not publishing blocks on getPayload");
            self.disable_block_publishing = true;
        }
        if env_flag("DISABLE_LOWPRIO_BUILDERS") {
            warn!("env: DISABLE_LOWPRIO_BUILDERS - allowing only high-prio builders");
            self.disable_low_prio_builders = true;
        }
        if let Ok(value) = std::env::var("BLOCKSIM_MAX_CONCURRENT") {
            match value.parse() {
                Ok(limit) => self.blocksim_max_concurrent = limit,
                Err(_) => warn!(%value, "ignoring unparseable BLOCKSIM_MAX_CONCURRENT"),
            }
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|value| value == "1").unwrap_or(false)
}

/// Flags frozen at startup; request handlers only ever read them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    pub force_get_header_204: bool,
    pub disable_block_publishing: bool,
    pub disable_low_prio_builders: bool,
}

impl From<&Config> for FeatureFlags {
    fn from(config: &Config) -> Self {
        Self {
            force_get_header_204: config.force_get_header_204,
            disable_block_publishing: config.disable_block_publishing,
            disable_low_prio_builders: config.disable_low_prio_builders,
        }
    }
}
