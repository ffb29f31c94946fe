//! Node configuration: a TOML file overlaid with command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use kestrel_chain::parameters::Network;

/// The configuration file and flag surface of `kestreld`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `prod` or `test`; selects magic, genesis, seeds, and address bytes.
    pub network: String,

    /// Root directory for the wallet store and logs.
    pub data_dir: PathBuf,

    /// Forced peer list; disables DNS seeding when non-empty.
    pub connect: Vec<SocketAddr>,

    /// The wallet passphrase. Required: private keys are never stored in
    /// the clear.
    pub passphrase: Option<String>,

    /// Console log verbosity, in `tracing` filter syntax.
    pub log_level: String,

    /// Override the network's default peer port.
    pub port: Option<u16>,

    /// Accept inbound connections.
    pub listen: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            network: "prod".to_owned(),
            data_dir: default_data_dir(),
            connect: Vec::new(),
            passphrase: None,
            log_level: "info".to_owned(),
            port: None,
            listen: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kestrel")
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|error| format!("cannot read {}: {}", path.display(), error))?;
        toml::from_str(&contents)
            .map_err(|error| format!("cannot parse {}: {}", path.display(), error))
    }

    pub fn network(&self) -> Result<Network, String> {
        self.network
            .parse()
            .map_err(|_| format!("unknown network {:?}", self.network))
    }

    pub fn peer_port(&self) -> u16 {
        match (self.port, self.network().ok()) {
            (Some(port), _) => port,
            (None, Some(network)) => network.default_port(),
            (None, None) => 8333,
        }
    }

    /// The sled database location under the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(match self.network.as_str() {
            "test" | "testnet" => "wallet-test",
            _ => "wallet",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.network().unwrap(), Network::Mainnet);
        assert_eq!(config.peer_port(), 8333);
        assert!(config.connect.is_empty());
        assert!(!config.listen);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
                network = "test"
                connect = ["203.0.113.5:18333"]
                log_level = "debug"
                passphrase = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(config.network().unwrap(), Network::Testnet);
        assert_eq!(config.peer_port(), 18333);
        assert_eq!(config.connect.len(), 1);
        assert_eq!(config.passphrase.as_deref(), Some("hunter2"));
        assert!(config.store_path().ends_with("wallet-test"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("no_such_option = 1").is_err());
    }
}
