// Configuration schema for the RPC layer.
// Numan Thabit 2025

use std::{
    env, fmt, fs,
    io::{self, Read},
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::identity::{DEFAULT_POW_THRESHOLD, MAX_POW_THRESHOLD};

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV: &str = "UDPRPC_CONFIG";

/// Environment variable selecting the active network.
pub const NETWORK_ENV: &str = "UDPRPC_NETWORK";

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Protocol timing and logging knobs.
    pub rpc: RpcSettings,
    /// Per-network parameters.
    pub networks: Networks,
}

impl Config {
    /// Loads configuration from `UDPRPC_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Returns the active network based on `UDPRPC_NETWORK` or the provided fallback.
    pub fn active_network(&self, fallback: NetworkName) -> (NetworkName, &NetworkParams) {
        let name = env::var(NETWORK_ENV)
            .ok()
            .and_then(|value| NetworkName::from_str(&value).ok())
            .unwrap_or(fallback);
        (name, self.networks.get(name))
    }

    /// Flattens the settings for `network` into the runtime [`RpcConfig`].
    pub fn rpc_config(&self, network: NetworkName) -> RpcConfig {
        RpcConfig {
            wait_timeout: Duration::from_secs(self.rpc.wait_timeout_secs),
            noisy: self.rpc.noisy,
            testnet: network == NetworkName::Testnet,
            pow_threshold: self.rpc.pow_threshold,
            rendezvous: self.networks.get(network).rendezvous,
        }
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc.validate().map_err(ConfigError::Validation)?;
        for name in [NetworkName::Mainnet, NetworkName::Testnet] {
            self.networks
                .get(name)
                .validate()
                .map_err(|msg| ConfigError::Validation(format!("{name}: {msg}")))?;
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Protocol settings shared by every network.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Seconds to wait for a response before each retry stage.
    pub wait_timeout_secs: u64,
    /// Emit per-message debug logs.
    pub noisy: bool,
    /// Proof-of-work gate for first-contact identities.
    pub pow_threshold: u32,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 5,
            noisy: true,
            pow_threshold: DEFAULT_POW_THRESHOLD,
        }
    }
}

impl RpcSettings {
    fn validate(&self) -> Result<(), String> {
        if self.wait_timeout_secs == 0 {
            return Err("rpc.wait_timeout_secs must be > 0".into());
        }
        if self.pow_threshold == 0 || self.pow_threshold > MAX_POW_THRESHOLD {
            return Err(format!(
                "rpc.pow_threshold must lie within [1, {MAX_POW_THRESHOLD}]"
            ));
        }
        Ok(())
    }
}

/// Network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkName {
    /// Production network.
    Mainnet,
    /// Test network; envelopes carry the testnet flag.
    Testnet,
}

impl FromStr for NetworkName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(NetworkName::Mainnet),
            "testnet" | "test" => Ok(NetworkName::Testnet),
            other => Err(ConfigError::Validation(format!(
                "unknown network '{other}'; expected mainnet or testnet"
            ))),
        }
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkName::Mainnet => f.write_str("mainnet"),
            NetworkName::Testnet => f.write_str("testnet"),
        }
    }
}

/// Parameters for each network.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Networks {
    #[serde(default = "NetworkParams::mainnet_defaults")]
    pub mainnet: NetworkParams,
    #[serde(default = "NetworkParams::testnet_defaults")]
    pub testnet: NetworkParams,
}

impl Default for Networks {
    fn default() -> Self {
        Self {
            mainnet: NetworkParams::mainnet_defaults(),
            testnet: NetworkParams::testnet_defaults(),
        }
    }
}

impl Networks {
    /// Returns the parameters for `name`.
    pub fn get(&self, name: NetworkName) -> &NetworkParams {
        match name {
            NetworkName::Mainnet => &self.mainnet,
            NetworkName::Testnet => &self.testnet,
        }
    }
}

/// Per-network parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkParams {
    /// Well-known peer that relays hole-punch requests.
    pub rendezvous: SocketAddr,
}

impl NetworkParams {
    /// Placeholder rendezvous for mainnet; deployments override it.
    pub fn mainnet_defaults() -> Self {
        Self {
            rendezvous: SocketAddr::from(([192, 0, 2, 1], 18467)),
        }
    }

    /// Placeholder rendezvous for testnet; deployments override it.
    pub fn testnet_defaults() -> Self {
        Self {
            rendezvous: SocketAddr::from(([192, 0, 2, 1], 28467)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.rendezvous.port() == 0 {
            return Err("rendezvous port must be non-zero".into());
        }
        if self.rendezvous.ip().is_unspecified() {
            return Err("rendezvous address must be routable".into());
        }
        Ok(())
    }
}

/// Flattened settings handed to [`RpcProtocol`](crate::rpc::RpcProtocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Wait per retry stage; a call settles within twice this.
    pub wait_timeout: Duration,
    /// Emit per-message debug logs.
    pub noisy: bool,
    /// Local network mode; envelopes with the other flag are dropped.
    pub testnet: bool,
    /// Proof-of-work gate for first-contact identities.
    pub pow_threshold: u32,
    /// Hole-punch relay.
    pub rendezvous: SocketAddr,
}

impl RpcConfig {
    /// Configuration for the given rendezvous with default timing.
    pub fn new(rendezvous: SocketAddr) -> Self {
        Self {
            rendezvous,
            ..Self::default()
        }
    }

    /// Sets the per-stage wait.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Sets the network mode.
    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    /// Toggles per-message debug logging.
    pub fn with_noisy(mut self, noisy: bool) -> Self {
        self.noisy = noisy;
        self
    }

    /// Overrides the proof-of-work gate.
    pub fn with_pow_threshold(mut self, pow_threshold: u32) -> Self {
        self.pow_threshold = pow_threshold;
        self
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Config::default().rpc_config(NetworkName::Mainnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        let rpc = RpcConfig::default();
        assert_eq!(rpc.wait_timeout, Duration::from_secs(5));
        assert_eq!(rpc.pow_threshold, 50);
        assert!(!rpc.testnet);
        assert!(rpc.noisy);
    }

    #[test]
    fn zero_timeout_rejected() {
        let input = r#"
            [rpc]
            wait_timeout_secs = 0
        "#;

        let err = Config::from_toml_str(input).unwrap_err();
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("wait_timeout_secs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_threshold_rejected() {
        let input = r#"
            [rpc]
            pow_threshold = 16777217
        "#;
        assert!(matches!(
            Config::from_toml_str(input),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unspecified_rendezvous_rejected() {
        let input = r#"
            [networks.testnet]
            rendezvous = "0.0.0.0:28467"
        "#;
        let err = Config::from_toml_str(input).unwrap_err();
        assert!(err.to_string().contains("testnet"));
    }

    #[test]
    fn testnet_config_flattens() {
        let input = r#"
            [rpc]
            wait_timeout_secs = 2
            noisy = false

            [networks.testnet]
            rendezvous = "198.51.100.20:28467"
        "#;
        let cfg = Config::from_reader(input.as_bytes()).unwrap();
        let rpc = cfg.rpc_config(NetworkName::Testnet);
        assert_eq!(rpc.wait_timeout, Duration::from_secs(2));
        assert!(!rpc.noisy);
        assert!(rpc.testnet);
        assert_eq!(rpc.rendezvous, "198.51.100.20:28467".parse().unwrap());
        assert_eq!(
            cfg.rpc_config(NetworkName::Mainnet).rendezvous,
            NetworkParams::mainnet_defaults().rendezvous
        );
    }

    #[test]
    fn network_selection_from_env() {
        let cfg = Config::default();
        std::env::set_var(NETWORK_ENV, "testnet");
        let (name, params) = cfg.active_network(NetworkName::Mainnet);
        assert_eq!(name, NetworkName::Testnet);
        assert_eq!(params.rendezvous, NetworkParams::testnet_defaults().rendezvous);
        std::env::remove_var(NETWORK_ENV);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_path("/nonexistent/udprpc.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(NetworkName::from_str("regtest").is_err());
    }
}
