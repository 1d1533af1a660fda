use clap::{Parser, Subcommand};
use rmb_common::types::{DEFAULT_TOKEN_TTL_SECS, DEFAULT_TTL_SECS};
use rmb_common::KeyType;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default public relay.
pub const DEFAULT_RELAY: &str = "wss://relay.grid.tf";

/// CLI interface for the `rmb` operator tool.
#[derive(Parser)]
#[command(name = "rmb", about = "RMB peer toolkit")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay URL override (repeat for several relays).
    #[arg(long = "relay", global = true)]
    pub relays: Vec<String>,

    /// Signing key type override.
    #[arg(long, global = true)]
    pub key_type: Option<KeyType>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate a fresh 12-word mnemonic.
    Keygen,
    /// Print the account and E2E public keys derived from a mnemonic.
    Keys {
        /// BIP39 mnemonic phrase.
        #[arg(long, env = "RMB_MNEMONIC", hide_env_values = true)]
        mnemonic: String,
    },
    /// Print the authenticated relay URL for every configured relay.
    Token {
        /// BIP39 mnemonic phrase.
        #[arg(long, env = "RMB_MNEMONIC", hide_env_values = true)]
        mnemonic: String,
        /// Twin id the token is issued for.
        #[arg(long)]
        twin: u32,
        /// Session name to embed in the token.
        #[arg(long)]
        session: Option<String>,
    },
    /// Load and validate configuration, then print the effective values.
    Check,
}

/// Runtime configuration for a peer, loaded from defaults, file and env.
#[derive(Debug, Deserialize, Clone)]
pub struct PeerConfig {
    /// Relay WebSocket URLs; one connection is kept per entry.
    pub relays: Vec<String>,
    /// Curve family used for the signing identity.
    pub key_type: KeyType,
    /// Session name distinguishing this process from other peers of the same twin.
    #[serde(default)]
    pub session: Option<String>,
    /// E2E encryption settings.
    pub encryption: EncryptionConfig,
    /// Relay liveness settings.
    pub keepalive: KeepaliveConfig,
    /// Reconnect backoff settings.
    pub reconnect: ReconnectConfig,
    /// Directory cache settings.
    pub directory: DirectoryConfig,
    /// RPC client settings.
    pub rpc: RpcConfig,
    /// Lifetime of the relay bearer token, in seconds.
    pub token_ttl_s: u64,
}

/// E2E encryption toggle.
#[derive(Debug, Deserialize, Clone)]
pub struct EncryptionConfig {
    /// Whether this peer publishes an E2E key and accepts cipher payloads.
    pub enabled: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Relay liveness parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between WebSocket pings, in seconds.
    pub ping_interval_s: u64,
    /// Maximum silence after the last inbound frame or pong, in seconds.
    pub pong_wait_s: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_s: 20,
            pong_wait_s: 40,
        }
    }
}

impl KeepaliveConfig {
    /// Ping interval as a [`Duration`].
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_s)
    }

    /// Stall threshold as a [`Duration`].
    #[must_use]
    pub const fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_s)
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 2000,
            backoff_factor: 1.0,
        }
    }
}

/// Directory cache parameters.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct DirectoryConfig {
    /// Entry lifetime in seconds; 0 caches forever.
    pub cache_ttl_s: u64,
}

impl DirectoryConfig {
    /// Cache lifetime, `None` when entries never expire.
    #[must_use]
    pub const fn cache_ttl(&self) -> Option<Duration> {
        if self.cache_ttl_s == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache_ttl_s))
        }
    }
}

/// RPC client parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    /// Deadline applied to calls made without an explicit timeout, in seconds.
    pub call_timeout_s: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_s: DEFAULT_TTL_SECS,
        }
    }
}

impl RpcConfig {
    /// Default call deadline as a [`Duration`].
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_s)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relays: vec![DEFAULT_RELAY.to_string()],
            key_type: KeyType::default(),
            session: None,
            encryption: EncryptionConfig::default(),
            keepalive: KeepaliveConfig::default(),
            reconnect: ReconnectConfig::default(),
            directory: DirectoryConfig::default(),
            rpc: RpcConfig::default(),
            token_ttl_s: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl PeerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relays.is_empty() {
            return Err("at least one relay URL is required".to_string());
        }
        for relay in &self.relays {
            if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
                return Err(format!(
                    "relay URL must start with ws:// or wss://, got: {relay}"
                ));
            }
            let parsed =
                url::Url::parse(relay).map_err(|e| format!("invalid relay URL {relay}: {e}"))?;
            if parsed.host_str().is_none() {
                return Err(format!("relay URL has no host: {relay}"));
            }
        }

        if matches!(self.session.as_deref(), Some("")) {
            return Err("session must not be an empty string".to_string());
        }

        if self.keepalive.ping_interval_s == 0 {
            return Err("keepalive.ping_interval_s must be greater than 0".to_string());
        }
        if self.keepalive.pong_wait_s <= self.keepalive.ping_interval_s {
            return Err("keepalive.pong_wait_s must be greater than ping_interval_s".to_string());
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }

        if self.rpc.call_timeout_s == 0 {
            return Err("rpc.call_timeout_s must be greater than 0".to_string());
        }
        if self.token_ttl_s == 0 {
            return Err("token_ttl_s must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Loads configuration from defaults, an optional TOML file and `RMB_*`
/// environment variables, in increasing order of precedence.
///
/// Nested keys use a double underscore in the environment, e.g.
/// `RMB_RECONNECT__INITIAL_DELAY_MS`. `RMB_RELAYS` takes a comma-separated list.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PeerConfig> {
    let defaults = PeerConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relays", defaults.relays.clone())?
        .set_default("key_type", defaults.key_type.as_str())?
        .set_default("encryption.enabled", defaults.encryption.enabled)?
        .set_default(
            "keepalive.ping_interval_s",
            defaults.keepalive.ping_interval_s as i64,
        )?
        .set_default(
            "keepalive.pong_wait_s",
            defaults.keepalive.pong_wait_s as i64,
        )?
        .set_default(
            "reconnect.initial_delay_ms",
            defaults.reconnect.initial_delay_ms as i64,
        )?
        .set_default(
            "reconnect.max_delay_ms",
            defaults.reconnect.max_delay_ms as i64,
        )?
        .set_default(
            "reconnect.backoff_factor",
            defaults.reconnect.backoff_factor,
        )?
        .set_default(
            "directory.cache_ttl_s",
            defaults.directory.cache_ttl_s as i64,
        )?
        .set_default("rpc.call_timeout_s", defaults.rpc.call_timeout_s as i64)?
        .set_default("token_ttl_s", defaults.token_ttl_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RMB")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("relays")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: PeerConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;
    use std::io::Write;

    #[test]
    fn test_peer_config_default_has_expected_values() {
        let config = PeerConfig::default();

        assert_eq!(config.relays, vec!["wss://relay.grid.tf".to_string()]);
        assert_eq!(config.key_type, KeyType::Sr25519);
        assert!(config.session.is_none());
        assert!(config.encryption.enabled);
        assert_eq!(config.token_ttl_s, 60);
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/rmb.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.relays, vec!["wss://relay.grid.tf".to_string()]);
        assert_eq!(config.keepalive.ping_interval_s, 20);
        assert_eq!(config.rpc.call_timeout_s, 300);
    }

    #[test]
    fn test_load_config_reads_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            r#"
relays = ["wss://relay.one.example", "wss://relay.two.example"]
key_type = "ed25519"
session = "worker"

[encryption]
enabled = false

[directory]
cache_ttl_s = 600
"#
        )
        .expect("write config");

        let config = load_config(Some(file.path())).expect("load_config");
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.key_type, KeyType::Ed25519);
        assert_eq!(config.session.as_deref(), Some("worker"));
        assert!(!config.encryption.enabled);
        assert_eq!(config.directory.cache_ttl(), Some(Duration::from_secs(600)));
        // untouched sections keep their defaults
        assert_eq!(config.keepalive.pong_wait_s, 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_reconnect_config_default_is_fixed_two_seconds() {
        let config = ReconnectConfig::default();

        assert_eq!(config.initial_delay_ms, 2000);
        assert_eq!(config.max_delay_ms, 2000);
        assert_eq!(config.backoff_factor, 1.0);
    }

    #[test]
    fn test_keepalive_config_defaults() {
        let config = KeepaliveConfig::default();

        assert_eq!(config.ping_interval(), Duration::from_secs(20));
        assert_eq!(config.pong_wait(), Duration::from_secs(40));
    }

    #[test]
    fn test_directory_cache_ttl_zero_means_forever() {
        assert_eq!(DirectoryConfig::default().cache_ttl(), None);
    }

    #[test]
    fn test_default_config_passes_validation() {
        let config = PeerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_relay_list() {
        let mut config = PeerConfig::default();
        config.relays.clear();
        assert!(config.validate().unwrap_err().contains("at least one relay"));
    }

    #[test]
    fn test_validate_rejects_invalid_relay_scheme() {
        let mut config = PeerConfig::default();
        config.relays = vec!["http://example.com".to_string()];
        assert!(config.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn test_validate_rejects_hostless_relay() {
        let mut config = PeerConfig::default();
        config.relays = vec!["ws://".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_session() {
        let mut config = PeerConfig::default();
        config.session = Some(String::new());
        assert!(config.validate().unwrap_err().contains("session"));
    }

    #[test]
    fn test_validate_rejects_zero_ping_interval() {
        let mut config = PeerConfig::default();
        config.keepalive.ping_interval_s = 0;
        assert!(config.validate().unwrap_err().contains("ping_interval_s"));
    }

    #[test]
    fn test_validate_rejects_pong_wait_not_above_ping_interval() {
        let mut config = PeerConfig::default();
        config.keepalive.pong_wait_s = config.keepalive.ping_interval_s;
        assert!(config.validate().unwrap_err().contains("pong_wait_s"));
    }

    #[test]
    fn test_validate_rejects_zero_initial_delay() {
        let mut config = PeerConfig::default();
        config.reconnect.initial_delay_ms = 0;
        assert!(config.validate().unwrap_err().contains("initial_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_max_delay_less_than_initial() {
        let mut config = PeerConfig::default();
        config.reconnect.initial_delay_ms = 1000;
        config.reconnect.max_delay_ms = 500;
        assert!(config.validate().unwrap_err().contains("max_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_non_finite_backoff_factor() {
        let mut config = PeerConfig::default();
        config.reconnect.backoff_factor = f64::NAN;
        assert!(config.validate().unwrap_err().contains("backoff_factor"));
    }

    #[test]
    fn test_validate_rejects_zero_token_ttl() {
        let mut config = PeerConfig::default();
        config.token_ttl_s = 0;
        assert!(config.validate().unwrap_err().contains("token_ttl_s"));
    }
}
