//! Configuration system for the DMQ node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (DMQ_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dmq::membership::is_sip_uri;
use crate::dmq::DmqConfig;
use crate::error::{Error, Result};
use crate::transport::{TcpConfig, DEFAULT_SIP_PORT};

/// Largest hop limit accepted in configuration
pub const MAX_HOP_LIMIT: u32 = 16;

/// Shortest gossip period accepted in configuration
pub const MIN_PING_INTERVAL_MS: u64 = 1000;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and seed nodes
    pub node: NodeSettings,

    /// Worker pool and gossip settings
    pub dmq: DmqSettings,

    /// TCP transport settings
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Own SIP URI (derived from the hostname and listen port if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    /// Seed nodes contacted once at startup
    pub bootstrap_addresses: Vec<String>,
}

/// Worker pool and gossip settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmqSettings {
    /// Number of workers (0 = one per CPU)
    pub num_workers: usize,

    /// Gossip period in milliseconds
    pub ping_interval_ms: u64,

    /// Hop limit for membership messages
    pub hop_limit: u32,

    /// Evict nodes silent for this long in milliseconds (0 = never)
    pub stale_timeout_ms: u64,
}

/// TCP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Address the listener binds to
    pub listen_addr: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Time to wait for a remote reply in milliseconds
    pub response_timeout_ms: u64,

    /// Largest frame accepted or sent, in bytes
    pub max_message_size: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for DmqSettings {
    fn default() -> Self {
        Self {
            num_workers: 2,
            ping_interval_ms: 60_000,
            hop_limit: 1,
            stale_timeout_ms: 180_000,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_SIP_PORT),
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            // Current directory
            PathBuf::from("dmq-node.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("dmq-node").join("node.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".dmq-node").join("node.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/dmq-node/node.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("DMQ_SERVER_ADDRESS") {
            self.node.server_address = Some(val);
        }
        if let Ok(val) = std::env::var("DMQ_BOOTSTRAP") {
            self.node.bootstrap_addresses = split_list(&val);
        }

        // DMQ settings
        if let Ok(val) = std::env::var("DMQ_NUM_WORKERS") {
            if let Ok(n) = val.parse() {
                self.dmq.num_workers = n;
            }
        }
        if let Ok(val) = std::env::var("DMQ_PING_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.dmq.ping_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("DMQ_HOP_LIMIT") {
            if let Ok(n) = val.parse() {
                self.dmq.hop_limit = n;
            }
        }
        if let Ok(val) = std::env::var("DMQ_STALE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.dmq.stale_timeout_ms = n;
            }
        }

        // Transport settings
        if let Ok(val) = std::env::var("DMQ_LISTEN_ADDR") {
            self.transport.listen_addr = val;
        }
        if let Ok(val) = std::env::var("DMQ_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.transport.connect_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("DMQ_RESPONSE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.transport.response_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("DMQ_MAX_MESSAGE_SIZE") {
            if let Ok(n) = val.parse() {
                self.transport.max_message_size = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("DMQ_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("DMQ_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("DMQ_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref address) = self.node.server_address {
            if !is_sip_uri(address) {
                return Err(Error::config_field_invalid(
                    "node.server_address",
                    format!("'{}' is not a sip: or sips: URI", address),
                ));
            }
        }

        for seed in &self.node.bootstrap_addresses {
            if !is_sip_uri(seed) {
                return Err(Error::config_field_invalid(
                    "node.bootstrap_addresses",
                    format!("'{}' is not a sip: or sips: URI", seed),
                ));
            }
        }

        if self.dmq.ping_interval_ms < MIN_PING_INTERVAL_MS {
            return Err(Error::config_field_invalid(
                "dmq.ping_interval_ms",
                format!("ping_interval_ms must be at least {}", MIN_PING_INTERVAL_MS),
            ));
        }

        if self.dmq.hop_limit > MAX_HOP_LIMIT {
            return Err(Error::config_field_invalid(
                "dmq.hop_limit",
                format!("hop_limit must be between 0 and {}", MAX_HOP_LIMIT),
            ));
        }

        self.listen_addr()?;

        if self.transport.max_message_size == 0 {
            return Err(Error::config_field_invalid(
                "transport.max_message_size",
                "max_message_size must be greater than 0",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Parsed listener address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.transport.listen_addr.parse().map_err(|_| {
            Error::config_field_invalid(
                "transport.listen_addr",
                format!("'{}' is not a socket address", self.transport.listen_addr),
            )
        })
    }

    /// Own SIP URI: the configured one, or `sip:<hostname>:<listen port>`
    pub fn server_address(&self) -> String {
        if let Some(ref address) = self.node.server_address {
            return address.clone();
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let port = self
            .listen_addr()
            .map(|a| a.port())
            .unwrap_or(DEFAULT_SIP_PORT);
        format!("sip:{}:{}", host, port)
    }

    /// Worker count with 0 resolved to the CPU count
    pub fn effective_workers(&self) -> usize {
        match self.dmq.num_workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    /// Settings for the DMQ context
    pub fn dmq_config(&self) -> DmqConfig {
        DmqConfig {
            server_address: self.server_address(),
            num_workers: self.effective_workers(),
            ping_interval: Duration::from_millis(self.dmq.ping_interval_ms),
            hop_limit: self.dmq.hop_limit,
            stale_timeout: match self.dmq.stale_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            bootstrap: self.node.bootstrap_addresses.clone(),
        }
    }

    /// Settings for the TCP transport
    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.transport.response_timeout_ms),
            max_frame: self.transport.max_message_size,
            default_port: DEFAULT_SIP_PORT,
        }
    }
}

/// Split a comma-separated list, dropping empty items
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dmq-node")
                .join("node.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# DMQ Node Configuration

[node]
# Own SIP URI advertised to other nodes
# (defaults to sip:<hostname>:<listen port>)
# server_address = "sip:10.0.0.1:5060"

# Seed nodes contacted once at startup
bootstrap_addresses = []

[dmq]
# Number of workers executing peer jobs (0 = one per CPU)
num_workers = 2

# Gossip period in milliseconds
ping_interval_ms = 60000

# Hop limit for membership messages (1 = no re-forwarding)
hop_limit = 1

# Evict nodes silent for this long in milliseconds (0 = never)
stale_timeout_ms = 180000

[transport]
# Address the DMQ listener binds to
listen_addr = "0.0.0.0:5060"

# Connection timeout in milliseconds
connect_timeout_ms = 5000

# Time to wait for a remote reply in milliseconds
response_timeout_ms = 30000

# Largest frame accepted or sent, in bytes
max_message_size = 65536

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.dmq-node/logs/node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.dmq.num_workers, 2);
        assert_eq!(config.dmq.ping_interval_ms, 60_000);
        assert_eq!(config.dmq.hop_limit, 1);
        assert_eq!(config.transport.listen_addr, "0.0.0.0:5060");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("DMQ_BOOTSTRAP", "sip:seed1@h1, sip:seed2@h2,");
        env::set_var("DMQ_HOP_LIMIT", "3");
        env::set_var("DMQ_PING_INTERVAL_MS", "not-a-number");
        env::set_var("DMQ_MAX_MESSAGE_SIZE", "8192");

        let mut config = NodeConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.node.bootstrap_addresses, vec!["sip:seed1@h1", "sip:seed2@h2"]);
        assert_eq!(config.dmq.hop_limit, 3);
        assert_eq!(config.dmq.ping_interval_ms, 60_000);
        assert_eq!(config.transport.max_message_size, 8192);

        env::remove_var("DMQ_BOOTSTRAP");
        env::remove_var("DMQ_HOP_LIMIT");
        env::remove_var("DMQ_PING_INTERVAL_MS");
        env::remove_var("DMQ_MAX_MESSAGE_SIZE");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_bad_server_address() {
        let mut config = NodeConfig::default();
        config.node.server_address = Some("http://h1".to_string());

        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "node.server_address"));
    }

    #[test]
    fn test_validation_bad_seed() {
        let mut config = NodeConfig::default();
        config.node.bootstrap_addresses = vec!["h1:5060".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_limits() {
        let mut config = NodeConfig::default();
        config.dmq.ping_interval_ms = 10;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.dmq.hop_limit = MAX_HOP_LIMIT + 1;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.transport.listen_addr = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = NodeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_address_derived() {
        let mut config = NodeConfig::default();
        config.transport.listen_addr = "127.0.0.1:5080".to_string();

        let address = config.server_address();
        assert!(address.starts_with("sip:"));
        assert!(address.ends_with(":5080"));

        config.node.server_address = Some("sip:10.0.0.1:5060".to_string());
        assert_eq!(config.server_address(), "sip:10.0.0.1:5060");
    }

    #[test]
    fn test_dmq_config_conversion() {
        let mut config = NodeConfig::default();
        config.node.server_address = Some("sip:a@h0".to_string());
        config.dmq.stale_timeout_ms = 0;
        config.dmq.num_workers = 0;

        let dmq = config.dmq_config();
        assert_eq!(dmq.server_address, "sip:a@h0");
        assert_eq!(dmq.ping_interval, Duration::from_secs(60));
        assert!(dmq.stale_timeout.is_none());
        assert!(dmq.num_workers >= 1);
    }

    #[test]
    fn test_default_template_parses() {
        let config: NodeConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.max_message_size, 65536);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[node]
server_address = "sip:10.0.0.1:5060"
bootstrap_addresses = ["sip:10.0.0.2:5060"]

[dmq]
num_workers = 4
hop_limit = 2

[logging]
level = "debug"
"#;

        let config: NodeConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.node.server_address.as_deref(), Some("sip:10.0.0.1:5060"));
        assert_eq!(config.node.bootstrap_addresses, vec!["sip:10.0.0.2:5060"]);
        assert_eq!(config.dmq.num_workers, 4);
        assert_eq!(config.dmq.hop_limit, 2);
        assert_eq!(config.dmq.ping_interval_ms, 60_000);
        assert_eq!(config.logging.level, "debug");
    }
}
