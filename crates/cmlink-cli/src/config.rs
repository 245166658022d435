//! Configuration system for the cmlink CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmlink_core::{EnvelopeConfig, Universe};
use cmlink_crypto::ServerPublicKey;
use cmlink_discovery::{ServerListConfig, ServerRecord};
use cmlink_transport::{Endpoint, ProtocolTypes, WebSocketOptions};

/// cmlink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Envelope encryption configuration
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Server selection configuration
    #[serde(default)]
    pub server_list: ServerListSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Known CM servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Carriers to try
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// Candidates tried before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Use TLS for WebSocket sessions
    #[serde(default = "default_true")]
    pub websocket_tls: bool,
}

/// Envelope encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    /// Universe the servers belong to
    #[serde(default)]
    pub universe: Universe,
    /// Universe RSA public key (DER or PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PathBuf>,
}

/// Server selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListSettings {
    /// Weighting after a successful connection
    #[serde(default = "default_good_weighting")]
    pub good_weighting: u32,
    /// Weighting of servers with no recent history
    #[serde(default = "default_base_weighting")]
    pub base_weighting: u32,
    /// Weighting after a failed connection
    #[serde(default = "default_bad_weighting")]
    pub bad_weighting: u32,
    /// Seconds before a mark decays to baseline
    #[serde(default = "default_validity_secs")]
    pub validity_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `[[servers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port`
    pub address: String,
    /// Carriers the server accepts
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
}

// Default values

fn default_timeout_ms() -> u64 {
    5000
}

fn default_protocols() -> Vec<String> {
    vec!["tcp".to_string(), "udp".to_string(), "websocket".to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_good_weighting() -> u32 {
    cmlink_discovery::GOOD_WEIGHTING
}

fn default_base_weighting() -> u32 {
    cmlink_discovery::BASE_WEIGHTING
}

fn default_bad_weighting() -> u32 {
    cmlink_discovery::BAD_WEIGHTING
}

fn default_validity_secs() -> u64 {
    cmlink_discovery::DEFAULT_VALIDITY.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            protocols: default_protocols(),
            max_attempts: default_max_attempts(),
            websocket_tls: true,
        }
    }
}

impl Default for ServerListSettings {
    fn default() -> Self {
        Self {
            good_weighting: default_good_weighting(),
            base_weighting: default_base_weighting(),
            bad_weighting: default_bad_weighting(),
            validity_secs: default_validity_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parse a list of carrier names into a protocol set
pub fn parse_protocols(names: &[String]) -> anyhow::Result<ProtocolTypes> {
    if names.is_empty() {
        anyhow::bail!("protocol list is empty");
    }
    names.iter().try_fold(ProtocolTypes::NONE, |mask, name| {
        ProtocolTypes::from_name(name)
            .map(|p| mask | p)
            .ok_or_else(|| {
                anyhow::anyhow!("Invalid protocol: {name}. Must be one of: tcp, udp, websocket, all")
            })
    })
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("cmlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Carriers enabled for outgoing sessions
    ///
    /// # Errors
    ///
    /// Returns an error if a protocol name is unknown.
    pub fn protocol_mask(&self) -> anyhow::Result<ProtocolTypes> {
        parse_protocols(&self.connection.protocols)
    }

    /// Connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.timeout_ms)
    }

    /// WebSocket carrier options
    #[must_use]
    pub fn websocket_options(&self) -> WebSocketOptions {
        WebSocketOptions {
            tls: self.connection.websocket_tls,
        }
    }

    /// Server list weighting constants
    #[must_use]
    pub fn server_list_config(&self) -> ServerListConfig {
        let settings = &self.server_list;
        ServerListConfig {
            good_weighting: settings.good_weighting,
            base_weighting: settings.base_weighting,
            bad_weighting: settings.bad_weighting,
            validity: Duration::from_secs(settings.validity_secs),
        }
    }

    /// Records for every `[[servers]]` entry
    ///
    /// # Errors
    ///
    /// Returns an error if an address or protocol list is malformed.
    pub fn server_records(&self) -> anyhow::Result<Vec<ServerRecord>> {
        self.servers
            .iter()
            .map(|server| {
                let endpoint: Endpoint = server
                    .address
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Server '{}': {}", server.address, e))?;
                let protocols = parse_protocols(&server.protocols)
                    .map_err(|e| anyhow::anyhow!("Server '{}': {}", server.address, e))?;
                Ok(ServerRecord::new(endpoint, protocols))
            })
            .collect()
    }

    /// Read the universe key and build the handshake settings
    ///
    /// # Errors
    ///
    /// Returns an error if no key is configured or the key file is unusable.
    pub fn envelope_config(&self) -> anyhow::Result<EnvelopeConfig> {
        let Some(path) = &self.encryption.public_key else {
            anyhow::bail!("[encryption] public_key is required for TCP and UDP sessions");
        };
        let bytes = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Cannot read public key {}: {}", path.display(), e))?;
        let public_key = ServerPublicKey::from_bytes(&bytes)?;
        Ok(EnvelopeConfig {
            universe: self.encryption.universe,
            public_key,
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection.timeout_ms == 0 || self.connection.timeout_ms > 120_000 {
            anyhow::bail!("Connect timeout must be between 1 and 120000 ms");
        }

        if self.connection.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }

        self.protocol_mask()?;

        self.server_list_config().validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.server_records()?;

        Ok(())
    }
}
