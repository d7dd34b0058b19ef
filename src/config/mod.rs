//! Configuration management

use crate::protocol::{
    ClientHandshake, Credentials, HandshakeSettings, PayloadTemplate, DEFAULT_HEADER_LIMIT,
    DEFAULT_PAYLOAD, DEFAULT_SERVER_NAME,
};
use crate::transport::TransportConfig;
use crate::tunnel::{MuxConfig, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public listen address
    pub listen: String,
    /// Local SOCKS service every stream is bridged to
    pub socks_target: String,
    /// Maximum concurrent sessions
    pub max_connections: usize,
    /// Largest accepted request head, in bytes
    pub header_limit: usize,
    /// Deadline for reading the request head
    pub handshake_timeout_secs: u64,
    /// Deadline for dialing the SOCKS target
    pub target_connect_timeout_secs: u64,
    /// Copy buffer size
    pub buffer_size: usize,
    /// `Server:` header on crafted responses
    pub server_name: String,
    /// How long to wait for sessions after shutdown (0 = no limit)
    pub shutdown_grace_secs: u64,
    /// Credentials every client must present
    pub credentials: Credentials,
    /// Session tuning
    pub mux: MuxSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:80".to_string(),
            socks_target: "127.0.0.1:8999".to_string(),
            max_connections: 5000,
            header_limit: DEFAULT_HEADER_LIMIT,
            handshake_timeout_secs: 5,
            target_connect_timeout_secs: 8,
            buffer_size: 16 * 1024,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            shutdown_grace_secs: 0,
            credentials: Credentials::default(),
            mux: MuxSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.credentials.is_empty() {
            return Err(crate::Error::Config(
                "server.credentials.user and server.credentials.password must be set".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(crate::Error::Config("max_connections must be at least 1".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(crate::Error::Config("handshake_timeout_secs must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(crate::Error::Config("buffer_size must be at least 1".into()));
        }
        self.mux.validate()
    }

    pub fn handshake_settings(&self) -> HandshakeSettings {
        HandshakeSettings {
            credentials: self.credentials.clone(),
            header_limit: self.header_limit,
            timeout: Duration::from_secs(self.handshake_timeout_secs),
            server_name: self.server_name.clone(),
        }
    }

    /// Settings for dialing the SOCKS target
    pub fn target_transport(&self) -> TransportConfig {
        TransportConfig::default()
            .with_connect_timeout(Duration::from_secs(self.target_connect_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        match self.shutdown_grace_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Multiplexed session settings as they appear in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    /// Seconds between keep-alive frames (0 = never)
    pub keepalive_interval_secs: u64,
    /// Close a session that was silent this long (0 = never)
    pub keepalive_timeout_secs: u64,
    /// Largest data frame payload
    pub max_frame_size: usize,
    /// Per-stream inbound queue, in frames
    pub stream_queue: usize,
    /// Streams opened by the peer but not yet accepted
    pub accept_backlog: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 10,
            keepalive_timeout_secs: 120,
            max_frame_size: 32 * 1024,
            stream_queue: 64,
            accept_backlog: 1024,
        }
    }
}

impl MuxSettings {
    /// Client defaults notice a dead server sooner
    pub fn client_default() -> Self {
        Self {
            keepalive_timeout_secs: 30,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(crate::Error::Config(format!(
                "mux.max_frame_size must be between 1 and {}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.keepalive_timeout_secs != 0
            && self.keepalive_timeout_secs <= self.keepalive_interval_secs
        {
            return Err(crate::Error::Config(
                "mux.keepalive_timeout_secs must exceed mux.keepalive_interval_secs".into(),
            ));
        }
        Ok(())
    }
}

impl From<&MuxSettings> for MuxConfig {
    fn from(settings: &MuxSettings) -> Self {
        MuxConfig {
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(settings.keepalive_timeout_secs),
            max_frame_size: settings.max_frame_size,
            stream_queue: settings.stream_queue,
            accept_backlog: settings.accept_backlog,
            ..MuxConfig::default()
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address
    pub server: String,
    /// Value substituted for `[host]` in the payload
    pub host: String,
    /// Handshake payload template
    pub payload: String,
    /// Local listener handed to applications
    pub local_listen: String,
    /// Dial timeout for the tunnel server
    pub connect_timeout_secs: u64,
    /// Deadline for the whole handshake exchange
    pub handshake_timeout_secs: u64,
    /// Largest accepted response head, in bytes
    pub header_limit: usize,
    /// Give up after this many consecutive failed attempts (0 = never)
    pub max_failures: u32,
    /// Pause between attempts
    pub reconnect_delay_secs: u64,
    /// Copy buffer size
    pub buffer_size: usize,
    /// Session tuning
    #[serde(default = "MuxSettings::client_default")]
    pub mux: MuxSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:80".to_string(),
            host: "example.com".to_string(),
            payload: DEFAULT_PAYLOAD.to_string(),
            local_listen: "127.0.0.1:8991".to_string(),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            header_limit: DEFAULT_HEADER_LIMIT,
            max_failures: 5,
            reconnect_delay_secs: 5,
            buffer_size: 16 * 1024,
            mux: MuxSettings::client_default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.payload.trim().is_empty() {
            return Err(crate::Error::Config("client.payload must not be empty".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(crate::Error::Config("handshake_timeout_secs must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(crate::Error::Config("buffer_size must be at least 1".into()));
        }
        self.mux.validate()
    }

    pub fn handshake(&self) -> ClientHandshake {
        ClientHandshake::new(PayloadTemplate::new(self.payload.clone()), self.host.clone())
            .with_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_header_limit(self.header_limit)
    }

    pub fn server_transport(&self) -> TransportConfig {
        TransportConfig::default()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `level` from the command line wins over the file.
    pub fn init(&self, level: Option<&str>) {
        let filter = level.unwrap_or(&self.level);
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        match self.format.as_str() {
            "pretty" => builder.pretty().init(),
            "compact" => builder.compact().init(),
            _ => builder.init(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            credentials: Credentials::new("change-me", "change-me"),
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}
