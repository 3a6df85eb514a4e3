//! Configuration management

use crate::utils::string::{is_valid_channel_name, is_valid_sid};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Link engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Our own server identity
    pub server: ServerConfig,
    /// Upstream server link
    pub uplink: UplinkConfig,
    /// Connection timeouts
    pub timeouts: TimeoutConfig,
    /// Buffer and protocol limits
    pub limits: LimitsConfig,
    /// Party-line settings
    pub partyline: PartylineConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Pseudo-clients introduced during burst
    pub services: Vec<ServiceConfig>,
}

/// Our server identity as seen by the network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name
    pub name: String,
    /// TS6 server id (digit followed by two alphanumerics)
    pub sid: String,
    /// Server description
    pub description: String,
}

/// Upstream link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Uplink hostname
    pub host: String,
    /// Uplink port
    pub port: u16,
    /// Password we send in PASS
    pub send_password: String,
    /// Password we expect in the uplink's PASS
    pub accept_password: String,
    /// Seconds to wait before reconnecting after the link is lost
    pub reconnect_delay: u64,
}

/// Timeouts, all in seconds except the tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outbound connect timeout
    pub connect: u64,
    /// Handshake timeout, measured from connection creation
    pub handshake: u64,
    /// Idle period before a liveness probe is sent
    pub ping_interval: u64,
    /// Upper bound on a single readiness wait, in milliseconds
    pub tick_ms: u64,
}

/// Buffer and protocol limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per-connection receive buffer size in bytes
    pub recv_buffer: usize,
    /// Backlog in bytes above which a party-line connection is closed
    pub partyline_max_sendq: usize,
    /// Maximum number of parameters in a protocol line
    pub max_params: usize,
}

/// Party-line configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartylineConfig {
    /// Operators allowed to log in
    pub operators: Vec<OperatorAccount>,
}

/// A party-line operator account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAccount {
    /// Login name
    pub name: String,
    /// Argon2 PHC string
    pub password_hash: String,
}

impl OperatorAccount {
    /// Verify a plaintext password against the stored Argon2 hash
    pub fn verify_password(&self, password: &str) -> bool {
        use argon2::password_hash::{PasswordHash, PasswordVerifier};

        match PasswordHash::new(&self.password_hash) {
            Ok(parsed) => argon2::Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!("Unusable password hash for operator {}: {}", self.name, e);
                false
            }
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level
    pub level: String,
}

/// A pseudo-client owned by this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Nickname
    pub nick: String,
    /// Username
    pub user: String,
    /// Hostname
    pub host: String,
    /// Real name
    pub gecos: String,
    /// Channels the service sits in
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "services.example.org".to_string(),
            sid: "0SV".to_string(),
            description: "IRC Services".to_string(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6666,
            send_password: "linkpass".to_string(),
            accept_password: "linkpass".to_string(),
            reconnect_delay: 10,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: 30,
            handshake: 60,
            ping_interval: 120,
            tick_ms: 1000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            recv_buffer: 2048,
            partyline_max_sendq: 65536,
            max_params: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TimeoutConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake)
    }

    /// Ping interval as a duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// Reactor tick as a duration
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() || !self.server.name.contains('.') {
            return Err(Error::Config(format!(
                "Server name '{}' must be a non-empty dotted name",
                self.server.name
            )));
        }

        if !is_valid_sid(&self.server.sid) {
            return Err(Error::Config(format!("Invalid server id '{}'", self.server.sid)));
        }

        if self.uplink.port == 0 {
            return Err(Error::Config("Uplink port cannot be 0".to_string()));
        }

        if self.timeouts.ping_interval == 0 {
            return Err(Error::Config("Ping interval cannot be 0".to_string()));
        }

        if self.timeouts.tick_ms == 0 {
            return Err(Error::Config("Reactor tick cannot be 0".to_string()));
        }

        if self.limits.recv_buffer < 512 {
            return Err(Error::Config(format!(
                "Receive buffer of {} bytes is below the 512 byte protocol minimum",
                self.limits.recv_buffer
            )));
        }

        if self.limits.max_params < 2 {
            return Err(Error::Config("max_params must be at least 2".to_string()));
        }

        let mut seen_nicks = HashSet::new();
        for service in &self.services {
            if service.nick.is_empty() || service.user.is_empty() || service.host.is_empty() {
                return Err(Error::Config("Service nick, user and host are required".to_string()));
            }

            if !seen_nicks.insert(crate::utils::irc_to_lower(&service.nick)) {
                return Err(Error::Config(format!("Duplicate service nick {}", service.nick)));
            }

            for channel in &service.channels {
                if !is_valid_channel_name(channel) {
                    return Err(Error::Config(format!(
                        "Service {} lists invalid channel {}",
                        service.nick, channel
                    )));
                }
            }
        }

        let mut seen_operators = HashSet::new();
        for operator in &self.partyline.operators {
            if !seen_operators.insert(operator.name.to_lowercase()) {
                return Err(Error::Config(format!("Duplicate operator {}", operator.name)));
            }
        }

        Ok(())
    }
}
