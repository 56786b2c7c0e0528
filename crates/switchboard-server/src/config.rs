//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (SWITCHBOARD_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use switchboard_core::ExchangeConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional TLS material. Termination itself is expected at the
    /// fronting transport; these paths are carried for deployments that
    /// wire one up.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Call configuration.
    #[serde(default)]
    pub call: CallConfig,

    /// Dial rate limiting.
    #[serde(default)]
    pub dial_rate: DialRateConfig,

    /// Federation link to a parent exchange.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// TLS certificate/key paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Recommended client heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long a call may ring before timing out, in milliseconds.
    #[serde(default = "default_ringing_timeout")]
    pub ringing_timeout_ms: u64,
}

/// Dial rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRateConfig {
    /// Attempts allowed per window; 0 disables limiting.
    #[serde(default = "default_dial_max_attempts")]
    pub max_attempts: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_dial_window")]
    pub window_ms: u64,
}

/// Federation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Whether to maintain an outbound link to a parent exchange.
    #[serde(default)]
    pub enabled: bool,

    /// Parent exchange WebSocket URL.
    #[serde(default)]
    pub peer_url: String,

    /// Domain announced to the parent.
    #[serde(default = "default_local_domain")]
    pub local_domain: String,

    /// Routes announced to the parent (what we serve).
    #[serde(default = "default_announce_routes")]
    pub announce_routes: Vec<String>,

    /// Routes installed locally for the parent (what it serves).
    #[serde(default = "default_parent_routes")]
    pub parent_routes: Vec<String>,

    /// Opaque auth token forwarded to the parent.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Delay before reconnecting a dropped link, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Federation heartbeat interval in milliseconds.
    #[serde(default = "default_federation_heartbeat")]
    pub heartbeat_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions

fn default_host() -> String {
    std::env::var("SWITCHBOARD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SWITCHBOARD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7200)
}

fn env_u64(name: &str, fallback: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    env_u64("SWITCHBOARD_HEARTBEAT_INTERVAL_MS", 30_000)
}

fn default_heartbeat_timeout() -> u64 {
    env_u64("SWITCHBOARD_HEARTBEAT_TIMEOUT_MS", 60_000)
}

fn default_ringing_timeout() -> u64 {
    env_u64("SWITCHBOARD_CALL_RINGING_TIMEOUT_MS", 30_000)
}

fn default_dial_max_attempts() -> u32 {
    env_u64("SWITCHBOARD_DIAL_MAX_ATTEMPTS", 100) as u32
}

fn default_dial_window() -> u64 {
    env_u64("SWITCHBOARD_DIAL_WINDOW_MS", 60_000)
}

fn default_local_domain() -> String {
    std::env::var("SWITCHBOARD_FEDERATION_DOMAIN").unwrap_or_else(|_| "local".to_string())
}

fn default_announce_routes() -> Vec<String> {
    vec![]
}

fn default_parent_routes() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_reconnect_delay() -> u64 {
    env_u64("SWITCHBOARD_FEDERATION_RECONNECT_MS", 5_000)
}

fn default_federation_heartbeat() -> u64 {
    env_u64("SWITCHBOARD_FEDERATION_HEARTBEAT_MS", 15_000)
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
            heartbeat: HeartbeatConfig::default(),
            call: CallConfig::default(),
            dial_rate: DialRateConfig::default(),
            federation: FederationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ringing_timeout_ms: default_ringing_timeout(),
        }
    }
}

impl Default for DialRateConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_dial_max_attempts(),
            window_ms: default_dial_window(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer_url: String::new(),
            local_domain: default_local_domain(),
            announce_routes: default_announce_routes(),
            parent_routes: default_parent_routes(),
            auth_token: None,
            reconnect_delay_ms: default_reconnect_delay(),
            heartbeat_interval_ms: default_federation_heartbeat(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default file paths or fall back to
    /// defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "switchboard.toml",
            "/etc/switchboard/switchboard.toml",
            "~/.config/switchboard/switchboard.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    /// The exchange-core slice of this configuration.
    #[must_use]
    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            ringing_timeout: Duration::from_millis(self.call.ringing_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            dial_max_attempts: self.dial_rate.max_attempts,
            dial_window: Duration::from_millis(self.dial_rate.window_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.call.ringing_timeout_ms, 30_000);
        assert_eq!(config.dial_rate.max_attempts, 100);
        assert!(!config.federation.enabled);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [call]
            ringing_timeout_ms = 15000

            [federation]
            enabled = true
            peer_url = "wss://parent.example/ws"
            local_domain = "branch.example"
            announce_routes = ["*@branch.example"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.call.ringing_timeout_ms, 15_000);
        assert!(config.federation.enabled);
        assert_eq!(config.federation.parent_routes, vec!["*".to_string()]);
    }

    #[test]
    fn test_exchange_config_mapping() {
        let config = Config::default();
        let exchange = config.exchange_config();
        assert_eq!(exchange.ringing_timeout, Duration::from_millis(30_000));
        assert_eq!(exchange.dial_max_attempts, 100);
    }
}
