//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (`FERROBUS_*`, nested keys joined by `__`,
//!   e.g. `FERROBUS_AUTH__TIMEOUT_MS=5000`)
//! - Command line arguments

use anyhow::{Context, Result};
use bus_protocol::codec::MAX_FRAME_SIZE;
use ferrobus_core::RouterConfig;
use ferrobus_transport::ListenAddress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bus listen address, e.g. `tcp:host=127.0.0.1,port=7000`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Handshake settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Routing behaviour.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Health and stats endpoint.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token sent back in the `OK` line.
    #[serde(default = "default_server_token")]
    pub server_token: String,

    /// Time allowed to complete the handshake, in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum encoded message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Answer calls to unknown names with a `ServiceUnknown` error.
    #[serde(default)]
    pub reply_on_unknown_destination: bool,
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

/// Health endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP port.
    #[serde(default = "default_health_port")]
    pub port: u16,
}

// Default value functions
fn default_listen() -> String {
    "tcp:host=127.0.0.1,port=7000".to_string()
}

fn default_server_token() -> String {
    "f00f".to_string()
}

fn default_auth_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_health_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            routing: RoutingConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_token: default_server_token(),
            timeout_ms: default_auth_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
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

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Uses `path` if given, otherwise the first of the default locations
    /// that exists. Environment overrides apply either way.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or
    /// if an explicit `path` does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let expanded = expand(path);
                if !expanded.exists() {
                    anyhow::bail!("Config file not found: {}", expanded.display());
                }
                Some(expanded)
            }
            None => Self::default_paths().into_iter().find(|p| p.exists()),
        };

        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(&expand(path.as_ref())))
    }

    fn default_paths() -> Vec<PathBuf> {
        ["ferrobus.toml", "/etc/ferrobus/ferrobus.toml", "~/.config/ferrobus/ferrobus.toml"]
            .iter()
            .map(|p| expand(Path::new(p)))
            .collect()
    }

    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(file) = file {
            tracing::debug!("Loading config from {}", file.display());
            builder = builder.add_source(
                ::config::File::from(file).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("FERROBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let source = match file {
            Some(file) => file.display().to_string(),
            None => "environment".to_string(),
        };
        builder
            .build()
            .and_then(|layered| layered.try_deserialize::<Self>())
            .with_context(|| format!("Failed to load configuration from {source}"))
    }

    /// Parse the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed.
    pub fn listen_address(&self) -> Result<ListenAddress> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }

    /// Handshake deadline.
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.timeout_ms)
    }

    /// Router settings derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_connections: self.limits.max_connections,
            reply_on_unknown_destination: self.routing.reply_on_unknown_destination,
        }
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
