//! # Configuration Settings
//!
//! Backend selection, plugin launch tuning and observability settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::database::ConnectionDetails;
use crate::errors::{DbError, Result};

/// Family name that routes a configuration to the plugin launcher.
pub const PLUGIN_FAMILY: &str = "plugin";

fn default_max_open_connections() -> u32 {
    4
}

/// Configuration of one database backend, builtin or plugin.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendConfig {
    /// Backend family (`postgres`, `mysql`, `plugin`, ...)
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "Database type cannot be empty"))]
    pub family: String,

    /// Opaque connection details handed to the backend's `initialize`
    #[serde(default)]
    pub connection_details: ConnectionDetails,

    /// Maximum number of open connections
    #[serde(default = "default_max_open_connections")]
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max open connections must be between 1 and 1000"
    ))]
    pub max_open_connections: u32,

    /// Maximum number of idle connections (defaults to max open)
    #[serde(default)]
    pub max_idle_connections: Option<u32>,

    /// Maximum connection lifetime in seconds (0 = unlimited)
    #[serde(default, alias = "max_connection_lifetime")]
    pub max_connection_lifetime_seconds: u64,

    /// Plugin executable, required for the `plugin` family
    #[serde(default)]
    pub plugin_command: String,

    /// Extra arguments passed to the plugin executable
    #[serde(default)]
    pub plugin_args: Vec<String>,

    /// Hex-encoded SHA-256 of the plugin executable
    #[serde(default)]
    pub plugin_checksum: String,
}

impl BackendConfig {
    /// Configuration for a builtin family.
    pub fn builtin<S: Into<String>>(family: S, connection_details: ConnectionDetails) -> Self {
        Self {
            family: family.into(),
            connection_details,
            max_open_connections: default_max_open_connections(),
            max_idle_connections: None,
            max_connection_lifetime_seconds: 0,
            plugin_command: String::new(),
            plugin_args: Vec::new(),
            plugin_checksum: String::new(),
        }
    }

    /// Configuration for a plugin executable.
    pub fn plugin<C: Into<String>, S: Into<String>>(command: C, checksum: S) -> Self {
        Self {
            plugin_command: command.into(),
            plugin_checksum: checksum.into(),
            ..Self::builtin(PLUGIN_FAMILY, ConnectionDetails::new())
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugin_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_plugin(&self) -> bool {
        self.family == PLUGIN_FAMILY
    }

    /// Maximum connection lifetime (None if unlimited)
    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        match self.max_connection_lifetime_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Maximum idle connections, defaulting to the open connection limit
    pub fn max_idle(&self) -> u32 {
        self.max_idle_connections.unwrap_or(self.max_open_connections)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(DbError::from)?;

        if let Some(idle) = self.max_idle_connections {
            if idle > self.max_open_connections {
                return Err(DbError::config(
                    "Max idle connections cannot exceed max open connections",
                ));
            }
        }

        if self.is_plugin() {
            if self.plugin_command.trim().is_empty() {
                return Err(DbError::config("plugin_command must be set for plugin backends"));
            }
            if self.plugin_checksum.trim().is_empty() {
                return Err(DbError::config("plugin_checksum must be set for plugin backends"));
            }
        }

        Ok(())
    }
}

/// Plugin launch and call tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LauncherConfig {
    /// Time allowed for the token exchange and handshake line
    #[validate(range(
        min = 100,
        max = 600000,
        message = "Launch timeout must be between 100ms and 600000ms"
    ))]
    pub launch_timeout_ms: u64,

    /// Time allowed for a single lifecycle call
    #[validate(range(
        min = 100,
        max = 3600000,
        message = "Call timeout must be between 100ms and 3600000ms"
    ))]
    pub call_timeout_ms: u64,

    /// Time allowed for the protocol negotiation after the handshake line
    #[validate(range(
        min = 100,
        max = 600000,
        message = "Handshake timeout must be between 100ms and 600000ms"
    ))]
    pub handshake_timeout_ms: u64,

    /// Validity of the per-launch certificates
    #[validate(range(
        min = 1,
        max = 87600,
        message = "Certificate TTL must be between 1 and 87600 hours"
    ))]
    pub certificate_ttl_hours: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 30_000,
            call_timeout_ms: 60_000,
            handshake_timeout_ms: 5_000,
            certificate_ttl_hours: 24 * 365,
        }
    }
}

impl LauncherConfig {
    /// Create launcher configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let launch_timeout_ms = std::env::var("DBPLUGIN_LAUNCH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.launch_timeout_ms);

        let call_timeout_ms = std::env::var("DBPLUGIN_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.call_timeout_ms);

        let handshake_timeout_ms = std::env::var("DBPLUGIN_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.handshake_timeout_ms);

        let certificate_ttl_hours = std::env::var("DBPLUGIN_CERTIFICATE_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.certificate_ttl_hours);

        Self {
            launch_timeout_ms,
            call_timeout_ms,
            handshake_timeout_ms,
            certificate_ttl_hours,
        }
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn certificate_ttl(&self) -> Duration {
        Duration::from_secs(self.certificate_ttl_hours.saturating_mul(3600))
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to exported metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 9090,
            service_name: "dbplugin".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Create observability configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enable_metrics = std::env::var("DBPLUGIN_ENABLE_METRICS")
            .map(|s| s.to_lowercase() == "true" || s == "1")
            .unwrap_or(defaults.enable_metrics);

        let metrics_port = std::env::var("DBPLUGIN_METRICS_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(defaults.metrics_port);

        let service_name =
            std::env::var("DBPLUGIN_SERVICE_NAME").unwrap_or(defaults.service_name);

        let log_level = std::env::var("DBPLUGIN_LOG_LEVEL").unwrap_or(defaults.log_level);

        let json_logging = std::env::var("DBPLUGIN_JSON_LOGGING")
            .map(|s| s.to_lowercase() == "true" || s == "1")
            .unwrap_or(defaults.json_logging);

        Self {
            enable_metrics,
            metrics_port,
            service_name,
            log_level,
            json_logging,
        }
    }

    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if !self.enable_metrics || self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
