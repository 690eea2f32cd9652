//! # Structured Logging
//!
//! Span macros for plugin and backend operations, and subscriber setup.
//!
//! Logs always go to stderr. A plugin's stdout carries the handshake line, and
//! the launcher forwards plugin stderr into its own `tracing` output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Create a tracing span for a call across the plugin boundary.
///
/// ```rust,ignore
/// let span = plugin_span!("create_user", "/usr/lib/plugins/db");
/// let span = plugin_span!("create_user", "/usr/lib/plugins/db", protocol = "grpc");
/// ```
#[macro_export]
macro_rules! plugin_span {
    ($operation:expr, $plugin:expr) => {
        tracing::debug_span!(
            "plugin_call",
            operation = %$operation,
            plugin = %$plugin,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $plugin:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "plugin_call",
            operation = %$operation,
            plugin = %$plugin,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for backend operations.
///
/// ```rust,ignore
/// let span = db_span!("revoke_user", family = "postgres");
/// ```
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` when
/// a subscriber was already installed, which is not an error.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = if config.json_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_level(true)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = plugin_span!("initialize", "/tmp/plugin");
        let _span = plugin_span!("initialize", "/tmp/plugin", protocol = "netrpc");
        let _span = db_span!("create_user");
        let _span = db_span!("create_user", family = "postgres");
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        // A second install finds the subscriber in place and reports it.
        assert!(!init_logging(&config));
    }
}
