//! # dbplugin
//!
//! Pluggable database credential backends. A backend creates, renews and
//! revokes short-lived database users; it either runs in-process (the SQL
//! families) or as a separately launched, checksum-verified plugin executable
//! reached over mutually authenticated TLS.
//!
//! ## Architecture
//!
//! ```text
//! BackendConfig → Factory ─┬─ FamilyTable → SqlBackend ── sqlx pool
//!                          └─ Launcher ───→ ProtocolBridge ── gRPC | netrpc ──► plugin
//!                                   (both wrapped in MetricsMiddleware)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbplugin::config::{BackendConfig, LauncherConfig};
//! use dbplugin::database::{Factory, FamilyTable};
//! use dbplugin::plugin::Launcher;
//!
//! # async fn run() -> dbplugin::Result<()> {
//! let factory = Factory::new(FamilyTable::builtin(), Launcher::new(LauncherConfig::from_env()));
//! let config = BackendConfig::plugin("/opt/plugins/db-plugin", "9f86d081884c7d65...");
//! let backend = factory.resolve(&config).await?;
//! backend.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod errors;
pub mod observability;
pub mod plugin;
pub mod secrets;

pub use config::{BackendConfig, LauncherConfig, ObservabilityConfig};
pub use database::{Credential, DatabaseBackend, Factory, FamilyTable, Statements, UsernameConfig};
pub use errors::{DbError, ErrorCategory, Result};
pub use plugin::{Launcher, ProtocolBridge};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
