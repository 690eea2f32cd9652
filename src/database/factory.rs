//! # Backend Factory
//!
//! Turns a [`BackendConfig`] into a ready-to-initialize backend. Builtin
//! families come from an explicit [`FamilyTable`]; the `plugin` family goes
//! through the [`Launcher`]. Either way the caller gets the same trait object,
//! wrapped in [`MetricsMiddleware`], and owns its `close`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::connection::PoolSettings;
use super::middleware::MetricsMiddleware;
use super::sql::{SqlBackend, MYSQL, POSTGRES};
use super::DatabaseBackend;
use crate::config::{BackendConfig, PLUGIN_FAMILY};
use crate::errors::{DbError, Result};
use crate::observability::MetricsRecorder;
use crate::plugin::Launcher;

/// Builds an uninitialized backend for one family.
pub type BackendConstructor =
    Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn DatabaseBackend>> + Send + Sync>;

/// Mapping of family names to constructors, owned by a [`Factory`].
#[derive(Clone, Default)]
pub struct FamilyTable {
    constructors: HashMap<String, BackendConstructor>,
}

impl fmt::Debug for FamilyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamilyTable")
            .field("families", &self.families())
            .finish()
    }
}

impl FamilyTable {
    /// Create a table with no families
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the builtin SQL families (`postgres`, `mysql`).
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register(POSTGRES.family, |config: &BackendConfig| {
            Ok(Box::new(SqlBackend::new(POSTGRES, PoolSettings::from_config(config)))
                as Box<dyn DatabaseBackend>)
        });
        table.register(MYSQL.family, |config: &BackendConfig| {
            Ok(Box::new(SqlBackend::new(MYSQL, PoolSettings::from_config(config)))
                as Box<dyn DatabaseBackend>)
        });
        table
    }

    /// Register or replace a family. The `plugin` family is reserved for the launcher.
    pub fn register<S, F>(&mut self, family: S, constructor: F) -> &mut Self
    where
        S: Into<String>,
        F: Fn(&BackendConfig) -> Result<Box<dyn DatabaseBackend>> + Send + Sync + 'static,
    {
        let family = family.into();
        if family == PLUGIN_FAMILY {
            tracing::warn!("Ignoring registration of reserved family 'plugin'");
            return self;
        }
        info!(family = %family, "Registering database family");
        self.constructors.insert(family, Arc::new(constructor));
        self
    }

    pub fn has_family(&self, family: &str) -> bool {
        self.constructors.contains_key(family)
    }

    /// Registered family names, sorted
    pub fn families(&self) -> Vec<&str> {
        let mut families: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        families.sort_unstable();
        families
    }

    fn get(&self, family: &str) -> Option<&BackendConstructor> {
        self.constructors.get(family)
    }
}

/// Resolves backend configurations into backends.
#[derive(Debug)]
pub struct Factory {
    families: FamilyTable,
    launcher: Launcher,
    recorder: MetricsRecorder,
}

impl Factory {
    pub fn new(families: FamilyTable, launcher: Launcher) -> Self {
        Self {
            families,
            launcher,
            recorder: MetricsRecorder::new(),
        }
    }

    pub fn families(&self) -> &FamilyTable {
        &self.families
    }

    /// Build the backend described by `config`.
    ///
    /// The returned backend is uninitialized. For the `plugin` family the
    /// subprocess is already running and is terminated by the backend's `close`
    /// or when the backend is dropped.
    pub async fn resolve(&self, config: &BackendConfig) -> Result<Box<dyn DatabaseBackend>> {
        config.validate()?;

        let backend: Box<dyn DatabaseBackend> = if config.is_plugin() {
            let bridge = self
                .launcher
                .launch(&config.plugin_command, &config.plugin_args, &config.plugin_checksum)
                .await?;
            Box::new(bridge)
        } else {
            let constructor = self.families.get(&config.family).ok_or_else(|| {
                DbError::config(format!("unsupported database type: {}", config.family))
            })?;
            constructor(config)?
        };

        info!(
            family = %config.family,
            backend_type = %backend.backend_type(),
            "Resolved database backend"
        );

        Ok(Box::new(MetricsMiddleware::new(backend, self.recorder.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LauncherConfig;
    use crate::database::ConnectionDetails;
    use tracing_test::traced_test;

    fn factory() -> Factory {
        Factory::new(FamilyTable::builtin(), Launcher::new(LauncherConfig::default()))
    }

    #[test]
    fn test_builtin_families() {
        let table = FamilyTable::builtin();
        assert_eq!(table.families(), vec!["mysql", "postgres"]);
        assert!(table.has_family("postgres"));
        assert!(!table.has_family("cassandra"));
        assert!(format!("{:?}", table).contains("postgres"));
    }

    #[test]
    #[traced_test]
    fn test_plugin_family_is_reserved() {
        let mut table = FamilyTable::new();
        table.register(PLUGIN_FAMILY, |config: &BackendConfig| {
            Ok(Box::new(SqlBackend::new(POSTGRES, PoolSettings::from_config(config)))
                as Box<dyn DatabaseBackend>)
        });
        assert!(!table.has_family(PLUGIN_FAMILY));
        assert!(logs_contain("reserved family"));
    }

    #[tokio::test]
    async fn test_resolve_builtin_family() {
        let backend = factory()
            .resolve(&BackendConfig::builtin("postgres", ConnectionDetails::new()))
            .await
            .unwrap();
        assert_eq!(backend.backend_type(), "postgres");
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_unknown_family() {
        let err = factory()
            .resolve(&BackendConfig::builtin("oracle", ConnectionDetails::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(err.to_string().contains("unsupported database type"));
    }

    #[tokio::test]
    async fn test_resolve_plugin_without_command_or_checksum() {
        for config in [
            BackendConfig::plugin("", "00ff"),
            BackendConfig::plugin("/opt/plugins/db", ""),
        ] {
            let err = factory().resolve(&config).await.err().unwrap();
            assert!(matches!(err, DbError::Configuration { .. }));
        }
    }

    #[tokio::test]
    async fn test_registered_family_is_resolvable() {
        let mut table = FamilyTable::builtin();
        table.register("cassandra-like", |config: &BackendConfig| {
            Ok(Box::new(SqlBackend::new(MYSQL, PoolSettings::from_config(config)))
                as Box<dyn DatabaseBackend>)
        });
        let factory = Factory::new(table, Launcher::new(LauncherConfig::default()));

        let backend = factory
            .resolve(&BackendConfig::builtin("cassandra-like", ConnectionDetails::new()))
            .await
            .unwrap();
        assert_eq!(backend.backend_type(), "mysql");
    }
}
