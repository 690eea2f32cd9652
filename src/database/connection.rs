//! # Connection Producer
//!
//! Owns the `sqlx` pool of a SQL backend. The pool is built lazily from the
//! connection details handed to `initialize` and replaced wholesale on
//! re-initialization.

use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

use serde::Deserialize;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::AnyPool;
use sqlx::ConnectOptions;
use tokio::sync::RwLock;

use super::ConnectionDetails;
use crate::config::BackendConfig;
use crate::errors::{DbError, Result};

static INSTALL_DRIVERS: Once = Once::new();

/// Idle timeout used when idle connections are allowed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Idle timeout approximating "keep no idle connections".
const NO_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 4,
            max_idle: 4,
            max_lifetime: None,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            max_open: config.max_open_connections,
            max_idle: config.max_idle(),
            max_lifetime: config.max_connection_lifetime(),
            ..Self::default()
        }
    }

    fn with_overrides(&self, details: &SqlConnectionDetails) -> Self {
        let max_open = details.max_open_connections.unwrap_or(self.max_open).max(1);
        Self {
            max_open,
            max_idle: details.max_idle_connections.unwrap_or(self.max_idle).min(max_open),
            max_lifetime: match details.max_connection_lifetime {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => self.max_lifetime,
            },
            acquire_timeout: self.acquire_timeout,
        }
    }

    // sqlx has no idle-count limit; a zero idle budget maps to a short idle timeout.
    fn pool_options(&self) -> AnyPoolOptions {
        let idle_timeout = if self.max_idle == 0 {
            NO_IDLE_TIMEOUT
        } else {
            IDLE_TIMEOUT
        };

        AnyPoolOptions::new()
            .max_connections(self.max_open)
            .min_connections(0)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(idle_timeout)
            .max_lifetime(self.max_lifetime)
            .test_before_acquire(true)
    }
}

/// Connection details understood by SQL backends.
///
/// Pool limits given here override the ones from the backend configuration.
#[derive(Debug, Deserialize)]
struct SqlConnectionDetails {
    connection_url: String,
    #[serde(default)]
    max_open_connections: Option<u32>,
    #[serde(default)]
    max_idle_connections: Option<u32>,
    #[serde(default)]
    max_connection_lifetime: Option<u64>,
}

impl SqlConnectionDetails {
    fn parse(details: &ConnectionDetails) -> Result<Self> {
        if details.is_empty() {
            return Err(DbError::config("connection details must not be empty"));
        }

        let parsed: Self = serde_json::from_value(serde_json::Value::Object(details.clone()))
            .map_err(|e| DbError::config(format!("invalid connection details: {}", e)))?;

        if parsed.connection_url.trim().is_empty() {
            return Err(DbError::config("connection_url must not be empty"));
        }

        Ok(parsed)
    }
}

enum PoolState {
    Unconfigured,
    Ready { pool: AnyPool, url: String },
    Closed,
}

/// Lazily configured pool shared by all operations of one backend.
pub struct ConnectionProducer {
    settings: PoolSettings,
    state: RwLock<PoolState>,
}

impl ConnectionProducer {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(PoolState::Unconfigured),
        }
    }

    /// Build a pool from `details`, optionally checking connectivity, and
    /// swap it in. The previous pool is closed only after the new one is ready.
    pub async fn configure(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        if matches!(*self.state.read().await, PoolState::Closed) {
            return Err(DbError::state("connection producer is closed"));
        }

        let parsed = SqlConnectionDetails::parse(details)?;
        let settings = self.settings.with_overrides(&parsed);
        let url = sanitize_url(&parsed.connection_url);

        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        // Statements carry generated passwords; keep them out of driver logs.
        let options = AnyConnectOptions::from_str(&parsed.connection_url)
            .map_err(|e| DbError::config(format!("invalid connection_url '{}': {}", url, e)))?
            .disable_statement_logging();
        let pool = settings.pool_options().connect_lazy_with(options);

        if verify_connection {
            if let Err(e) = verify(&pool).await {
                tracing::error!(error = %e, url = %url, "Connection verification failed");
                pool.close().await;
                return Err(DbError::database(
                    e,
                    format!("failed to verify connection to {}", url),
                ));
            }
        }

        let previous = {
            let mut state = self.state.write().await;
            if matches!(*state, PoolState::Closed) {
                drop(state);
                pool.close().await;
                return Err(DbError::state("connection producer is closed"));
            }
            std::mem::replace(
                &mut *state,
                PoolState::Ready {
                    pool,
                    url: url.clone(),
                },
            )
        };

        if let PoolState::Ready { pool: old, url: old_url } = previous {
            tracing::debug!(url = %old_url, "Closing replaced connection pool");
            old.close().await;
        }

        tracing::info!(
            url = %url,
            max_open = settings.max_open,
            max_idle = settings.max_idle,
            max_lifetime_secs = settings.max_lifetime.map(|d| d.as_secs()),
            verified = verify_connection,
            "Connection pool configured"
        );

        Ok(())
    }

    /// Handle to the live pool. Checkout blocks up to the acquire timeout when exhausted.
    pub async fn connection(&self) -> Result<AnyPool> {
        match &*self.state.read().await {
            PoolState::Ready { pool, .. } => Ok(pool.clone()),
            PoolState::Unconfigured => Err(DbError::state("connection producer is not configured")),
            PoolState::Closed => Err(DbError::state("connection producer is closed")),
        }
    }

    pub async fn stats(&self) -> Option<PoolStats> {
        match &*self.state.read().await {
            PoolState::Ready { pool, .. } => Some(PoolStats {
                size: pool.size(),
                idle: pool.num_idle(),
            }),
            _ => None,
        }
    }

    /// Drain the pool. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write().await, PoolState::Closed);
        if let PoolState::Ready { pool, url } = previous {
            pool.close().await;
            tracing::info!(url = %url, "Connection pool closed");
        }
    }
}

async fn verify(pool: &AnyPool) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT 1").execute(&mut *conn).await?;
    Ok(())
}

/// Strip credentials from a connection URL before logging it.
pub fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.password().is_some() || !parsed.username().is_empty() => format!(
            "{}://***:***@{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("unknown"),
            parsed.path()
        ),
        _ => url.to_string(),
    }
}

/// Pool statistics for monitoring
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections in the pool
    pub size: u32,
    /// Number of idle connections
    pub idle: usize,
}

impl PoolStats {
    /// Get the number of active connections
    pub fn active(&self) -> u32 {
        self.size.saturating_sub(self.idle as u32)
    }
}
