//! # Database Backends
//!
//! The [`DatabaseBackend`] trait is the one interface callers see, whether the
//! backend runs in-process ([`sql::SqlBackend`]) or in a plugin subprocess
//! ([`crate::plugin::ProtocolBridge`]). Every backend handed out by the
//! [`Factory`] is wrapped in [`MetricsMiddleware`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, Result};
use crate::secrets::SecretString;

pub mod connection;
pub mod credentials;
pub mod factory;
pub mod middleware;
pub mod sql;
pub mod statements;

pub use connection::{ConnectionProducer, PoolSettings};
pub use credentials::{CredentialPolicy, CredentialsProducer, UsernamePolicy};
pub use factory::{BackendConstructor, Factory, FamilyTable};
pub use middleware::MetricsMiddleware;
pub use sql::{SqlBackend, SqlDialect};
pub use statements::Statements;

/// Opaque, backend-specific connection settings.
pub type ConnectionDetails = serde_json::Map<String, serde_json::Value>;

/// Inputs to username generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameConfig {
    pub display_name: String,
    #[serde(default)]
    pub role_name: String,
}

impl UsernameConfig {
    pub fn new<D: Into<String>, R: Into<String>>(display_name: D, role_name: R) -> Self {
        Self {
            display_name: display_name.into(),
            role_name: role_name.into(),
        }
    }
}

/// A freshly created database identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
    pub expiration: DateTime<Utc>,
}

/// Lifecycle of a backend: `Uninitialized -> Initialized -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Closed,
}

impl LifecycleState {
    /// Fail unless user operations are allowed in this state.
    pub fn ensure_initialized(&self) -> Result<()> {
        match self {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Uninitialized => Err(DbError::state("backend is not initialized")),
            LifecycleState::Closed => Err(DbError::state("backend is closed")),
        }
    }

    /// Fail if the backend has been closed.
    pub fn ensure_open(&self) -> Result<()> {
        match self {
            LifecycleState::Closed => Err(DbError::state("backend is closed")),
            _ => Ok(()),
        }
    }
}

/// Credential lifecycle contract shared by builtin and plugin backends.
///
/// Implementations are shared across tasks. `initialize` may be called again
/// to reconfigure; `close` is terminal and idempotent.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Family name. Stable, never fails.
    fn backend_type(&self) -> &str;

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()>;

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential>;

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()>;

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Reject an expiration that is not strictly after `now`.
pub fn validate_expiration(expiration: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if expiration <= now {
        return Err(DbError::validation(format!(
            "expiration {} is not in the future",
            expiration.to_rfc3339()
        )));
    }
    Ok(())
}

pub fn validate_username_config(config: &UsernameConfig) -> Result<()> {
    if config.display_name.trim().is_empty() {
        return Err(DbError::validation("display name must not be empty"));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(DbError::validation("username must not be empty"));
    }
    Ok(())
}
