//! # SQL Backends
//!
//! One [`SqlBackend`] implementation serves every SQL family; what differs
//! between families (default statements, existence query, credential policy)
//! lives in a [`SqlDialect`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use sqlx::{Any, Transaction};
use tokio::sync::{Mutex, RwLock};
use tracing::Instrument;

use super::connection::{ConnectionProducer, PoolSettings};
use super::credentials::{CredentialPolicy, CredentialsProducer};
use super::statements::{or_default, render};
use super::{
    validate_expiration, validate_username, validate_username_config, ConnectionDetails,
    Credential, DatabaseBackend, LifecycleState, Statements, UsernameConfig,
};
use crate::db_span;
use crate::errors::{DbError, Result};

/// SQLSTATE for "role already exists" in PostgreSQL.
const PG_DUPLICATE_OBJECT: &str = "42710";

/// MySQL error code for a failed CREATE USER on an existing account.
const MYSQL_CANNOT_USER: &str = "1396";

/// Family-specific SQL and credential policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    pub family: &'static str,
    pub credentials: CredentialPolicy,
    pub creation: &'static str,
    pub renew: &'static str,
    pub revocation: &'static str,
    pub rollback: &'static str,
    /// Query taking the username as its only bind parameter; any row means "exists".
    pub user_exists: &'static str,
}

pub const POSTGRES: SqlDialect = SqlDialect {
    family: "postgres",
    credentials: CredentialPolicy::postgres(),
    creation: r#"CREATE ROLE "{{name}}" WITH LOGIN PASSWORD '{{password}}' VALID UNTIL '{{expiration}}';"#,
    renew: r#"ALTER ROLE "{{name}}" VALID UNTIL '{{expiration}}';"#,
    revocation: r#"REVOKE ALL PRIVILEGES ON ALL TABLES IN SCHEMA public FROM "{{name}}";
REVOKE USAGE ON SCHEMA public FROM "{{name}}";
DROP ROLE IF EXISTS "{{name}}";"#,
    rollback: r#"DROP ROLE IF EXISTS "{{name}}";"#,
    user_exists: "SELECT 1 FROM pg_roles WHERE rolname = $1",
};

pub const MYSQL: SqlDialect = SqlDialect {
    family: "mysql",
    credentials: CredentialPolicy::mysql(),
    creation: "CREATE USER '{{name}}'@'%' IDENTIFIED BY '{{password}}';",
    // MySQL accounts carry no expiration; renew only checks existence.
    renew: "",
    revocation: "REVOKE ALL PRIVILEGES, GRANT OPTION FROM '{{name}}'@'%'; DROP USER '{{name}}'@'%';",
    rollback: "DROP USER IF EXISTS '{{name}}'@'%';",
    user_exists: "SELECT 1 FROM mysql.user WHERE User = ?",
};

/// Backend for a SQL family reached through a `sqlx` pool.
pub struct SqlBackend {
    dialect: SqlDialect,
    producer: ConnectionProducer,
    credentials: Box<dyn CredentialsProducer>,
    state: RwLock<LifecycleState>,
    init_lock: Mutex<()>,
}

impl SqlBackend {
    pub fn new(dialect: SqlDialect, settings: PoolSettings) -> Self {
        Self::with_credentials(dialect, settings, Box::new(dialect.credentials))
    }

    pub fn with_credentials(
        dialect: SqlDialect,
        settings: PoolSettings,
        credentials: Box<dyn CredentialsProducer>,
    ) -> Self {
        Self {
            dialect,
            producer: ConnectionProducer::new(settings),
            credentials,
            state: RwLock::new(LifecycleState::Uninitialized),
            init_lock: Mutex::new(()),
        }
    }

    pub fn dialect(&self) -> &SqlDialect {
        &self.dialect
    }

    async fn pool(&self) -> Result<AnyPool> {
        self.state.read().await.ensure_initialized()?;
        self.producer.connection().await
    }

    async fn user_exists(&self, pool: &AnyPool, username: &str) -> Result<bool> {
        let row = sqlx::query(self.dialect.user_exists)
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| DbError::database(e, format!("failed to look up user '{}'", username)))?;
        Ok(row.is_some())
    }

    async fn run_rollback(&self, pool: &AnyPool, statements: &Statements, values: &HashMap<&str, &str>) {
        for statement in render(or_default(&statements.rollback, self.dialect.rollback), values) {
            if let Err(e) = sqlx::query(&statement).persistent(false).execute(pool).await {
                tracing::warn!(
                    family = self.dialect.family,
                    error = %e,
                    "Rollback statement failed after unsuccessful user creation"
                );
            }
        }
    }

    async fn do_create(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        validate_username_config(username_config)?;
        validate_expiration(expiration, Utc::now())?;
        let pool = self.pool().await?;

        let username = self.credentials.generate_username(username_config);
        let password = self.credentials.generate_password();
        let expiration_text = self.credentials.generate_expiration(expiration);

        if self.user_exists(&pool, &username).await? {
            return Err(DbError::conflict(username));
        }

        let created = {
            let values = HashMap::from([
                ("name", username.as_str()),
                ("password", password.expose_secret()),
                ("expiration", expiration_text.as_str()),
            ]);
            let creation = render(or_default(&statements.creation, self.dialect.creation), &values);
            if creation.is_empty() {
                return Err(DbError::config("no creation statements configured"));
            }

            let result = execute_in_transaction(&pool, &creation).await;
            if result.is_err() {
                self.run_rollback(&pool, statements, &values).await;
            }
            result
        };

        if let Err(e) = created {
            if is_conflict(&e) {
                return Err(DbError::conflict(username));
            }
            return Err(DbError::database(e, format!("failed to create user '{}'", username)));
        }

        tracing::info!(family = self.dialect.family, username = %username, "Created database user");

        Ok(Credential {
            username,
            password,
            expiration,
        })
    }

    async fn do_renew(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        validate_username(username)?;
        validate_expiration(expiration, Utc::now())?;
        let pool = self.pool().await?;

        if !self.user_exists(&pool, username).await? {
            return Err(DbError::not_found(username));
        }

        let expiration_text = self.credentials.generate_expiration(expiration);
        let values = HashMap::from([("name", username), ("expiration", expiration_text.as_str())]);
        let renew = render(or_default(&statements.renew, self.dialect.renew), &values);

        execute_in_transaction(&pool, &renew)
            .await
            .map_err(|e| DbError::database(e, format!("failed to renew user '{}'", username)))?;

        tracing::info!(family = self.dialect.family, username = %username, "Renewed database user");
        Ok(())
    }

    async fn do_revoke(&self, statements: &Statements, username: &str) -> Result<()> {
        validate_username(username)?;
        let pool = self.pool().await?;

        if !self.user_exists(&pool, username).await? {
            return Err(DbError::not_found(username));
        }

        let values = HashMap::from([("name", username)]);
        let revocation = render(or_default(&statements.revocation, self.dialect.revocation), &values);
        if revocation.is_empty() {
            return Err(DbError::config("no revocation statements configured"));
        }

        execute_in_transaction(&pool, &revocation)
            .await
            .map_err(|e| DbError::database(e, format!("failed to revoke user '{}'", username)))?;

        tracing::info!(family = self.dialect.family, username = %username, "Revoked database user");
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for SqlBackend {
    fn backend_type(&self) -> &str {
        self.dialect.family
    }

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        self.state.read().await.ensure_open()?;

        self.producer
            .configure(details, verify_connection)
            .instrument(db_span!("initialize", family = self.dialect.family))
            .await?;

        *self.state.write().await = LifecycleState::Initialized;
        Ok(())
    }

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        self.do_create(statements, username_config, expiration)
            .instrument(db_span!("create_user", family = self.dialect.family))
            .await
    }

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        self.do_renew(statements, username, expiration)
            .instrument(db_span!("renew_user", family = self.dialect.family))
            .await
    }

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()> {
        self.do_revoke(statements, username)
            .instrument(db_span!("revoke_user", family = self.dialect.family))
            .await
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        *self.state.write().await = LifecycleState::Closed;
        self.producer.close().await;
        Ok(())
    }
}

async fn execute_in_transaction(pool: &AnyPool, statements: &[String]) -> std::result::Result<(), sqlx::Error> {
    if statements.is_empty() {
        return Ok(());
    }

    let mut tx: Transaction<'_, Any> = pool.begin().await?;
    for statement in statements {
        sqlx::query(statement).persistent(false).execute(&mut *tx).await?;
    }
    tx.commit().await
}

fn is_conflict(error: &sqlx::Error) -> bool {
    match error.as_database_error() {
        Some(db_error) => {
            db_error.is_unique_violation()
                || matches!(
                    db_error.code().as_deref(),
                    Some(PG_DUPLICATE_OBJECT) | Some(MYSQL_CANNOT_USER)
                )
        }
        None => false,
    }
}
