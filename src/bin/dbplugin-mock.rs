//! In-memory database plugin used by the integration tests.
//!
//! Usage (only through a launcher):
//!   dbplugin-mock [--protocol grpc|netrpc] [--marker <path>] [--stall]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::Mutex;

use dbplugin::config::ObservabilityConfig;
use dbplugin::database::{
    validate_expiration, validate_username, validate_username_config, ConnectionDetails,
    Credential, DatabaseBackend, LifecycleState, Statements, UsernameConfig,
};
use dbplugin::errors::{DbError, Result};
use dbplugin::observability::init_logging;
use dbplugin::plugin::serve::ensure_launched;
use dbplugin::plugin::{serve, ServeOptions, WireProtocol};

#[derive(Parser, Debug)]
#[command(name = "dbplugin-mock")]
#[command(about = "In-memory database plugin for exercising the launcher")]
struct Args {
    /// Wire protocol to advertise and serve
    #[arg(long, default_value = "grpc")]
    protocol: WireProtocol,

    /// File created as soon as the process starts
    #[arg(long)]
    marker: Option<PathBuf>,

    /// Never exchange the wrapping token or print a handshake
    #[arg(long)]
    stall: bool,
}

struct MockState {
    lifecycle: LifecycleState,
    users: HashMap<String, DateTime<Utc>>,
}

/// Users live in memory only. Created users get the display name as
/// username and the fixed password `test`.
struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                lifecycle: LifecycleState::Uninitialized,
                users: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    fn backend_type(&self) -> &str {
        "mock"
    }

    async fn initialize(&self, details: &ConnectionDetails, _verify_connection: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lifecycle.ensure_open()?;
        if details.len() != 1 {
            return Err(DbError::config(format!(
                "exactly one connection detail is required, got {}",
                details.len()
            )));
        }
        state.lifecycle = LifecycleState::Initialized;
        Ok(())
    }

    async fn create_user(
        &self,
        _statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        let mut state = self.state.lock().await;
        state.lifecycle.ensure_initialized()?;
        validate_username_config(username_config)?;
        validate_expiration(expiration, Utc::now())?;

        let username = username_config.display_name.clone();
        if state.users.contains_key(&username) {
            return Err(DbError::conflict(username));
        }
        state.users.insert(username.clone(), expiration);
        tracing::debug!(username = %username, "Mock user created");

        Ok(Credential {
            username,
            password: "test".into(),
            expiration,
        })
    }

    async fn renew_user(
        &self,
        _statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lifecycle.ensure_initialized()?;
        validate_username(username)?;
        validate_expiration(expiration, Utc::now())?;

        match state.users.get_mut(username) {
            Some(current) => {
                *current = expiration;
                Ok(())
            }
            None => Err(DbError::not_found(username)),
        }
    }

    async fn revoke_user(&self, _statements: &Statements, username: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lifecycle.ensure_initialized()?;
        validate_username(username)?;

        state
            .users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| DbError::not_found(username))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.lifecycle = LifecycleState::Closed;
        state.users.clear();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&ObservabilityConfig::from_env());

    if let Some(marker) = &args.marker {
        std::fs::write(marker, b"started")?;
    }

    ensure_launched()?;

    if args.stall {
        tracing::info!("Stalling without a handshake");
        std::future::pending::<()>().await;
    }

    serve(
        Arc::new(MockBackend::new()),
        ServeOptions {
            protocol: args.protocol,
        },
    )
    .await?;
    Ok(())
}
