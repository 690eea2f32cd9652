//! Plugin-side entry point.
//!
//! A plugin binary builds its backend and calls [`serve`]. It unwraps its TLS
//! material through the launcher's callback, listens on loopback, prints the
//! handshake line and serves until the launcher kills it.

use std::io::Write;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use super::handshake::Handshake;
use super::pki::install_crypto_provider;
use super::wrapping::unwrap_token;
use super::{
    grpc, legacy, WireProtocol, ENV_CALLBACK_ADDR, ENV_CALLBACK_CA, ENV_MAGIC_COOKIE,
    ENV_WRAPPING_TOKEN, MAGIC_COOKIE_VALUE,
};
use crate::database::DatabaseBackend;
use crate::errors::{DbError, Result};

/// How the plugin exposes its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOptions {
    pub protocol: WireProtocol,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Grpc,
        }
    }
}

/// Fail unless the process was started by a launcher.
pub fn ensure_launched() -> Result<()> {
    match std::env::var(ENV_MAGIC_COOKIE) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => Ok(()),
        _ => Err(DbError::config(
            "this binary is a database plugin and is not meant to be executed directly; \
             it must be started by a plugin launcher",
        )),
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DbError::config(format!("missing environment variable {}", name)))
}

/// Serve `backend` to the launcher that started this process.
pub async fn serve(backend: Arc<dyn DatabaseBackend>, options: ServeOptions) -> Result<()> {
    ensure_launched()?;
    let token = required_env(ENV_WRAPPING_TOKEN)?;
    let callback_addr = required_env(ENV_CALLBACK_ADDR)?;
    let callback_ca = required_env(ENV_CALLBACK_CA)?;

    install_crypto_provider();
    let bundle = unwrap_token(&callback_addr, &callback_ca, &token).await?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DbError::transport(format!("failed to bind plugin listener: {}", e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| DbError::transport(format!("failed to read plugin listener address: {}", e)))?;

    let handshake = Handshake::new(addr, options.protocol);
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", handshake)
            .and_then(|_| stdout.flush())
            .map_err(|e| DbError::transport(format!("failed to write handshake: {}", e)))?;
    }
    info!(%addr, protocol = %options.protocol, "Plugin handshake sent");

    match options.protocol {
        WireProtocol::Grpc => grpc::serve(listener, &bundle, backend).await,
        WireProtocol::NetRpc => legacy::serve(listener, &bundle, backend).await,
    }
}
