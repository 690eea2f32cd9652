//! # Protocol Bridge
//!
//! The launcher-side proxy for a running plugin. Whichever protocol was
//! negotiated at launch sits behind one [`ProtocolAdapter`]; the bridge adds
//! lifecycle checks, the local call deadline and span instrumentation, and
//! owns the child process.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn, Instrument};

use super::WireProtocol;
use crate::database::{ConnectionDetails, Credential, DatabaseBackend, Statements, UsernameConfig};
use crate::errors::{DbError, Result};
use crate::plugin_span;

/// Family reported before the plugin has answered `backend_type`.
const UNKNOWN_FAMILY: &str = "plugin";

/// One wire protocol's view of the remote backend.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> WireProtocol;

    async fn backend_type(&self) -> Result<String>;

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

/// A launched plugin subprocess.
#[derive(Debug)]
pub struct PluginHandle {
    pub command: String,
    pub checksum: String,
    pub protocol: WireProtocol,
    pub addr: SocketAddr,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl PluginHandle {
    pub fn new(
        command: String,
        checksum: String,
        protocol: WireProtocol,
        addr: SocketAddr,
        child: Child,
    ) -> Self {
        Self {
            command,
            checksum,
            protocol,
            addr,
            child: Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::state("plugin backend is closed"));
        }
        Ok(())
    }

    /// Mark closed. Returns `false` if it already was.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Kill and reap the subprocess. Idempotent.
    pub async fn terminate(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(command = %self.command, error = %e, "Plugin process already exited");
            }
            debug!(command = %self.command, "Plugin process terminated");
        }
    }
}

/// [`DatabaseBackend`] backed by a plugin subprocess.
pub struct ProtocolBridge {
    handle: PluginHandle,
    adapter: Box<dyn ProtocolAdapter>,
    family: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for ProtocolBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBridge")
            .field("handle", &self.handle)
            .field("family", &self.family)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ProtocolBridge {
    /// Ask the plugin for its family once, then wrap it.
    pub async fn new(
        handle: PluginHandle,
        adapter: Box<dyn ProtocolAdapter>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut bridge = Self {
            handle,
            adapter,
            family: UNKNOWN_FAMILY.to_string(),
            call_timeout,
        };
        let family = bridge
            .call("backend_type", bridge.adapter.backend_type())
            .await?;
        bridge.family = family;
        Ok(bridge)
    }

    pub fn protocol(&self) -> WireProtocol {
        self.adapter.protocol()
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.handle.ensure_open()?;
        let span = plugin_span!(operation, self.handle.command.as_str(), protocol = %self.adapter.protocol());
        match tokio::time::timeout(self.call_timeout, call).instrument(span).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    command = %self.handle.command,
                    operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Plugin call timed out"
                );
                Err(DbError::transport(format!(
                    "plugin call '{}' timed out after {}ms",
                    operation,
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl DatabaseBackend for ProtocolBridge {
    fn backend_type(&self) -> &str {
        &self.family
    }

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        self.call("initialize", self.adapter.initialize(details, verify_connection))
            .await
    }

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        self.call(
            "create_user",
            self.adapter.create_user(statements, username_config, expiration),
        )
        .await
    }

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        self.call("renew_user", self.adapter.renew_user(statements, username, expiration))
            .await
    }

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()> {
        self.call("revoke_user", self.adapter.revoke_user(statements, username))
            .await
    }

    async fn close(&self) -> Result<()> {
        if !self.handle.mark_closed() {
            return Ok(());
        }

        match tokio::time::timeout(self.call_timeout, self.adapter.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(command = %self.handle.command, error = %e, "Plugin close failed"),
            Err(_) => warn!(command = %self.handle.command, "Plugin close timed out"),
        }
        self.handle.terminate().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FakeAdapter {
        calls: Arc<AtomicUsize>,
        hang: bool,
    }

    #[async_trait]
    impl ProtocolAdapter for FakeAdapter {
        fn protocol(&self) -> WireProtocol {
            WireProtocol::NetRpc
        }

        async fn backend_type(&self) -> Result<String> {
            Ok("fake".to_string())
        }

        async fn initialize(&self, _: &ConnectionDetails, _: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn create_user(
            &self,
            _: &Statements,
            _: &UsernameConfig,
            _: DateTime<Utc>,
        ) -> Result<Credential> {
            Err(DbError::Plugin {
                category: crate::errors::ErrorCategory::Conflict,
                message: "User 'x' already exists".to_string(),
            })
        }

        async fn renew_user(&self, _: &Statements, _: &str, _: DateTime<Utc>) -> Result<()> {
            Ok(())
        }

        async fn revoke_user(&self, _: &Statements, _: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sleeper() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn bridge(hang: bool, calls: Arc<AtomicUsize>) -> ProtocolBridge {
        let handle = PluginHandle::new(
            "sleep".to_string(),
            "00".to_string(),
            WireProtocol::NetRpc,
            "127.0.0.1:1".parse().unwrap(),
            sleeper(),
        );
        ProtocolBridge::new(
            handle,
            Box::new(FakeAdapter { calls, hang }),
            Duration::from_millis(200),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_family_and_remote_errors() {
        let backend = bridge(false, Arc::new(AtomicUsize::new(0))).await;
        assert_eq!(backend.backend_type(), "fake");
        assert_eq!(backend.protocol(), WireProtocol::NetRpc);

        let err = backend
            .create_user(
                &Statements::default(),
                &UsernameConfig::new("x", "r"),
                Utc::now() + chrono::Duration::minutes(5),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::Conflict);
        assert_eq!(err.to_string(), "User 'x' already exists");
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_timeout_is_transport_error() {
        let backend = bridge(true, Arc::new(AtomicUsize::new(0))).await;
        let err = backend
            .initialize(&ConnectionDetails::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Transport { .. }));
        assert!(err.to_string().contains("timed out"));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = bridge(false, calls.clone()).await;

        backend.close().await.unwrap();
        backend.close().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.handle().is_closed());

        let err = backend
            .initialize(&ConnectionDetails::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::State { .. }));
    }
}
