//! # Plugin Launcher
//!
//! Verifies a plugin executable, starts it, bootstraps mutual TLS through the
//! wrapping-token exchange and negotiates the wire protocol. The result is a
//! [`ProtocolBridge`] that owns the subprocess.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};
use validator::Validate;

use super::bridge::{PluginHandle, ProtocolAdapter, ProtocolBridge};
use super::checksum;
use super::grpc::GrpcAdapter;
use super::handshake::Handshake;
use super::legacy::LegacyAdapter;
use super::pki::{install_crypto_provider, PluginPki, TlsBundle};
use super::wrapping::{CallbackServer, WrappingStore};
use super::{
    WireProtocol, ENV_CALLBACK_ADDR, ENV_CALLBACK_CA, ENV_MAGIC_COOKIE, ENV_WRAPPING_TOKEN,
    MAGIC_COOKIE_VALUE,
};
use crate::config::LauncherConfig;
use crate::errors::{DbError, Result};
use crate::observability::MetricsRecorder;

/// Starts plugin subprocesses.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: LauncherConfig,
    recorder: MetricsRecorder,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            recorder: MetricsRecorder::new(),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Launch `command` with `args` after checking it against `checksum_hex`.
    ///
    /// A checksum mismatch fails before anything is executed. Every failure
    /// after the spawn kills the child. Nothing is retried.
    pub async fn launch(
        &self,
        command: &str,
        args: &[String],
        checksum_hex: &str,
    ) -> Result<ProtocolBridge> {
        let started = Instant::now();
        let result = self.launch_inner(command, args, checksum_hex).await;

        let protocol = match &result {
            Ok(bridge) => bridge.protocol().as_str(),
            Err(_) => "none",
        };
        self.recorder
            .record_plugin_launch(protocol, result.is_ok(), started.elapsed());

        match &result {
            Ok(bridge) => info!(
                command,
                protocol,
                family = %crate::database::DatabaseBackend::backend_type(bridge),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Plugin launched"
            ),
            Err(e) => warn!(command, error = %e, category = %e.category(), "Plugin launch failed"),
        }
        result
    }

    async fn launch_inner(
        &self,
        command: &str,
        args: &[String],
        checksum_hex: &str,
    ) -> Result<ProtocolBridge> {
        self.config.validate()?;
        let executable = checksum::resolve_executable(command).await?;
        checksum::verify(&executable, checksum_hex).await?;

        install_crypto_provider();
        let pki = PluginPki::generate(self.config.certificate_ttl())?;
        let store = Arc::new(WrappingStore::new());
        let token = store.wrap(pki.plugin.clone()).await;
        let callback = CallbackServer::start(store, &pki.launcher).await?;

        let mut child = Command::new(&executable)
            .args(args)
            .env(ENV_WRAPPING_TOKEN, token.expose_secret())
            .env(ENV_CALLBACK_ADDR, callback.addr().to_string())
            .env(ENV_CALLBACK_CA, &pki.ca_certificate)
            .env(ENV_MAGIC_COOKIE, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DbError::config(format!("failed to start plugin '{}': {}", command, e)))?;
        debug!(command, executable = %executable.display(), pid = ?child.id(), "Plugin process started");

        if let Some(stderr) = child.stderr.take() {
            let plugin = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %plugin, "{}", line);
                }
            });
        }

        let Some(stdout) = child.stdout.take() else {
            kill(&mut child, command).await;
            return Err(DbError::transport("plugin stdout is not captured"));
        };
        let mut stdout = BufReader::new(stdout).lines();

        let waited = tokio::time::timeout(self.config.launch_timeout(), async {
            let handshake = read_handshake(&mut stdout).await?;
            callback.wait_for_exchange().await?;
            Ok::<_, DbError>(handshake)
        })
        .await;
        callback.shutdown();

        let handshake = match waited {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                kill(&mut child, command).await;
                return Err(e);
            }
            Err(_) => {
                kill(&mut child, command).await;
                return Err(DbError::launch_timeout(
                    format!("plugin '{}' did not complete the token exchange and handshake", command),
                    self.config.launch_timeout_ms,
                ));
            }
        };
        drain_stdout(command.to_string(), stdout);

        let adapter = match self.negotiate(&handshake, &pki.launcher).await {
            Ok(adapter) => adapter,
            Err(e) => {
                kill(&mut child, command).await;
                return Err(e);
            }
        };

        let handle = PluginHandle::new(
            executable.display().to_string(),
            checksum_hex.to_ascii_lowercase(),
            adapter.protocol(),
            handshake.addr,
            child,
        );
        ProtocolBridge::new(handle, adapter, self.config.call_timeout()).await
    }

    /// Pick the protocol once. gRPC is tried first unless the plugin
    /// advertised netrpc; a failed gRPC handshake falls back to netrpc.
    async fn negotiate(
        &self,
        handshake: &Handshake,
        bundle: &TlsBundle,
    ) -> Result<Box<dyn ProtocolAdapter>> {
        let timeout = self.config.handshake_timeout();

        if handshake.protocol == WireProtocol::NetRpc {
            let adapter = LegacyAdapter::connect(handshake.addr, bundle, timeout).await?;
            return Ok(Box::new(adapter));
        }

        match GrpcAdapter::connect(handshake.addr, bundle, timeout, self.config.call_timeout()).await {
            Ok(adapter) => Ok(Box::new(adapter)),
            Err(grpc_error) => {
                warn!(
                    addr = %handshake.addr,
                    error = %grpc_error,
                    "gRPC handshake failed, falling back to netrpc"
                );
                self.recorder.record_protocol_fallback();
                let adapter = LegacyAdapter::connect(handshake.addr, bundle, timeout)
                    .await
                    .map_err(|legacy_error| {
                        DbError::transport(format!(
                            "plugin at {} speaks neither protocol (grpc: {}; netrpc: {})",
                            handshake.addr, grpc_error, legacy_error
                        ))
                    })?;
                Ok(Box::new(adapter))
            }
        }
    }
}

async fn read_handshake(stdout: &mut Lines<BufReader<ChildStdout>>) -> Result<Handshake> {
    loop {
        let line = stdout
            .next_line()
            .await
            .map_err(|e| DbError::transport(format!("failed to read plugin stdout: {}", e)))?
            .ok_or_else(|| DbError::transport("plugin exited before printing its handshake"))?;
        if line.trim().is_empty() {
            continue;
        }
        return Handshake::parse(&line);
    }
}

// Keeps the pipe from filling up if the plugin writes more to stdout.
fn drain_stdout(plugin: String, mut stdout: Lines<BufReader<ChildStdout>>) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = stdout.next_line().await {
            debug!(plugin = %plugin, stream = "stdout", "{}", line);
        }
    });
}

async fn kill(child: &mut Child, command: &str) {
    if let Err(e) = child.kill().await {
        debug!(command, error = %e, "Plugin process already exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::checksum::sha256_file;

    const SHELL: &str = "/bin/sh";

    fn launcher(launch_timeout_ms: u64) -> Launcher {
        Launcher::new(LauncherConfig {
            launch_timeout_ms,
            ..LauncherConfig::default()
        })
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_executes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("executed");
        let wrong = "00".repeat(32);

        let err = launcher(2_000)
            .launch(SHELL, &script(&format!("touch {}", marker.display())), &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Integrity { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_silent_plugin_times_out() {
        let checksum = sha256_file(SHELL).await.unwrap();
        let started = Instant::now();
        let err = launcher(300)
            .launch(SHELL, &script("sleep 30"), &checksum)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::LaunchTimeout { timeout_ms: 300, .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_plugin_exiting_early_is_transport_error() {
        let checksum = sha256_file(SHELL).await.unwrap();
        let err = launcher(5_000)
            .launch(SHELL, &script("exit 3"), &checksum)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Transport { .. }));
        assert!(err.to_string().contains("before printing its handshake"));
    }

    #[tokio::test]
    async fn test_garbage_handshake_is_rejected() {
        let checksum = sha256_file(SHELL).await.unwrap();
        let err = launcher(5_000)
            .launch(SHELL, &script("echo 'ready'; sleep 30"), &checksum)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_grpc_failure_falls_back_to_netrpc() {
        use crate::database::sql::{SqlBackend, POSTGRES};
        use crate::database::{DatabaseBackend, PoolSettings};
        use crate::plugin::legacy;

        install_crypto_provider();
        let pki = PluginPki::generate(std::time::Duration::from_secs(3600)).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bundle = pki.plugin.clone();
        let backend: Arc<dyn DatabaseBackend> =
            Arc::new(SqlBackend::new(POSTGRES, PoolSettings::default()));
        let server = tokio::spawn(async move { legacy::serve(listener, &bundle, backend).await });

        // Advertises gRPC but only speaks netrpc.
        let adapter = launcher(5_000)
            .negotiate(&Handshake::new(addr, WireProtocol::Grpc), &pki.launcher)
            .await
            .unwrap();
        assert_eq!(adapter.protocol(), WireProtocol::NetRpc);
        assert_eq!(adapter.backend_type().await.unwrap(), "postgres");

        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_launcher_config() {
        let launcher = Launcher::new(LauncherConfig {
            call_timeout_ms: 1,
            ..LauncherConfig::default()
        });
        let err = launcher
            .launch(SHELL, &[], &"00".repeat(32))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_oversized_certificate_ttl_is_rejected() {
        let launcher = Launcher::new(LauncherConfig {
            certificate_ttl_hours: 100_000_000_000,
            ..LauncherConfig::default()
        });
        let checksum = sha256_file(SHELL).await.unwrap();
        let err = launcher
            .launch(SHELL, &script("exit 0"), &checksum)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }
}
