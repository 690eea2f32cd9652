//! # Legacy (netrpc) Protocol
//!
//! One mutually authenticated TLS connection carrying length-delimited JSON
//! frames. Calls are serialized on the connection; each request carries a
//! sequence number and the reply echoes it, so a reply to an abandoned call is
//! recognized and discarded by the next caller.
//!
//! Unlike gRPC there is no deadline propagation: a timed-out call only stops
//! waiting locally, the plugin still finishes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::bridge::ProtocolAdapter;
use super::pki::{client_config, server_config, TlsBundle};
use super::{WireProtocol, PLUGIN_SERVER_NAME};
use crate::database::{ConnectionDetails, Credential, DatabaseBackend, Statements, UsernameConfig};
use crate::errors::{DbError, Result, WireError};
use crate::secrets::SecretString;

pub const METHOD_TYPE: &str = "Database.Type";
pub const METHOD_INITIALIZE: &str = "Database.Initialize";
pub const METHOD_CREATE_USER: &str = "Database.CreateUser";
pub const METHOD_RENEW_USER: &str = "Database.RenewUser";
pub const METHOD_REVOKE_USER: &str = "Database.RevokeUser";
pub const METHOD_CLOSE: &str = "Database.Close";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRequest {
    pub seq: u64,
    pub method: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyResponse {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TypeReply {
    family: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitializeParams {
    #[serde(default)]
    connection_details: ConnectionDetails,
    #[serde(default)]
    verify_connection: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateUserParams {
    #[serde(default)]
    statements: Statements,
    #[serde(default)]
    username_config: UsernameConfig,
    expiration: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct CreateUserReply {
    username: String,
    password: String,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RenewUserParams {
    #[serde(default)]
    statements: Statements,
    username: String,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RevokeUserParams {
    #[serde(default)]
    statements: Statements,
    username: String,
}

trait LegacyIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LegacyIo for T {}

type Connection = Framed<Box<dyn LegacyIo>, LengthDelimitedCodec>;

fn io_error(context: &str, error: impl std::fmt::Display) -> DbError {
    DbError::transport(format!("{}: {}", context, error))
}

/// Launcher-side client for a plugin speaking the legacy protocol.
pub struct LegacyAdapter {
    connection: Mutex<Connection>,
    next_seq: AtomicU64,
}

impl LegacyAdapter {
    /// Dial `addr` over mutual TLS and probe it with `Database.Type`.
    pub async fn connect(addr: SocketAddr, bundle: &TlsBundle, connect_timeout: Duration) -> Result<Self> {
        let connector = TlsConnector::from(Arc::new(client_config(bundle)?));
        let server_name = ServerName::try_from(PLUGIN_SERVER_NAME)
            .map_err(|e| DbError::config(format!("invalid plugin server name: {}", e)))?;

        let adapter = tokio::time::timeout(connect_timeout, async {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|e| io_error("failed to connect to plugin", e))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| io_error("plugin TLS handshake failed", e))?;
            let adapter = Self::from_stream(tls);
            adapter.backend_type().await?;
            Ok::<_, DbError>(adapter)
        })
        .await
        .map_err(|_| DbError::transport(format!("timed out connecting to legacy plugin at {}", addr)))??;

        debug!(%addr, "Legacy plugin connection established");
        Ok(adapter)
    }

    fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io: Box<dyn LegacyIo> = Box::new(stream);
        Self {
            connection: Mutex::new(Framed::new(io, LengthDelimitedCodec::new())),
            next_seq: AtomicU64::new(1),
        }
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(params)
            .map_err(|e| DbError::validation(format!("failed to encode {} request: {}", method, e)))?;

        let mut connection = self.connection.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_vec(&LegacyRequest {
            seq,
            method: method.to_string(),
            body,
        })
        .map_err(|e| io_error("failed to encode request frame", e))?;

        connection
            .send(Bytes::from(frame))
            .await
            .map_err(|e| io_error("failed to send request to plugin", e))?;

        loop {
            let frame = connection
                .next()
                .await
                .ok_or_else(|| DbError::transport("plugin closed the connection"))?
                .map_err(|e| io_error("failed to read reply from plugin", e))?;
            let response: LegacyResponse = serde_json::from_slice(&frame)
                .map_err(|e| io_error("malformed reply from plugin", e))?;

            if response.seq < seq {
                debug!(seq = response.seq, expected = seq, "Discarding reply to abandoned call");
                continue;
            }
            if response.seq != seq {
                return Err(DbError::transport(format!(
                    "reply sequence {} does not match request {}",
                    response.seq, seq
                )));
            }
            if let Some(error) = response.error {
                return Err(DbError::from_wire(error));
            }
            return serde_json::from_value(response.result.unwrap_or(Value::Null))
                .map_err(|e| io_error("unexpected reply body from plugin", e));
        }
    }
}

#[async_trait]
impl ProtocolAdapter for LegacyAdapter {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::NetRpc
    }

    async fn backend_type(&self) -> Result<String> {
        let reply: TypeReply = self.call(METHOD_TYPE, &Value::Null).await?;
        Ok(reply.family)
    }

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        self.call(
            METHOD_INITIALIZE,
            &InitializeParams {
                connection_details: details.clone(),
                verify_connection,
            },
        )
        .await
    }

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        let reply: CreateUserReply = self
            .call(
                METHOD_CREATE_USER,
                &CreateUserParams {
                    statements: statements.clone(),
                    username_config: username_config.clone(),
                    expiration,
                },
            )
            .await?;
        Ok(Credential {
            username: reply.username,
            password: SecretString::new(reply.password),
            expiration: reply.expiration,
        })
    }

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        self.call(
            METHOD_RENEW_USER,
            &RenewUserParams {
                statements: statements.clone(),
                username: username.to_string(),
                expiration,
            },
        )
        .await
    }

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()> {
        self.call(
            METHOD_REVOKE_USER,
            &RevokeUserParams {
                statements: statements.clone(),
                username: username.to_string(),
            },
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        self.call(METHOD_CLOSE, &Value::Null).await
    }
}

fn params<T: DeserializeOwned>(method: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| DbError::validation(format!("invalid {} request: {}", method, e)))
}

fn reply<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| io_error("failed to encode reply", e))
}

async fn dispatch(backend: &dyn DatabaseBackend, method: &str, body: Value) -> Result<Value> {
    match method {
        METHOD_TYPE => reply(&TypeReply {
            family: backend.backend_type().to_string(),
        }),
        METHOD_INITIALIZE => {
            let p: InitializeParams = params(method, body)?;
            backend
                .initialize(&p.connection_details, p.verify_connection)
                .await?;
            Ok(Value::Null)
        }
        METHOD_CREATE_USER => {
            let p: CreateUserParams = params(method, body)?;
            let credential = backend
                .create_user(&p.statements, &p.username_config, p.expiration)
                .await?;
            reply(&CreateUserReply {
                username: credential.username,
                password: credential.password.expose_secret().to_string(),
                expiration: credential.expiration,
            })
        }
        METHOD_RENEW_USER => {
            let p: RenewUserParams = params(method, body)?;
            backend
                .renew_user(&p.statements, &p.username, p.expiration)
                .await?;
            Ok(Value::Null)
        }
        METHOD_REVOKE_USER => {
            let p: RevokeUserParams = params(method, body)?;
            backend.revoke_user(&p.statements, &p.username).await?;
            Ok(Value::Null)
        }
        METHOD_CLOSE => {
            backend.close().await?;
            Ok(Value::Null)
        }
        other => Err(DbError::validation(format!("unknown method '{}'", other))),
    }
}

async fn handle_connection<S>(stream: S, backend: Arc<dyn DatabaseBackend>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| io_error("failed to read request frame", e))?;
        let request: LegacyRequest =
            serde_json::from_slice(&frame).map_err(|e| io_error("malformed request frame", e))?;

        let response = match dispatch(backend.as_ref(), &request.method, request.body).await {
            Ok(result) => LegacyResponse {
                seq: request.seq,
                result: Some(result),
                error: None,
            },
            Err(e) => LegacyResponse {
                seq: request.seq,
                result: None,
                error: Some(e.to_wire()),
            },
        };

        let bytes = serde_json::to_vec(&response).map_err(|e| io_error("failed to encode reply", e))?;
        framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| io_error("failed to send reply", e))?;
    }

    Ok(())
}

/// Serve `backend` on `listener`. Each connection is handled on its own task.
pub async fn serve(
    listener: TcpListener,
    bundle: &TlsBundle,
    backend: Arc<dyn DatabaseBackend>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config(bundle, true)?));
    let addr = listener
        .local_addr()
        .map_err(|e| io_error("failed to read listener address", e))?;
    info!(%addr, family = %backend.backend_type(), "Serving plugin over netrpc");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Legacy accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    warn!(%peer, error = %e, "Legacy TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = handle_connection(tls, backend).await {
                debug!(%peer, error = %e, "Legacy connection ended");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Names {
        taken: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl DatabaseBackend for Names {
        fn backend_type(&self) -> &str {
            "names"
        }

        async fn initialize(&self, details: &ConnectionDetails, _: bool) -> Result<()> {
            if details.is_empty() {
                return Err(DbError::config("connection details must not be empty"));
            }
            Ok(())
        }

        async fn create_user(
            &self,
            _: &Statements,
            config: &UsernameConfig,
            expiration: DateTime<Utc>,
        ) -> Result<Credential> {
            if !self.taken.lock().await.insert(config.display_name.clone()) {
                return Err(DbError::conflict(config.display_name.clone()));
            }
            Ok(Credential {
                username: config.display_name.clone(),
                password: "test".into(),
                expiration,
            })
        }

        async fn renew_user(&self, _: &Statements, username: &str, _: DateTime<Utc>) -> Result<()> {
            if !self.taken.lock().await.contains(username) {
                return Err(DbError::not_found(username));
            }
            Ok(())
        }

        async fn revoke_user(&self, _: &Statements, username: &str) -> Result<()> {
            if !self.taken.lock().await.remove(username) {
                return Err(DbError::not_found(username));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn in_process() -> LegacyAdapter {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, Arc::new(Names::default())));
        LegacyAdapter::from_stream(client)
    }

    #[tokio::test]
    async fn test_calls_round_trip_through_frames() {
        let adapter = in_process();
        assert_eq!(adapter.backend_type().await.unwrap(), "names");

        let err = adapter
            .initialize(&ConnectionDetails::new(), true)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let expiration = Utc::now() + chrono::Duration::minutes(10);
        let config = UsernameConfig::new("app", "rw");
        let credential = adapter
            .create_user(&Statements::default(), &config, expiration)
            .await
            .unwrap();
        assert_eq!(credential.username, "app");
        assert_eq!(credential.password.expose_secret(), "test");
        assert_eq!(credential.expiration, expiration);

        let err = adapter
            .create_user(&Statements::default(), &config, expiration)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Plugin { .. }));
        assert_eq!(err.category(), ErrorCategory::Conflict);

        adapter
            .renew_user(&Statements::default(), "app", expiration)
            .await
            .unwrap();
        adapter.revoke_user(&Statements::default(), "app").await.unwrap();
        let err = adapter
            .renew_user(&Statements::default(), "app", expiration)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let adapter = in_process();
        let err = adapter
            .call::<_, Value>("Database.Drop", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("unknown method"));
    }

    #[tokio::test]
    async fn test_stale_replies_are_skipped() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let adapter = LegacyAdapter::from_stream(client);

        tokio::spawn(async move {
            let mut framed = Framed::new(server, LengthDelimitedCodec::new());
            let frame = framed.next().await.unwrap().unwrap();
            let request: LegacyRequest = serde_json::from_slice(&frame).unwrap();
            for seq in [request.seq - 1, request.seq] {
                let reply = LegacyResponse {
                    seq,
                    result: Some(serde_json::json!({"family": format!("reply-{}", seq)})),
                    error: None,
                };
                framed
                    .send(Bytes::from(serde_json::to_vec(&reply).unwrap()))
                    .await
                    .unwrap();
            }
        });

        // Burn one sequence number as if a previous call had been abandoned.
        adapter.next_seq.fetch_add(1, Ordering::SeqCst);
        assert_eq!(adapter.backend_type().await.unwrap(), "reply-2");
    }

    #[tokio::test]
    async fn test_closed_connection_is_transport_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let adapter = LegacyAdapter::from_stream(client);
        let err = adapter.backend_type().await.unwrap_err();
        assert!(matches!(err, DbError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_mtls_connect_and_serve() {
        crate::plugin::pki::install_crypto_provider();
        let pki = crate::plugin::PluginPki::generate(Duration::from_secs(3600)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bundle = pki.plugin.clone();
        let server = tokio::spawn(async move {
            serve(listener, &bundle, Arc::new(Names::default())).await
        });

        let adapter = LegacyAdapter::connect(addr, &pki.launcher, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(adapter.protocol(), WireProtocol::NetRpc);
        assert_eq!(adapter.backend_type().await.unwrap(), "names");

        server.abort();
    }
}
