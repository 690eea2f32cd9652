//! # gRPC Protocol
//!
//! The current plugin protocol: `dbplugin.Database` over HTTP/2 with mutual
//! TLS. The client half is a [`ProtocolAdapter`]; the server half exposes any
//! [`DatabaseBackend`]. Deadlines travel as `grpc-timeout`, and dropping a
//! call drops its HTTP/2 stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{
    Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Server, ServerTlsConfig,
};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info};

use super::bridge::ProtocolAdapter;
use super::pb::database_client::DatabaseClient;
use super::pb::database_server::{Database, DatabaseServer};
use super::pb;
use super::pki::TlsBundle;
use super::{WireProtocol, PLUGIN_SERVER_NAME};
use crate::database::{ConnectionDetails, Credential, DatabaseBackend, Statements, UsernameConfig};
use crate::errors::{DbError, ErrorCategory, Result};
use crate::secrets::SecretString;

/// Metadata key carrying the [`ErrorCategory`] of a failed call.
pub const ERROR_CATEGORY_METADATA: &str = "x-dbplugin-error-category";

/// Encode a backend error as a gRPC status.
pub fn status_from_error(error: &DbError) -> Status {
    let wire = error.to_wire();
    let code = match wire.category {
        ErrorCategory::Conflict => Code::AlreadyExists,
        ErrorCategory::NotFound => Code::NotFound,
        ErrorCategory::State => Code::FailedPrecondition,
        ErrorCategory::Validation | ErrorCategory::Configuration => Code::InvalidArgument,
        ErrorCategory::Transport | ErrorCategory::LaunchTimeout => Code::Unavailable,
        ErrorCategory::Integrity => Code::PermissionDenied,
        ErrorCategory::Backend => Code::Internal,
    };

    let mut metadata = MetadataMap::new();
    metadata.insert(
        ERROR_CATEGORY_METADATA,
        MetadataValue::from_static(wire.category.as_str()),
    );
    Status::with_metadata(code, wire.message, metadata)
}

/// Decode a status received from a plugin. Statuses without a category were
/// produced by the transport, not the backend.
pub fn error_from_status(status: Status) -> DbError {
    let category = status
        .metadata()
        .get(ERROR_CATEGORY_METADATA)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<ErrorCategory>().ok());

    match category {
        Some(category) => DbError::Plugin {
            category,
            message: status.message().to_string(),
        },
        None => DbError::transport(format!(
            "gRPC call failed ({:?}): {}",
            status.code(),
            status.message()
        )),
    }
}

fn to_expiration(at: DateTime<Utc>) -> pb::Expiration {
    pb::Expiration {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos(),
    }
}

fn from_expiration(expiration: Option<pb::Expiration>) -> Result<DateTime<Utc>> {
    let expiration = expiration.unwrap_or_default();
    DateTime::from_timestamp(expiration.seconds, expiration.nanos).ok_or_else(|| {
        DbError::validation(format!(
            "expiration {}s/{}ns is out of range",
            expiration.seconds, expiration.nanos
        ))
    })
}

impl From<&Statements> for pb::Statements {
    fn from(statements: &Statements) -> Self {
        Self {
            creation: statements.creation.clone(),
            revocation: statements.revocation.clone(),
            rollback: statements.rollback.clone(),
            renew: statements.renew.clone(),
        }
    }
}

impl From<pb::Statements> for Statements {
    fn from(statements: pb::Statements) -> Self {
        Self {
            creation: statements.creation,
            revocation: statements.revocation,
            rollback: statements.rollback,
            renew: statements.renew,
        }
    }
}

impl From<&UsernameConfig> for pb::UsernameConfig {
    fn from(config: &UsernameConfig) -> Self {
        Self {
            display_name: config.display_name.clone(),
            role_name: config.role_name.clone(),
        }
    }
}

impl From<pb::UsernameConfig> for UsernameConfig {
    fn from(config: pb::UsernameConfig) -> Self {
        Self {
            display_name: config.display_name,
            role_name: config.role_name,
        }
    }
}

/// Launcher-side client for a plugin speaking gRPC.
pub struct GrpcAdapter {
    client: DatabaseClient<Channel>,
    call_timeout: Duration,
}

impl GrpcAdapter {
    /// Dial `addr` with the launcher's certificate and probe it with `BackendType`.
    pub async fn connect(
        addr: SocketAddr,
        bundle: &TlsBundle,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&bundle.ca_certificate))
            .identity(Identity::from_pem(
                &bundle.certificate,
                bundle.private_key.expose_secret(),
            ))
            .domain_name(PLUGIN_SERVER_NAME);

        let endpoint = Endpoint::from_shared(format!("https://{}", addr))
            .map_err(|e| DbError::transport(format!("invalid plugin endpoint {}: {}", addr, e)))?
            .tls_config(tls)
            .map_err(|e| DbError::transport(format!("invalid plugin TLS configuration: {}", e)))?
            .connect_timeout(connect_timeout);

        let channel = tokio::time::timeout(connect_timeout, endpoint.connect())
            .await
            .map_err(|_| DbError::transport(format!("timed out connecting to plugin at {}", addr)))?
            .map_err(|e| DbError::transport(format!("failed to connect to plugin at {}: {}", addr, e)))?;

        let adapter = Self {
            client: DatabaseClient::new(channel),
            call_timeout,
        };

        let family = tokio::time::timeout(connect_timeout, adapter.backend_type())
            .await
            .map_err(|_| DbError::transport(format!("gRPC probe of {} timed out", addr)))??;
        debug!(%addr, family = %family, "gRPC plugin connection established");

        Ok(adapter)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.call_timeout);
        request
    }
}

#[async_trait]
impl ProtocolAdapter for GrpcAdapter {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Grpc
    }

    async fn backend_type(&self) -> Result<String> {
        let response = self
            .client
            .clone()
            .backend_type(self.request(pb::Empty {}))
            .await
            .map_err(error_from_status)?;
        Ok(response.into_inner().family)
    }

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        let connection_details = serde_json::to_string(details)
            .map_err(|e| DbError::config(format!("failed to encode connection details: {}", e)))?;
        self.client
            .clone()
            .initialize(self.request(pb::InitializeRequest {
                connection_details,
                verify_connection,
            }))
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        let response = self
            .client
            .clone()
            .create_user(self.request(pb::CreateUserRequest {
                statements: Some(statements.into()),
                username_config: Some(username_config.into()),
                expiration: Some(to_expiration(expiration)),
            }))
            .await
            .map_err(error_from_status)?
            .into_inner();

        let expiration = match response.expiration {
            Some(value) => from_expiration(Some(value))?,
            None => expiration,
        };
        Ok(Credential {
            username: response.username,
            password: SecretString::new(response.password),
            expiration,
        })
    }

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        self.client
            .clone()
            .renew_user(self.request(pb::RenewUserRequest {
                statements: Some(statements.into()),
                username: username.to_string(),
                expiration: Some(to_expiration(expiration)),
            }))
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()> {
        self.client
            .clone()
            .revoke_user(self.request(pb::RevokeUserRequest {
                statements: Some(statements.into()),
                username: username.to_string(),
            }))
            .await
            .map_err(error_from_status)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client
            .clone()
            .close(self.request(pb::Empty {}))
            .await
            .map_err(error_from_status)?;
        Ok(())
    }
}

/// Plugin-side gRPC service over a local backend.
pub struct DatabaseService {
    backend: Arc<dyn DatabaseBackend>,
}

impl DatabaseService {
    pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Database for DatabaseService {
    async fn backend_type(
        &self,
        _request: Request<pb::Empty>,
    ) -> std::result::Result<Response<pb::TypeResponse>, Status> {
        Ok(Response::new(pb::TypeResponse {
            family: self.backend.backend_type().to_string(),
        }))
    }

    async fn initialize(
        &self,
        request: Request<pb::InitializeRequest>,
    ) -> std::result::Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let details = parse_details(&request.connection_details).map_err(|e| status_from_error(&e))?;
        self.backend
            .initialize(&details, request.verify_connection)
            .await
            .map_err(|e| status_from_error(&e))?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn create_user(
        &self,
        request: Request<pb::CreateUserRequest>,
    ) -> std::result::Result<Response<pb::CreateUserResponse>, Status> {
        let request = request.into_inner();
        let expiration = from_expiration(request.expiration).map_err(|e| status_from_error(&e))?;
        let credential = self
            .backend
            .create_user(
                &request.statements.unwrap_or_default().into(),
                &request.username_config.unwrap_or_default().into(),
                expiration,
            )
            .await
            .map_err(|e| status_from_error(&e))?;

        Ok(Response::new(pb::CreateUserResponse {
            username: credential.username,
            password: credential.password.expose_secret().to_string(),
            expiration: Some(to_expiration(credential.expiration)),
        }))
    }

    async fn renew_user(
        &self,
        request: Request<pb::RenewUserRequest>,
    ) -> std::result::Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        let expiration = from_expiration(request.expiration).map_err(|e| status_from_error(&e))?;
        self.backend
            .renew_user(
                &request.statements.unwrap_or_default().into(),
                &request.username,
                expiration,
            )
            .await
            .map_err(|e| status_from_error(&e))?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn revoke_user(
        &self,
        request: Request<pb::RevokeUserRequest>,
    ) -> std::result::Result<Response<pb::Empty>, Status> {
        let request = request.into_inner();
        self.backend
            .revoke_user(&request.statements.unwrap_or_default().into(), &request.username)
            .await
            .map_err(|e| status_from_error(&e))?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn close(
        &self,
        _request: Request<pb::Empty>,
    ) -> std::result::Result<Response<pb::Empty>, Status> {
        self.backend.close().await.map_err(|e| status_from_error(&e))?;
        Ok(Response::new(pb::Empty {}))
    }
}

/// Connection details arrive as a JSON object; an empty string means none.
pub(crate) fn parse_details(raw: &str) -> Result<ConnectionDetails> {
    if raw.trim().is_empty() {
        return Ok(ConnectionDetails::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| DbError::config(format!("connection details are not a JSON object: {}", e)))
}

/// Serve `backend` on `listener`, requiring client certificates from the bundle's CA.
pub async fn serve(
    listener: TcpListener,
    bundle: &TlsBundle,
    backend: Arc<dyn DatabaseBackend>,
) -> Result<()> {
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(
            &bundle.certificate,
            bundle.private_key.expose_secret(),
        ))
        .client_ca_root(Certificate::from_pem(&bundle.ca_certificate));

    let addr = listener
        .local_addr()
        .map_err(|e| DbError::transport(format!("failed to read listener address: {}", e)))?;
    info!(%addr, family = %backend.backend_type(), "Serving plugin over gRPC");

    Server::builder()
        .tls_config(tls)
        .map_err(|e| DbError::transport(format!("invalid gRPC TLS configuration: {}", e)))?
        .add_service(DatabaseServer::new(DatabaseService::new(backend)))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(|e| DbError::transport(format!("gRPC plugin server failed: {}", e)))
}
