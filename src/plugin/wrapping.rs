//! # Wrapping-token Exchange
//!
//! The launcher never writes TLS material into the plugin's environment.
//! Instead it stores the plugin's bundle under a random single-use token and
//! serves it once over a loopback HTTPS endpoint. The plugin learns the token,
//! the endpoint address and the endpoint's CA from its environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::serve::Listener;
use axum::{Json, Router};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::pki::{server_config, TlsBundle};
use super::PLUGIN_SERVER_NAME;
use crate::errors::{DbError, Result};
use crate::secrets::SecretString;

pub const UNWRAP_PATH: &str = "/v1/wrapping/unwrap";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-use tokens mapped to the bundles they unwrap.
#[derive(Default)]
pub struct WrappingStore {
    entries: Mutex<HashMap<String, TlsBundle>>,
}

impl WrappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bundle` under a fresh 256-bit token.
    pub async fn wrap(&self, bundle: TlsBundle) -> SecretString {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.entries.lock().await.insert(token.clone(), bundle);
        SecretString::new(token)
    }

    /// Remove and return the bundle for `token`. A second call yields `None`.
    pub async fn unwrap(&self, token: &str) -> Option<TlsBundle> {
        self.entries.lock().await.remove(token)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UnwrapRequest {
    token: String,
}

#[derive(Serialize, Deserialize)]
struct UnwrapResponse {
    certificate: String,
    private_key: String,
    ca_certificate: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

struct CallbackState {
    store: Arc<WrappingStore>,
    exchanged: watch::Sender<bool>,
}

async fn unwrap_handler(
    State(state): State<Arc<CallbackState>>,
    Json(request): Json<UnwrapRequest>,
) -> Response {
    match state.store.unwrap(&request.token).await {
        Some(bundle) => {
            debug!("Wrapping token exchanged");
            state.exchanged.send_replace(true);
            Json(UnwrapResponse {
                certificate: bundle.certificate,
                private_key: bundle.private_key.expose_secret().to_string(),
                ca_certificate: bundle.ca_certificate,
            })
            .into_response()
        }
        None => {
            warn!("Rejected unknown or already used wrapping token");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "wrapping token is invalid or already used".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Loopback HTTPS endpoint serving [`UNWRAP_PATH`] for one launch.
pub struct CallbackServer {
    addr: SocketAddr,
    exchanged: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind on `127.0.0.1:0` and serve with `bundle` as the server identity.
    pub async fn start(store: Arc<WrappingStore>, bundle: &TlsBundle) -> Result<Self> {
        let acceptor = TlsAcceptor::from(Arc::new(server_config(bundle, false)?));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DbError::transport(format!("failed to bind callback server: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DbError::transport(format!("failed to read callback address: {}", e)))?;

        let (tx, exchanged) = watch::channel(false);
        let state = Arc::new(CallbackState {
            store,
            exchanged: tx,
        });
        let router = Router::new()
            .route(UNWRAP_PATH, post(unwrap_handler))
            .with_state(state);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(TlsListener::new(listener, acceptor), router).await {
                error!(error = %e, "Wrapping callback server failed");
            }
        });

        debug!(%addr, "Wrapping callback server listening");
        Ok(Self {
            addr,
            exchanged,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolve once the token has been exchanged.
    pub async fn wait_for_exchange(&self) -> Result<()> {
        let mut exchanged = self.exchanged.clone();
        exchanged
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| DbError::transport("callback server stopped before the token exchange"))
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    fn new(listener: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { listener, acceptor }
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => match self.acceptor.accept(stream).await {
                    Ok(tls_stream) => return (tls_stream, addr),
                    Err(err) => {
                        warn!(error = %err, %addr, "Callback TLS handshake failed");
                        continue;
                    }
                },
                Err(err) => {
                    if is_connection_error(&err) {
                        continue;
                    }
                    error!("Callback accept error: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}

fn is_connection_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

/// Plugin side: trade `token` for this launch's TLS bundle.
pub async fn unwrap_token(callback_addr: &str, ca_pem: &str, token: &str) -> Result<TlsBundle> {
    let addr: SocketAddr = callback_addr
        .parse()
        .map_err(|_| DbError::config(format!("invalid callback address '{}'", callback_addr)))?;
    let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes())
        .map_err(|e| DbError::config(format!("invalid callback CA certificate: {}", e)))?;

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca)
        .resolve(PLUGIN_SERVER_NAME, addr)
        .timeout(EXCHANGE_TIMEOUT)
        .build()
        .map_err(|e| DbError::transport(format!("failed to build callback client: {}", e)))?;

    let url = format!("https://{}:{}{}", PLUGIN_SERVER_NAME, addr.port(), UNWRAP_PATH);
    let response = client
        .post(&url)
        .json(&UnwrapRequest {
            token: token.to_string(),
        })
        .send()
        .await
        .map_err(|e| DbError::transport(format!("token exchange request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        return Err(DbError::transport(format!("token exchange rejected: {}", message)));
    }

    let body: UnwrapResponse = response
        .json()
        .await
        .map_err(|e| DbError::transport(format!("invalid token exchange response: {}", e)))?;

    Ok(TlsBundle {
        certificate: body.certificate,
        private_key: SecretString::new(body.private_key),
        ca_certificate: body.ca_certificate,
    })
}
