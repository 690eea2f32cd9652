//! Metrics around any backend.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ConnectionDetails, Credential, DatabaseBackend, Statements, UsernameConfig};
use crate::errors::Result;
use crate::observability::MetricsRecorder;

/// Records a counter and a latency histogram for every lifecycle call, then
/// hands back the inner result untouched.
pub struct MetricsMiddleware {
    inner: Box<dyn DatabaseBackend>,
    family: String,
    recorder: MetricsRecorder,
}

impl MetricsMiddleware {
    pub fn new(inner: Box<dyn DatabaseBackend>, recorder: MetricsRecorder) -> Self {
        let family = inner.backend_type().to_string();
        Self {
            inner,
            family,
            recorder,
        }
    }

    async fn observe<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.category().as_str(),
        };
        self.recorder
            .record_backend_operation(&self.family, operation, status, started.elapsed());
        result
    }
}

#[async_trait]
impl DatabaseBackend for MetricsMiddleware {
    fn backend_type(&self) -> &str {
        self.inner.backend_type()
    }

    async fn initialize(&self, details: &ConnectionDetails, verify_connection: bool) -> Result<()> {
        self.observe("initialize", self.inner.initialize(details, verify_connection))
            .await
    }

    async fn create_user(
        &self,
        statements: &Statements,
        username_config: &UsernameConfig,
        expiration: DateTime<Utc>,
    ) -> Result<Credential> {
        self.observe(
            "create_user",
            self.inner.create_user(statements, username_config, expiration),
        )
        .await
    }

    async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: DateTime<Utc>,
    ) -> Result<()> {
        self.observe("renew_user", self.inner.renew_user(statements, username, expiration))
            .await
    }

    async fn revoke_user(&self, statements: &Statements, username: &str) -> Result<()> {
        self.observe("revoke_user", self.inner.revoke_user(statements, username))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.observe("close", self.inner.close()).await
    }
}
