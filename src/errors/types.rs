//! # Error Types
//!
//! Error types for database backends and the plugin boundary using `thiserror`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::tls::TlsError;

/// Custom result type for backend operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Closed set of error categories.
///
/// This is the only error information that survives the plugin boundary: a
/// remote error arrives as a category plus a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Integrity,
    LaunchTimeout,
    Transport,
    Conflict,
    NotFound,
    State,
    Validation,
    Backend,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::LaunchTimeout => "launch_timeout",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::State => "state",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Backend => "backend",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "configuration" => Ok(ErrorCategory::Configuration),
            "integrity" => Ok(ErrorCategory::Integrity),
            "launch_timeout" => Ok(ErrorCategory::LaunchTimeout),
            "transport" => Ok(ErrorCategory::Transport),
            "conflict" => Ok(ErrorCategory::Conflict),
            "not_found" => Ok(ErrorCategory::NotFound),
            "state" => Ok(ErrorCategory::State),
            "validation" => Ok(ErrorCategory::Validation),
            "backend" => Ok(ErrorCategory::Backend),
            other => Err(format!("unknown error category: {}", other)),
        }
    }
}

/// Error as it crosses the plugin boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub category: ErrorCategory,
    pub message: String,
}

/// Main error type for database backends and plugin handling
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// Bad or missing configuration, unsupported family, invalid connection details
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Plugin executable does not match its expected checksum
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    /// Token exchange or handshake did not complete in time
    #[error("Plugin launch timed out after {timeout_ms}ms: {message}")]
    LaunchTimeout { message: String, timeout_ms: u64 },

    /// Subprocess crash, session loss, protocol failure or call timeout
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("User '{username}' already exists")]
    Conflict { username: String },

    #[error("User '{username}' does not exist")]
    NotFound { username: String },

    /// Operation not allowed in the backend's lifecycle state
    #[error("Invalid state: {message}")]
    State { message: String },

    /// Invalid call arguments
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Driver or statement execution failure
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// Error reported by a plugin, rebuilt from its category and message
    #[error("{message}")]
    Plugin {
        category: ErrorCategory,
        message: String,
    },

    /// TLS material generation or configuration failure
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl DbError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an integrity error
    pub fn integrity<S: Into<String>>(message: S) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a launch timeout error
    pub fn launch_timeout<S: Into<String>>(message: S, timeout_ms: u64) -> Self {
        Self::LaunchTimeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a conflict error for an existing user
    pub fn conflict<S: Into<String>>(username: S) -> Self {
        Self::Conflict {
            username: username.into(),
        }
    }

    /// Create a not found error for an unknown user
    pub fn not_found<S: Into<String>>(username: S) -> Self {
        Self::NotFound {
            username: username.into(),
        }
    }

    /// Create a lifecycle state error
    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database {
            source,
            context: context.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DbError::Configuration { .. } => ErrorCategory::Configuration,
            DbError::Integrity { .. } => ErrorCategory::Integrity,
            DbError::LaunchTimeout { .. } => ErrorCategory::LaunchTimeout,
            DbError::Transport { .. } => ErrorCategory::Transport,
            DbError::Conflict { .. } => ErrorCategory::Conflict,
            DbError::NotFound { .. } => ErrorCategory::NotFound,
            DbError::State { .. } => ErrorCategory::State,
            DbError::Validation { .. } => ErrorCategory::Validation,
            DbError::Database { .. } => ErrorCategory::Backend,
            DbError::Plugin { category, .. } => *category,
            DbError::Tls(_) => ErrorCategory::Transport,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::LaunchTimeout | ErrorCategory::Backend
        )
    }

    /// Flatten into the form sent across the plugin boundary.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            DbError::Plugin { message, .. } => message.clone(),
            other => other.to_string(),
        };
        WireError {
            category: self.category(),
            message,
        }
    }

    pub fn from_wire(wire: WireError) -> Self {
        Self::Plugin {
            category: wire.category,
            message: wire.message,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database {
            source: error,
            context: "Database operation failed".to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for DbError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect();
        fields.sort();

        Self::config(format!("Invalid backend configuration: {}", fields.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = DbError::config("unsupported database type: oracle");
        assert!(matches!(error, DbError::Configuration { .. }));
        assert_eq!(error.to_string(), "Configuration error: unsupported database type: oracle");
    }

    #[test]
    fn test_categories() {
        assert_eq!(DbError::integrity("x").category(), ErrorCategory::Integrity);
        assert_eq!(DbError::launch_timeout("x", 10).category(), ErrorCategory::LaunchTimeout);
        assert_eq!(DbError::conflict("alice").category(), ErrorCategory::Conflict);
        assert_eq!(DbError::not_found("alice").category(), ErrorCategory::NotFound);
        assert_eq!(DbError::state("closed").category(), ErrorCategory::State);
        assert_eq!(DbError::validation("x").category(), ErrorCategory::Validation);
        assert_eq!(
            DbError::from(sqlx::Error::PoolTimedOut).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(DbError::transport("broken pipe").is_retryable());
        assert!(DbError::launch_timeout("handshake", 1000).is_retryable());
        assert!(DbError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!DbError::conflict("alice").is_retryable());
        assert!(!DbError::integrity("mismatch").is_retryable());
    }

    #[test]
    fn test_wire_conversion_keeps_category_and_message() {
        let wire = DbError::not_found("alice").to_wire();
        assert_eq!(wire.category, ErrorCategory::NotFound);
        assert_eq!(wire.message, "User 'alice' does not exist");

        let rebuilt = DbError::from_wire(wire.clone());
        assert_eq!(rebuilt.category(), ErrorCategory::NotFound);
        assert_eq!(rebuilt.to_string(), "User 'alice' does not exist");
        // Re-serializing a remote error does not nest its message.
        assert_eq!(rebuilt.to_wire(), wire);
    }

    #[test]
    fn test_category_string_forms() {
        for category in [
            ErrorCategory::Configuration,
            ErrorCategory::LaunchTimeout,
            ErrorCategory::NotFound,
            ErrorCategory::Backend,
        ] {
            assert_eq!(category.as_str().parse::<ErrorCategory>(), Ok(category));
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
        assert!("teapot".parse::<ErrorCategory>().is_err());
    }
}
