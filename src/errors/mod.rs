//! # Error Handling
//!
//! `DbError` is the single error type of the crate. Every variant maps onto a
//! closed [`ErrorCategory`], which is what travels across the plugin boundary.

pub mod tls;
pub mod types;

pub use tls::TlsError;
pub use types::{DbError, ErrorCategory, Result, WireError};
