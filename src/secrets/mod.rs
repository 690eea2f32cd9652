//! # Secret Handling
//!
//! Types that keep credentials and key material out of logs and serialized output.

pub mod types;

pub use types::SecretString;
