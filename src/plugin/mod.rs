//! # Plugin Subsystem
//!
//! Runs database backends as separate executables. The launcher side
//! ([`Launcher`]) verifies and spawns the binary, bootstraps mutual TLS through
//! a single-use wrapping token, and hands back a [`ProtocolBridge`]. The
//! plugin side ([`serve()`]) is what a plugin binary calls to expose its
//! [`crate::database::DatabaseBackend`] over either wire protocol.
//!
//! ```text
//! Launcher ── checksum ── spawn ──► plugin
//!    │  ◄── POST /v1/wrapping/unwrap ──┤
//!    │  ◄── "1|4|tcp|ADDR|grpc" ───────┤ (stdout)
//!    └──── mTLS gRPC / netrpc ────────►┘
//! ```

use std::fmt;
use std::str::FromStr;

pub mod bridge;
pub mod checksum;
pub mod grpc;
pub mod handshake;
pub mod launcher;
pub mod legacy;
pub mod pki;
pub mod serve;
pub mod wrapping;

pub use bridge::{PluginHandle, ProtocolAdapter, ProtocolBridge};
pub use handshake::Handshake;
pub use launcher::Launcher;
pub use pki::{PluginPki, TlsBundle};
pub use serve::{serve, ServeOptions};

/// Generated gRPC types for the `dbplugin.Database` service.
pub mod pb {
    tonic::include_proto!("dbplugin");
}

pub const ENV_WRAPPING_TOKEN: &str = "DBPLUGIN_WRAPPING_TOKEN";
pub const ENV_CALLBACK_ADDR: &str = "DBPLUGIN_CALLBACK_ADDR";
pub const ENV_CALLBACK_CA: &str = "DBPLUGIN_CALLBACK_CA";
pub const ENV_MAGIC_COOKIE: &str = "DBPLUGIN_MAGIC_COOKIE";

/// Not a secret; only tells a plugin binary that a launcher started it.
pub const MAGIC_COOKIE_VALUE: &str = "926a8e1f0ab3c6d7e5f4b2a19c8d7e6f";

/// Server name on every per-launch certificate.
pub const PLUGIN_SERVER_NAME: &str = "localhost";

pub const CORE_VERSION: u32 = 1;
pub const APP_VERSION: u32 = 4;

/// Wire protocol spoken between launcher and plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    /// HTTP/2 gRPC, the current protocol.
    Grpc,
    /// Length-delimited JSON frames over one TLS connection.
    NetRpc,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProtocol::Grpc => "grpc",
            WireProtocol::NetRpc => "netrpc",
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(WireProtocol::Grpc),
            "netrpc" => Ok(WireProtocol::NetRpc),
            other => Err(format!("unknown plugin protocol '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!("grpc".parse::<WireProtocol>().unwrap(), WireProtocol::Grpc);
        assert_eq!("NetRPC".parse::<WireProtocol>().unwrap(), WireProtocol::NetRpc);
        assert!("http".parse::<WireProtocol>().is_err());
        assert_eq!(WireProtocol::NetRpc.to_string(), "netrpc");
    }
}
