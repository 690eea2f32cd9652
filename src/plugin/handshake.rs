//! The single stdout line a plugin prints once it is listening.

use std::fmt;
use std::net::SocketAddr;

use super::{WireProtocol, APP_VERSION, CORE_VERSION};
use crate::errors::{DbError, Result};

/// `CORE_VERSION|APP_VERSION|tcp|ADDR|PROTOCOL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub addr: SocketAddr,
    pub protocol: WireProtocol,
}

impl Handshake {
    pub fn new(addr: SocketAddr, protocol: WireProtocol) -> Self {
        Self { addr, protocol }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(DbError::transport(format!(
                "malformed plugin handshake '{}': expected 5 fields",
                line
            )));
        }

        let core: u32 = parts[0]
            .parse()
            .map_err(|_| DbError::transport(format!("invalid core version '{}'", parts[0])))?;
        if core != CORE_VERSION {
            return Err(DbError::transport(format!(
                "unsupported core protocol version {} (expected {})",
                core, CORE_VERSION
            )));
        }

        let app: u32 = parts[1]
            .parse()
            .map_err(|_| DbError::transport(format!("invalid app version '{}'", parts[1])))?;
        if app != APP_VERSION {
            return Err(DbError::transport(format!(
                "unsupported plugin protocol version {} (expected {})",
                app, APP_VERSION
            )));
        }

        if parts[2] != "tcp" {
            return Err(DbError::transport(format!("unsupported network type '{}'", parts[2])));
        }

        let addr: SocketAddr = parts[3]
            .parse()
            .map_err(|_| DbError::transport(format!("invalid plugin address '{}'", parts[3])))?;
        if !addr.ip().is_loopback() {
            return Err(DbError::transport(format!(
                "plugin address {} is not a loopback address",
                addr
            )));
        }

        let protocol = parts[4].parse::<WireProtocol>().map_err(DbError::transport)?;

        Ok(Self { addr, protocol })
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|tcp|{}|{}",
            CORE_VERSION, APP_VERSION, self.addr, self.protocol
        )
    }
}
