//! Common test utilities for the integration tests.
//!
//! Locates the `dbplugin-mock` binary built alongside the tests and wraps the
//! launcher setup every plugin test needs.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use dbplugin::config::LauncherConfig;
use dbplugin::database::ConnectionDetails;
use dbplugin::plugin::checksum::sha256_file;
use dbplugin::plugin::{Launcher, ProtocolBridge, WireProtocol};

pub const MOCK_PLUGIN: &str = env!("CARGO_BIN_EXE_dbplugin-mock");

pub async fn mock_checksum() -> String {
    sha256_file(MOCK_PLUGIN)
        .await
        .expect("mock plugin binary should be readable")
}

pub fn launcher() -> Launcher {
    Launcher::new(LauncherConfig {
        launch_timeout_ms: 20_000,
        call_timeout_ms: 10_000,
        handshake_timeout_ms: 5_000,
        ..LauncherConfig::default()
    })
}

pub fn protocol_args(protocol: WireProtocol) -> Vec<String> {
    vec!["--protocol".to_string(), protocol.as_str().to_string()]
}

/// Launch the mock plugin speaking `protocol`.
pub async fn launch_mock(protocol: WireProtocol) -> ProtocolBridge {
    let checksum = mock_checksum().await;
    launcher()
        .launch(MOCK_PLUGIN, &protocol_args(protocol), &checksum)
        .await
        .expect("mock plugin should launch")
}

pub fn one_detail() -> ConnectionDetails {
    let mut details = ConnectionDetails::new();
    details.insert("test".to_string(), serde_json::json!(1));
    details
}

pub fn in_one_minute() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(1)
}
