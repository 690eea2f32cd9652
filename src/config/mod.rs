//! # Configuration Management
//!
//! Serde-deserializable, `validator`-checked settings. `LauncherConfig` and
//! `ObservabilityConfig` can also be read from `DBPLUGIN_*` environment variables.

pub mod settings;

pub use settings::{BackendConfig, LauncherConfig, ObservabilityConfig, PLUGIN_FAMILY};
