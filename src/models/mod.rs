//! Data models for instancectl.
//!
//! - [`InstanceDefinition`]: the validated per-instance record loaded from `<name>.yaml`
//! - [`DownloadSource`]: plain archive URL or patch descriptor (exactly one per definition)
//! - [`ModsList`]: mods to install and mod files to disable
//! - [`Settings`]: process-wide paths and container parameters

pub mod config;
pub mod definition;

pub use config::Settings;
pub use definition::{DownloadSource, InstanceDefinition, ModsList, scalar_to_string};
