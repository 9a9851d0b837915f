// instancectl - lifecycle manager for containerised game-server instances
//
// This is the library crate containing the workflows and their collaborators.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::{ConfigManager, DefinitionStore};
pub use error::{ManagerError, Result};
pub use models::{DownloadSource, InstanceDefinition, Settings};
pub use services::Orchestrator;
pub use state::InstanceState;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
