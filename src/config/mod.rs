pub mod definitions;

pub use definitions::DefinitionStore;

use crate::error::{ManagerError, Result};
use crate::models::Settings;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// Default settings file name, looked up in the working directory.
pub const SETTINGS_FILE: &str = "instancectl.yaml";

/// Environment variable prefix for settings overrides (`INSTANCECTL_INSTANCE_ROOT`, ...).
pub const ENV_PREFIX: &str = "INSTANCECTL";

/// Configuration manager resolving the process [`Settings`].
///
/// Sources, lowest precedence first:
/// - Defaults rooted at the working directory (`instances/`, `config/`, `logs/`)
/// - The YAML settings file (`instancectl.yaml` unless overridden)
/// - `INSTANCECTL_*` environment variables
#[derive(Debug, Clone)]
pub struct ConfigManager {
    working_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager.
    ///
    /// # Arguments
    /// * `working_dir` - Base directory for defaults (normally the current directory)
    /// * `settings_path` - Explicit settings file; `None` uses `<working_dir>/instancectl.yaml`
    pub fn new<P: AsRef<Utf8Path>>(working_dir: P, settings_path: Option<Utf8PathBuf>) -> Self {
        let working_dir = working_dir.as_ref().to_path_buf();
        let settings_path = settings_path.unwrap_or_else(|| working_dir.join(SETTINGS_FILE));
        Self {
            working_dir,
            settings_path,
        }
    }

    /// Resolve settings from defaults, the settings file and the environment.
    pub fn load_settings(&self) -> Result<Settings> {
        let defaults = Settings::rooted_at(&self.working_dir);

        let built = Config::builder()
            .set_default("instance_root", defaults.instance_root.as_str())
            .and_then(|b| b.set_default("definitions_root", defaults.definitions_root.as_str()))
            .and_then(|b| b.set_default("working_dir", defaults.working_dir.as_str()))
            .and_then(|b| b.set_default("image_name", defaults.image_name.as_str()))
            .and_then(|b| b.set_default("image_version", defaults.image_version.as_str()))
            .and_then(|b| b.set_default("mountpoint", defaults.mountpoint.as_str()))
            .and_then(|b| b.set_default("container_user", defaults.container_user.as_str()))
            .and_then(|b| b.set_default("console_host", defaults.console_host.as_str()))
            .and_then(|b| b.set_default("log_dir", defaults.log_dir.as_str()))
            .and_then(|b| b.set_default("debug", defaults.debug))
            .map_err(|e| ManagerError::Config(e.to_string()))?
            .add_source(File::new(self.settings_path.as_str(), FileFormat::Yaml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| {
                ManagerError::Config(format!(
                    "Failed to read settings {}: {}",
                    self.settings_path, e
                ))
            })?;

        let mut settings: Settings = built
            .try_deserialize()
            .map_err(|e| ManagerError::Config(format!("Invalid settings: {}", e)))?;

        // Relative paths from the settings file are anchored at the working directory
        for path in [
            &mut settings.instance_root,
            &mut settings.definitions_root,
            &mut settings.working_dir,
            &mut settings.log_dir,
        ] {
            if path.is_relative() {
                *path = self.working_dir.join(&*path);
            }
        }

        Ok(settings)
    }

    /// Settings file that contributed to the last load, if it exists.
    ///
    /// Settings are resolved before logging is installed, so callers report
    /// this once the subscriber is up.
    pub fn settings_file(&self) -> Option<&Utf8Path> {
        self.settings_path
            .is_file()
            .then_some(self.settings_path.as_path())
    }

    /// Create the instance root if it does not exist yet.
    ///
    /// Returns `true` when the root was created by this call.
    pub fn prepare(&self, settings: &Settings) -> Result<bool> {
        if settings.instance_root.exists() {
            return Ok(false);
        }
        fs::create_dir_all(&settings.instance_root)
            .map_err(|e| ManagerError::io(&settings.instance_root, e))?;
        Ok(true)
    }
}
