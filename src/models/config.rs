use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Process-wide settings, resolved once per invocation by
/// [`ConfigManager`](crate::config::ConfigManager).
///
/// Layered from built-in defaults, an optional `instancectl.yaml` and
/// `INSTANCECTL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding one folder per instance (plus rotated backups and lock files)
    pub instance_root: Utf8PathBuf,

    /// Directory holding one `<name>.yaml` definition per instance
    pub definitions_root: Utf8PathBuf,

    /// Directory holding `Dockerfile.template` and `server.properties.template`
    pub working_dir: Utf8PathBuf,

    #[serde(default = "default_image_name")]
    pub image_name: String,

    #[serde(default = "default_image_version")]
    pub image_version: String,

    /// Where the instance folder is mounted inside the container
    #[serde(default = "default_mountpoint")]
    pub mountpoint: String,

    #[serde(default = "default_container_user")]
    pub container_user: String,

    #[serde(default = "default_console_host")]
    pub console_host: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: Utf8PathBuf,

    #[serde(default)]
    pub debug: bool,
}

impl Settings {
    /// Default settings rooted at `base` (normally the current directory).
    pub fn rooted_at(base: impl Into<Utf8PathBuf>) -> Self {
        let base = base.into();
        Self {
            instance_root: base.join("instances"),
            definitions_root: base.join("config"),
            working_dir: base.clone(),
            image_name: default_image_name(),
            image_version: default_image_version(),
            mountpoint: default_mountpoint(),
            container_user: default_container_user(),
            console_host: default_console_host(),
            log_dir: base.join(default_log_dir()),
            debug: false,
        }
    }

    /// Versioned image reference, e.g. `sirius2/server:1.0`
    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.image_name, self.image_version)
    }

    /// Floating image reference, e.g. `sirius2/server:latest`
    pub fn latest_tag(&self) -> String {
        format!("{}:latest", self.image_name)
    }

    /// Folder of the named instance under the instance root.
    pub fn instance_dir(&self, name: &str) -> Utf8PathBuf {
        self.instance_root.join(name)
    }
}

pub(crate) fn default_image_name() -> String {
    "sirius2/server".to_string()
}

pub(crate) fn default_image_version() -> String {
    "1.0".to_string()
}

pub(crate) fn default_mountpoint() -> String {
    "/minecraft".to_string()
}

pub(crate) fn default_container_user() -> String {
    "minecraft".to_string()
}

pub(crate) fn default_console_host() -> String {
    "localhost".to_string()
}

pub(crate) fn default_log_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("logs")
}
