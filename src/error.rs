use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced by the instance lifecycle components and their collaborators.
///
/// Every variant maps to a stable kind name (see [`ManagerError::kind`]) which the
/// CLI prints alongside the message.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to parse definition {path}: {reason}")]
    DefinitionParse { path: Utf8PathBuf, reason: String },

    #[error("Instance name '{name}' is defined twice: {first} and {second}")]
    DuplicateName {
        name: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },

    #[error("'{0}' is not a known instance name")]
    UnknownInstance(String),

    #[error("Instance folder {0} already exists")]
    InstanceExists(Utf8PathBuf),

    #[error("Instance folder {0} does not exist")]
    InstanceMissing(Utf8PathBuf),

    #[error("Rotation target {0} already exists")]
    RotationConflict(Utf8PathBuf),

    #[error("Upgrade file not found: {0}")]
    MissingUpgradeFile(Utf8PathBuf),

    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("Extraction of {archive} -> {target} failed (exit code {code:?})")]
    Extraction {
        archive: Utf8PathBuf,
        target: Utf8PathBuf,
        code: Option<i32>,
    },

    #[error("Folder sync {source_dir} -> {dest} failed (exit code {code:?})")]
    Sync {
        source_dir: Utf8PathBuf,
        dest: String,
        code: Option<i32>,
    },

    #[error("Remote console is disabled for instance '{0}'")]
    ConsoleDisabled(String),

    #[error("Remote console error: {0}")]
    Console(String),

    #[error("Failed to reset permissions on {path}: {source}")]
    PermissionReset {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container runtime command `{command}` failed: {reason}")]
    Container { command: String, reason: String },

    #[error("Cannot {operation} instance '{name}' while it is {state}")]
    InvalidState {
        name: String,
        state: String,
        operation: &'static str,
    },

    #[error("Instance '{0}' is locked by another invocation")]
    InstanceLocked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    /// Wrap an I/O error together with the path it occurred on.
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable error kind name, printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DefinitionParse { .. } => "DefinitionParseError",
            Self::DuplicateName { .. } => "DuplicateNameError",
            Self::UnknownInstance(_) => "UnknownInstanceError",
            Self::InstanceExists(_) => "InstanceExistsError",
            Self::InstanceMissing(_) => "InstanceMissingError",
            Self::RotationConflict(_) => "RotationConflictError",
            Self::MissingUpgradeFile(_) => "MissingUpgradeFileError",
            Self::Download { .. } => "DownloadError",
            Self::Extraction { .. } => "ExtractionError",
            Self::Sync { .. } => "SyncError",
            Self::ConsoleDisabled(_) => "ConsoleDisabledError",
            Self::Console(_) => "ConsoleError",
            Self::PermissionReset { .. } => "PermissionResetError",
            Self::Container { .. } => "ContainerError",
            Self::InvalidState { .. } => "InvalidStateError",
            Self::InstanceLocked(_) => "InstanceLockedError",
            Self::Config(_) => "ConfigError",
            Self::Io { .. } => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
