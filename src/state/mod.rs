// Lifecycle state tracking
//
// The persisted part of an instance's state lives in a marker file inside the
// instance folder; `Running` is never persisted and comes from the container runtime.

use crate::error::{ManagerError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::fs;
use std::str::FromStr;

/// Marker file recording the last completed workflow phase.
pub const STATE_MARKER: &str = ".instancectl-state";

/// Lifecycle of a single instance.
///
/// `Absent -> Downloaded -> ModConfigured -> Configured -> Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Absent,
    Downloaded,
    ModConfigured,
    Configured,
    Running,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Downloaded => "downloaded",
            Self::ModConfigured => "mod-configured",
            Self::Configured => "configured",
            Self::Running => "running",
        }
    }

    /// States reachable from `self` by a single workflow step.
    pub fn can_transition_to(self, next: Self) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Absent, Downloaded)
                | (Downloaded, ModConfigured)
                | (ModConfigured, Configured)
                | (Configured, Running)
                | (Running, Configured)
                | (Configured, Absent)
                | (Downloaded, Absent)
                | (ModConfigured, Absent)
        )
    }

    /// Fail with `InvalidStateError` unless `self` is one of `allowed`.
    pub fn require(self, name: &str, operation: &'static str, allowed: &[Self]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(ManagerError::InvalidState {
                name: name.to_string(),
                state: self.to_string(),
                operation,
            })
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "absent" => Ok(Self::Absent),
            "downloaded" => Ok(Self::Downloaded),
            "mod-configured" => Ok(Self::ModConfigured),
            "configured" => Ok(Self::Configured),
            "running" => Ok(Self::Running),
            other => Err(format!("unknown instance state '{other}'")),
        }
    }
}

/// Reads and writes the persisted lifecycle marker of instance folders.
#[derive(Debug, Clone)]
pub struct StateStore {
    instance_root: Utf8PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Utf8Path>>(instance_root: P) -> Self {
        Self {
            instance_root: instance_root.as_ref().to_path_buf(),
        }
    }

    /// Persisted state of the named instance, ignoring whether it is running.
    ///
    /// Folders created before markers existed are `configured` when they hold an
    /// `eula.txt`, `downloaded` otherwise.
    pub fn persisted(&self, name: &str) -> Result<InstanceState> {
        let dir = self.instance_root.join(name);
        if !dir.is_dir() {
            return Ok(InstanceState::Absent);
        }

        let marker = dir.join(STATE_MARKER);
        if marker.is_file() {
            let text = fs::read_to_string(&marker).map_err(|e| ManagerError::io(&marker, e))?;
            match text.parse::<InstanceState>() {
                Ok(InstanceState::Absent) | Ok(InstanceState::Running) | Err(_) => {
                    tracing::warn!("Ignoring unexpected state marker in {}: {:?}", marker, text);
                }
                Ok(state) => return Ok(state),
            }
        }

        if dir.join("eula.txt").is_file() {
            Ok(InstanceState::Configured)
        } else {
            Ok(InstanceState::Downloaded)
        }
    }

    /// Record a completed phase in the instance folder.
    pub fn record(&self, name: &str, state: InstanceState) -> Result<()> {
        let marker = self.instance_root.join(name).join(STATE_MARKER);
        fs::write(&marker, format!("{state}\n")).map_err(|e| ManagerError::io(&marker, e))?;
        tracing::debug!("Instance '{}' is now {}", name, state);
        Ok(())
    }
}
