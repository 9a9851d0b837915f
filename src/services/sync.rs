//! Remote folder synchronisation (`rsync` over ssh).

use crate::error::{ManagerError, Result};
use async_trait::async_trait;
use camino::Utf8Path;
use tokio::process::Command;

#[async_trait]
pub trait FolderSync: Send + Sync {
    /// Mirror `source` to `dest` (a local path or `host:path`), deleting extraneous files.
    async fn sync(&self, source: &Utf8Path, dest: &str, remote_helper: Option<&str>) -> Result<()>;
}

/// [`FolderSync`] backed by the `rsync` binary.
#[derive(Debug, Clone, Default)]
pub struct Rsync;

impl Rsync {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FolderSync for Rsync {
    async fn sync(&self, source: &Utf8Path, dest: &str, remote_helper: Option<&str>) -> Result<()> {
        let args = rsync_args(source, dest, remote_helper);
        tracing::info!("Syncing {} -> {}", source, dest);
        tracing::debug!("Executing: rsync {}", args.join(" "));

        let status = Command::new("rsync")
            .args(&args)
            .status()
            .await
            .map_err(|e| ManagerError::io(source, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(ManagerError::Sync {
                source_dir: source.to_path_buf(),
                dest: dest.to_string(),
                code: status.code(),
            })
        }
    }
}

/// Arguments passed to `rsync`.
pub fn rsync_args(source: &Utf8Path, dest: &str, remote_helper: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(helper) = remote_helper.filter(|h| !h.is_empty()) {
        args.push("--rsync-path".to_string());
        args.push(helper.to_string());
    }
    args.extend(
        ["-avuhP", "--delete", "-e", "ssh"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(source.to_string());
    args.push(dest.to_string());
    args
}
