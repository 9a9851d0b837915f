//! Filesystem state of instance folders.
//!
//! [`InstanceDirs`] owns every create/rotate/destroy of folders under the instance
//! root. Mutating workflows hold an [`InstanceLock`] for their whole duration so two
//! invocations cannot race on the same instance.

use crate::error::{ManagerError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, NaiveDateTime};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use walkdir::WalkDir;

/// Timestamp suffix of rotated folders; lexical order matches chronological order.
pub const ROTATION_FORMAT: &str = "%Y-%m-%d_%H.%M.%S";

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Manager for the per-instance folders below one root directory.
#[derive(Debug, Clone)]
pub struct InstanceDirs {
    root: Utf8PathBuf,
}

impl InstanceDirs {
    pub fn new<P: AsRef<Utf8Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Folder of the named instance (may not exist).
    pub fn path_of(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    /// Create an empty folder for `name`, failing if anything already occupies it.
    pub fn create_fresh(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.path_of(name);
        if path.exists() {
            return Err(ManagerError::InstanceExists(path));
        }
        match fs::create_dir(&path) {
            Ok(()) => {
                tracing::info!("Created instance folder {}", path);
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(ManagerError::InstanceExists(path)),
            Err(e) => Err(ManagerError::io(&path, e)),
        }
    }

    /// Fail with `InstanceMissingError` unless the named folder exists.
    pub fn require_existing(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.path_of(name);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(ManagerError::InstanceMissing(path))
        }
    }

    /// Rename `path` to `<name>_<timestamp>` next to it.
    pub fn rotate(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        self.rotate_at(path, Local::now().naive_local())
    }

    /// [`rotate`](Self::rotate) with an explicit timestamp.
    pub fn rotate_at(&self, path: &Utf8Path, timestamp: NaiveDateTime) -> Result<Utf8PathBuf> {
        if !path.is_dir() {
            return Err(ManagerError::InstanceMissing(path.to_path_buf()));
        }
        let name = path
            .file_name()
            .ok_or_else(|| ManagerError::InstanceMissing(path.to_path_buf()))?;
        let rotated_name = format!("{}_{}", name, timestamp.format(ROTATION_FORMAT));
        let target = match path.parent() {
            Some(parent) => parent.join(rotated_name),
            None => Utf8PathBuf::from(rotated_name),
        };

        if target.exists() {
            return Err(ManagerError::RotationConflict(target));
        }

        tracing::info!("Renaming {} -> {}", path, target);
        fs::rename(path, &target).map_err(|e| ManagerError::io(path, e))?;
        Ok(target)
    }

    /// Remove an instance folder. Without `confirmed` this only warns.
    ///
    /// Returns whether anything was deleted.
    pub fn destroy(&self, path: &Utf8Path, confirmed: bool) -> Result<bool> {
        if !confirmed {
            tracing::warn!(
                "Dry run, {} left untouched. Pass --confirm if you're really sure: all instance data will be deleted.",
                path
            );
            return Ok(false);
        }
        if !path.exists() {
            tracing::warn!("Nothing to destroy at {}", path);
            return Ok(false);
        }

        // Some archives ship entries the owner cannot list or delete
        reset_permissions(path)?;
        fs::remove_dir_all(path).map_err(|e| ManagerError::io(path, e))?;
        tracing::info!("Destroyed {}", path);
        Ok(true)
    }

    /// Copy each of `relative_paths` from `old` into `new`.
    ///
    /// Every path is checked before anything is copied, so a missing entry leaves
    /// `new` untouched. Directories merge into existing ones; files overwrite.
    pub fn carry_over(
        &self,
        old: &Utf8Path,
        new: &Utf8Path,
        relative_paths: &[String],
    ) -> Result<()> {
        for relative in relative_paths {
            let source = old.join(relative);
            if fs::symlink_metadata(&source).is_err() {
                return Err(ManagerError::MissingUpgradeFile(source));
            }
        }

        for relative in relative_paths {
            let source = old.join(relative);
            let dest = new.join(relative);
            tracing::info!("Copying {} -> {}", source, dest);
            if source.is_dir() {
                copy_tree(&source, &dest)?;
            } else {
                copy_entry(&source, &dest)?;
            }
        }
        Ok(())
    }
}

/// Recursively set directories to 0755 and files to 0644.
///
/// Directories are opened up before being listed, so trees containing folders the
/// owner cannot read are still fully normalised. Symlinks are left alone.
#[cfg(unix)]
pub fn reset_permissions(path: &Utf8Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    set_mode(path.as_std_path(), DIR_MODE)?;

    for entry in WalkDir::new(path).min_depth(1) {
        match entry {
            Ok(entry) => {
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    set_mode(entry.path(), DIR_MODE)?;
                } else if file_type.is_file() {
                    set_mode(entry.path(), FILE_MODE)?;
                }
            }
            Err(err) => {
                // An unreadable directory: open it up and walk it separately
                let denied = err
                    .io_error()
                    .is_some_and(|e| e.kind() == ErrorKind::PermissionDenied);
                let failed = err
                    .path()
                    .and_then(Utf8Path::from_path)
                    .unwrap_or(path)
                    .to_path_buf();
                if denied && failed.as_path() != path {
                    reset_permissions(&failed)?;
                } else {
                    return Err(ManagerError::PermissionReset {
                        path: failed,
                        source: err.into(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn reset_permissions(_path: &Utf8Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        ManagerError::PermissionReset {
            path: Utf8PathBuf::from(path.to_string_lossy().into_owned()),
            source,
        }
    })
}

/// Mark a file executable (0755).
#[cfg(unix)]
pub fn make_executable(path: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))
        .map_err(|e| ManagerError::io(path, e))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Utf8Path) -> Result<()> {
    Ok(())
}

/// Merge the contents of `source` into `dest`, creating folders as needed.
pub fn copy_tree(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| ManagerError::io(dest, e))?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .and_then(Utf8Path::from_path)
                .unwrap_or(source)
                .to_path_buf();
            ManagerError::io(path, e.into())
        })?;
        let entry_path = Utf8Path::from_path(entry.path()).ok_or_else(|| {
            ManagerError::io(
                source,
                std::io::Error::new(ErrorKind::InvalidData, "non UTF-8 path"),
            )
        })?;
        let relative = entry_path
            .strip_prefix(source)
            .map_err(|e| ManagerError::io(entry_path, std::io::Error::other(e)))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| ManagerError::io(&target, e))?;
        } else {
            copy_entry(entry_path, &target)?;
        }
    }
    Ok(())
}

fn copy_entry(source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| ManagerError::io(parent, e))?;
    }

    #[cfg(unix)]
    {
        let meta = fs::symlink_metadata(source).map_err(|e| ManagerError::io(source, e))?;
        if meta.file_type().is_symlink() {
            let link = fs::read_link(source).map_err(|e| ManagerError::io(source, e))?;
            if fs::symlink_metadata(dest).is_ok() {
                fs::remove_file(dest).map_err(|e| ManagerError::io(dest, e))?;
            }
            return std::os::unix::fs::symlink(link, dest).map_err(|e| ManagerError::io(dest, e));
        }
    }

    fs::copy(source, dest).map_err(|e| ManagerError::io(source, e))?;
    Ok(())
}

/// Exclusive advisory lock on one instance name, released on drop.
///
/// The lock file lives next to the instance folder (`<root>/.<name>.lock`) so it
/// survives rotation and destruction of the folder itself.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: Utf8PathBuf,
}

impl InstanceLock {
    /// Take the lock without blocking; fails with `InstanceLockedError` if held elsewhere.
    pub fn acquire(root: &Utf8Path, name: &str) -> Result<Self> {
        let path = root.join(format!(".{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ManagerError::io(&path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!("Acquired lock {}", path);
                Ok(Self { file, path })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ManagerError::InstanceLocked(name.to_string()))
            }
            Err(e) => Err(ManagerError::io(&path, e)),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path, e);
        } else {
            tracing::debug!("Released lock {}", self.path);
        }
    }
}
