//! Services module - lifecycle workflows and the collaborators they drive.
//!
//! # Components
//!
//! - [`Orchestrator`]: the per-invocation context sequencing install, upgrade, start,
//!   stop, destroy, console and backup-sync workflows.
//! - [`patcher`]: `key=value` and YAML config overrides, EULA acceptance, line endings.
//! - [`instance_dir`]: instance folder layout, rotation, carry-over, permission policy
//!   and the per-instance advisory lock.
//! - [`ArchiveFetcher`] / [`HttpArchiveFetcher`]: download and unpack server archives.
//! - [`ContainerRuntime`] / [`DockerCli`]: image builds and container lifecycle.
//! - [`FolderSync`] / [`Rsync`]: mirror backup folders to a remote destination.
//! - [`console`]: one-shot remote console (RCON) commands.
//!
//! The collaborator traits are the test seams: workflows only ever hold them as
//! `Arc<dyn Trait>`.

pub mod console;
pub mod container;
pub mod fetch;
pub mod instance_dir;
pub mod orchestrator;
pub mod patcher;
pub mod sync;

pub use container::{ContainerRuntime, DockerCli, PortMapping, RunSpec, VolumeBinding};
pub use fetch::{ArchiveFetcher, HttpArchiveFetcher};
pub use instance_dir::{InstanceDirs, InstanceLock};
pub use orchestrator::Orchestrator;
pub use sync::{FolderSync, Rsync};
