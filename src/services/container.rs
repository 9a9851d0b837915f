//! Container runtime collaborator.
//!
//! [`ContainerRuntime`] is the narrow interface the workflows use; [`DockerCli`] drives
//! the `docker` command line. Argument construction is kept in pure functions so it can
//! be checked without a daemon.

use crate::error::{ManagerError, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::{Captures, Regex};
use std::fs;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;

pub const DOCKERFILE: &str = "Dockerfile";
pub const DOCKERFILE_TEMPLATE: &str = "Dockerfile.template";

/// Host folder mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host: Utf8PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// TCP port published from the container on the same host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Everything needed to start one instance container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub command: String,
    pub name: String,
    pub volumes: Vec<VolumeBinding>,
    pub ports: Vec<PortMapping>,
    pub user: String,
    pub working_dir: String,
    pub detached: bool,
    /// Keep stdin open and allocate a TTY (the server console)
    pub interactive: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, context: &Utf8Path, no_cache: bool, tags: &[String]) -> Result<()>;

    /// Remove stopped containers so a new one can reuse the instance name.
    async fn prune_stopped_containers(&self) -> Result<()>;

    async fn run_container(&self, spec: &RunSpec) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn execute(&self, args: &[String]) -> Result<String> {
        let rendered = format!("{} {}", self.binary, args.join(" "));
        tracing::debug!("Executing: {}", rendered);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ManagerError::Container {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ManagerError::Container {
                command: rendered,
                reason: if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, context: &Utf8Path, no_cache: bool, tags: &[String]) -> Result<()> {
        tracing::info!("Building image {} from {}", tags.join(", "), context);
        self.execute(&build_args(context, no_cache, tags)).await?;
        Ok(())
    }

    async fn prune_stopped_containers(&self) -> Result<()> {
        self.execute(&["container".into(), "prune".into(), "--force".into()])
            .await?;
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<()> {
        let id = self.execute(&run_args(spec)).await?;
        tracing::info!("Started container {} ({})", spec.name, id.trim());
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.execute(&["stop".into(), name.into()]).await?;
        tracing::info!("Stopped container {}", name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .execute(&[
                "ps".into(),
                "--filter".into(),
                format!("name=^/{name}$"),
                "--filter".into(),
                "status=running".into(),
                "--format".into(),
                "{{.Names}}".into(),
            ])
            .await?;
        Ok(out.lines().any(|line| line.trim() == name))
    }
}

/// `docker build` arguments.
pub fn build_args(context: &Utf8Path, no_cache: bool, tags: &[String]) -> Vec<String> {
    let mut args = vec!["build".to_string()];
    if no_cache {
        args.push("--no-cache".into());
    }
    for tag in tags {
        args.push("--tag".into());
        args.push(tag.clone());
    }
    args.push(context.to_string());
    args
}

/// `docker run` arguments.
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--name".into(), spec.name.clone()];
    if spec.detached {
        args.push("--detach".into());
    }
    if spec.interactive {
        args.push("--interactive".into());
        args.push("--tty".into());
    }
    for volume in &spec.volumes {
        let mode = if volume.read_only { "ro" } else { "rw" };
        args.push("--volume".into());
        args.push(format!("{}:{}:{}", volume.host, volume.container, mode));
    }
    for port in &spec.ports {
        args.push("--publish".into());
        args.push(format!("{}:{}/tcp", port.host, port.container));
    }
    args.push("--user".into());
    args.push(spec.user.clone());
    args.push("--workdir".into());
    args.push(spec.working_dir.clone());
    args.push(spec.image.clone());
    args.push(spec.command.clone());
    args
}

/// `{{ uid }}` / `{{ gid }}` placeholders in a Dockerfile template.
static TEMPLATE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(uid|gid)\s*\}\}").expect("template placeholder regex is valid")
});

/// Substitute `{{ uid }}` and `{{ gid }}` placeholders in a Dockerfile template.
pub fn render_dockerfile(template: &str, uid: u32, gid: u32) -> String {
    TEMPLATE_PLACEHOLDER
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "uid" => uid.to_string(),
            _ => gid.to_string(),
        })
        .into_owned()
}

/// Make sure `working_dir` holds a Dockerfile, rendering the template when present.
pub fn prepare_build_context(working_dir: &Utf8Path) -> Result<()> {
    let template_path = working_dir.join(DOCKERFILE_TEMPLATE);
    let dockerfile_path = working_dir.join(DOCKERFILE);

    if template_path.is_file() {
        let template =
            fs::read_to_string(&template_path).map_err(|e| ManagerError::io(&template_path, e))?;
        let (uid, gid) = current_ids();
        let rendered = render_dockerfile(&template, uid, gid);
        fs::write(&dockerfile_path, rendered).map_err(|e| ManagerError::io(&dockerfile_path, e))?;
        tracing::info!("Rendered {} for uid={} gid={}", dockerfile_path, uid, gid);
        Ok(())
    } else if dockerfile_path.is_file() {
        tracing::info!("No {} found, using existing {}", DOCKERFILE_TEMPLATE, dockerfile_path);
        Ok(())
    } else {
        Err(ManagerError::Config(format!(
            "Neither {} nor {} found in {}",
            DOCKERFILE_TEMPLATE, DOCKERFILE, working_dir
        )))
    }
}

#[cfg(unix)]
fn current_ids() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[cfg(not(unix))]
fn current_ids() -> (u32, u32) {
    (1000, 1000)
}
