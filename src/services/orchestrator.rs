//! Instance lifecycle workflows.
//!
//! [`Orchestrator`] is the per-invocation context: it owns the loaded settings and
//! definitions plus handles to the external collaborators, and sequences them for
//! each CLI command. Nothing here is global; a new orchestrator is built per process.
//!
//! Lifecycle: `absent -> downloaded -> mod-configured -> configured -> running`.
//! Every state-changing workflow holds the instance's [`InstanceLock`] until it returns.

use crate::config::DefinitionStore;
use crate::error::{ManagerError, Result};
use crate::models::{DownloadSource, InstanceDefinition, Settings};
use crate::services::console;
use crate::services::container::{
    ContainerRuntime, PortMapping, RunSpec, VolumeBinding, prepare_build_context,
};
use crate::services::fetch::ArchiveFetcher;
use crate::services::instance_dir::{
    InstanceDirs, InstanceLock, copy_tree, make_executable, reset_permissions,
};
use crate::services::patcher;
use crate::services::sync::FolderSync;
use crate::state::{InstanceState, StateStore};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::sync::Arc;

pub const SERVER_PROPERTIES: &str = "server.properties";
pub const SERVER_PROPERTIES_TEMPLATE: &str = "server.properties.template";

/// Console port used when `server.properties` does not name one.
const DEFAULT_RCON_PORT: u16 = 25575;

pub struct Orchestrator {
    settings: Settings,
    definitions: DefinitionStore,
    dirs: InstanceDirs,
    states: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn ArchiveFetcher>,
    syncer: Arc<dyn FolderSync>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        definitions: DefinitionStore,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn ArchiveFetcher>,
        syncer: Arc<dyn FolderSync>,
    ) -> Self {
        let dirs = InstanceDirs::new(&settings.instance_root);
        let states = StateStore::new(&settings.instance_root);
        Self {
            settings,
            definitions,
            dirs,
            states,
            runtime,
            fetcher,
            syncer,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn definitions(&self) -> &DefinitionStore {
        &self.definitions
    }

    /// Current lifecycle state; `running` wins over whatever is persisted.
    pub async fn state(&self, name: &str) -> Result<InstanceState> {
        self.definitions.get(name)?;
        let persisted = self.states.persisted(name)?;
        if persisted != InstanceState::Absent && self.runtime.is_running(name).await? {
            return Ok(InstanceState::Running);
        }
        Ok(persisted)
    }

    /// Every defined instance with its state, sorted by name.
    pub async fn list(&self) -> Result<Vec<(String, InstanceState)>> {
        let mut out = Vec::with_capacity(self.definitions.len());
        for name in self.definitions.names() {
            out.push((name.to_string(), self.state(name).await?));
        }
        Ok(out)
    }

    /// Render the Dockerfile and build the server image (versioned and `latest` tags).
    pub async fn build(&self, no_cache: bool) -> Result<()> {
        tracing::info!("Building container image");
        prepare_build_context(&self.settings.working_dir)?;
        let tags = [self.settings.image_tag(), self.settings.latest_tag()];
        self.runtime
            .build_image(&self.settings.working_dir, no_cache, &tags)
            .await
    }

    /// Build the image, download the server, install mods and configure it.
    pub async fn install(&self, name: &str) -> Result<()> {
        let def = self.definitions.get(name)?;
        let _lock = self.lock(name)?;
        self.state(name)
            .await?
            .require(name, "install", &[InstanceState::Absent])?;

        self.build(false).await?;

        let dir = self.dirs.create_fresh(name)?;
        self.populate(def, &dir).await?;
        self.configure(def, &dir)?;
        self.advance(name, InstanceState::Configured)?;

        tracing::info!("[{}] Install complete", name);
        Ok(())
    }

    /// Rotate the current folder, reinstall fresh, carry over user data and reconfigure.
    ///
    /// Returns the rotated backup folder. If a declared upgrade path is missing the
    /// upgrade stops there, leaving both the backup and the new folder in place.
    pub async fn upgrade(&self, name: &str) -> Result<Utf8PathBuf> {
        let def = self.definitions.get(name)?;
        let _lock = self.lock(name)?;
        let state = self.state(name).await?;
        state.require(
            name,
            "upgrade",
            &[InstanceState::Configured, InstanceState::Running],
        )?;
        if state == InstanceState::Running {
            tracing::warn!("[{}] Upgrading while running; restart it afterwards", name);
        }

        let current = self.dirs.require_existing(name)?;
        let rotated = self.dirs.rotate(&current)?;

        let dir = self.dirs.create_fresh(name)?;
        self.populate(def, &dir).await?;

        self.dirs.carry_over(&rotated, &dir, &def.upgrade_list)?;

        self.configure(def, &dir)?;
        self.advance(name, InstanceState::Configured)?;

        tracing::info!("[{}] Upgrade complete, previous files kept in {}", name, rotated);
        Ok(rotated)
    }

    /// Start the instance container.
    pub async fn start(&self, name: &str) -> Result<()> {
        let def = self.definitions.get(name)?;
        let _lock = self.lock(name)?;
        self.state(name)
            .await?
            .require(name, "start", &[InstanceState::Configured])?;

        tracing::info!("Starting {}", name);
        let dir = self.dirs.require_existing(name)?;
        patcher::convert_to_unix_line_endings(&dir.join(&def.entrypoint))?;

        self.runtime.prune_stopped_containers().await?;
        let spec = self.run_spec(def, &dir);
        tracing::debug!("Run spec: {:?}", spec);
        self.runtime.run_container(&spec).await
    }

    /// Stop the instance container.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.definitions.get(name)?;
        let _lock = self.lock(name)?;
        self.state(name)
            .await?
            .require(name, "stop", &[InstanceState::Running])?;

        tracing::info!("Stopping {}", name);
        self.runtime.stop_container(name).await
    }

    /// Delete the instance folder. Without `confirmed` this is a dry run.
    ///
    /// Returns whether the folder was removed.
    pub async fn destroy(&self, name: &str, confirmed: bool) -> Result<bool> {
        self.definitions.get(name)?;
        let path = self.dirs.path_of(name);
        tracing::info!("Destroying instance {} {}", name, path);

        if !confirmed {
            return self.dirs.destroy(&path, false);
        }

        let _lock = self.lock(name)?;
        let state = self.state(name).await?;
        if state == InstanceState::Running {
            return Err(ManagerError::InvalidState {
                name: name.to_string(),
                state: state.to_string(),
                operation: "destroy",
            });
        }
        self.dirs.destroy(&path, true)
    }

    /// Send one console command to a running instance.
    ///
    /// Returns `None` (after logging) when the instance has its console disabled.
    pub async fn exec(&self, name: &str, text: &str) -> Result<Option<String>> {
        let def = self.definitions.get(name)?;
        self.state(name)
            .await?
            .require(name, "exec", &[InstanceState::Running])?;

        let command = console::normalize_command(text);
        let dir = self.dirs.require_existing(name)?;
        let props = patcher::read_properties(&dir.join(SERVER_PROPERTIES))?;

        if props.get("enable-rcon").map(|v| v.trim()) != Some("true") {
            let err = ManagerError::ConsoleDisabled(name.to_string());
            tracing::error!("{}", err);
            return Ok(None);
        }

        let port = match props.get("rcon.port").map(|p| p.trim()).filter(|p| !p.is_empty()) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                ManagerError::Config(format!("[{name}] invalid rcon.port '{raw}'"))
            })?,
            None => def.rcon_port.unwrap_or(DEFAULT_RCON_PORT),
        };
        let password = props
            .get("rcon.password")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ManagerError::Console(format!("[{name}] rcon.password is not set")))?;

        tracing::info!("[{}] {}", name, command);
        let reply =
            console::send_command(&self.settings.console_host, port, password, &command).await?;
        tracing::info!("{}", reply);
        Ok(Some(reply))
    }

    /// Mirror `<instance>/backups` to `<dest>/<name>`.
    pub async fn sync_backups(
        &self,
        name: &str,
        dest: &str,
        remote_helper: Option<&str>,
    ) -> Result<()> {
        self.definitions.get(name)?;
        let source = self.dirs.path_of(name).join("backups");
        if !source.is_dir() {
            return Err(ManagerError::InstanceMissing(source));
        }
        let dest = format!("{}/{}", dest.trim_end_matches('/'), name);

        tracing::info!("Syncing Backups {} -> {}", source, dest);
        self.syncer.sync(&source, &dest, remote_helper).await
    }

    fn lock(&self, name: &str) -> Result<InstanceLock> {
        InstanceLock::acquire(self.dirs.root(), name)
    }

    /// Record `to` after checking it follows the folder's persisted state.
    fn advance(&self, name: &str, to: InstanceState) -> Result<()> {
        let from = self.states.persisted(name)?;
        if !from.can_transition_to(to) {
            return Err(ManagerError::InvalidState {
                name: name.to_string(),
                state: from.to_string(),
                operation: "advance",
            });
        }
        self.states.record(name, to)
    }

    /// Download and mod-install into a freshly created folder.
    async fn populate(&self, def: &InstanceDefinition, dir: &Utf8Path) -> Result<()> {
        self.download(def, dir).await?;
        // `dir` came from `create_fresh`, so no earlier phase exists to check against
        self.states.record(&def.name, InstanceState::Downloaded)?;

        self.install_mods(def, dir).await?;
        self.advance(&def.name, InstanceState::ModConfigured)
    }

    async fn download(&self, def: &InstanceDefinition, dir: &Utf8Path) -> Result<()> {
        match &def.source {
            DownloadSource::Archive { url } => {
                tracing::info!("[{}] Downloading {}", def.name, url);
                let archive = self.fetcher.download(url, dir).await?;
                self.fetcher.extract(&archive, dir).await?;
            }
            DownloadSource::Patch { url, base_folder } => {
                let patch_dir = dir.join("patches");
                tracing::info!("[{}] Downloading Patch {} -> {}", def.name, url, patch_dir);
                let archive = self.fetcher.download(url, &patch_dir).await?;
                self.fetcher.extract(&archive, &patch_dir).await?;

                let real_patch_dir = match base_folder {
                    Some(base) => patch_dir.join(base),
                    None => patch_dir.clone(),
                };
                if !real_patch_dir.is_dir() {
                    return Err(ManagerError::Config(format!(
                        "[{}] patch base folder {} not found in archive",
                        def.name, real_patch_dir
                    )));
                }
                tracing::info!(
                    "[{}] Moving Patch Files {} -> {}",
                    def.name,
                    real_patch_dir,
                    dir
                );
                copy_tree(&real_patch_dir, dir)?;
            }
        }

        tracing::info!("[{}] Resetting file permissions", def.name);
        reset_permissions(dir)
    }

    async fn install_mods(&self, def: &InstanceDefinition, dir: &Utf8Path) -> Result<()> {
        let mods_dir = dir.join("mods");

        if !def.mods.disable.is_empty() {
            tracing::info!("[{}] Disabling Mods:", def.name);
        }
        for disabled in &def.mods.disable {
            let mod_file = mods_dir.join(disabled);
            if mod_file.exists() {
                let renamed = Utf8PathBuf::from(format!("{mod_file}.disabled"));
                tracing::info!("-- Renaming {} to {}", mod_file, renamed);
                fs::rename(&mod_file, &renamed).map_err(|e| ManagerError::io(&mod_file, e))?;
            } else {
                tracing::warn!("-- {} not present, nothing to disable", mod_file);
            }
        }

        if !def.mods.install.is_empty() {
            tracing::info!("[{}] Installing Mods:", def.name);
        }
        for url in &def.mods.install {
            tracing::info!("-- {}", url);
            self.fetcher.download(url, &mods_dir).await?;
        }
        Ok(())
    }

    fn configure(&self, def: &InstanceDefinition, dir: &Utf8Path) -> Result<()> {
        let props = dir.join(SERVER_PROPERTIES);
        if !props.exists() {
            let template = self.settings.working_dir.join(SERVER_PROPERTIES_TEMPLATE);
            if template.is_file() {
                tracing::info!("Copying {} -> {}", template, props);
                fs::copy(&template, &props).map_err(|e| ManagerError::io(&template, e))?;
            } else {
                tracing::debug!("No {} to seed {}", template, props);
            }
        }

        for (filename, overrides) in &def.configs {
            tracing::info!("Patching config {}", filename);
            let path = dir.join(filename);
            ensure_parent(&path)?;
            patcher::apply_overrides(&path, overrides)?;
        }

        for (filename, tree) in &def.yamls {
            tracing::info!("Patching yaml {}", filename);
            let path = dir.join(filename);
            ensure_parent(&path)?;
            patcher::apply_yaml_overrides(&path, tree)?;
        }

        tracing::info!("Creating eula.txt");
        patcher::create_eula(dir)?;

        tracing::info!("Resetting file permissions");
        reset_permissions(dir)?;

        let entrypoint = dir.join(&def.entrypoint);
        if !entrypoint.is_file() {
            return Err(ManagerError::io(
                &entrypoint,
                std::io::Error::new(std::io::ErrorKind::NotFound, "entrypoint script not found"),
            ));
        }
        make_executable(&entrypoint)
    }

    fn run_spec(&self, def: &InstanceDefinition, dir: &Utf8Path) -> RunSpec {
        let mountpoint = self.settings.mountpoint.trim_end_matches('/');

        let mut ports = vec![PortMapping {
            host: def.port,
            container: def.port,
        }];
        if let Some(rcon) = def.rcon_port {
            ports.push(PortMapping {
                host: rcon,
                container: rcon,
            });
        }

        RunSpec {
            image: self.settings.image_tag(),
            command: format!("{}/{}", mountpoint, def.entrypoint),
            name: def.name.clone(),
            volumes: vec![VolumeBinding {
                host: dir.to_path_buf(),
                container: self.settings.mountpoint.clone(),
                read_only: false,
            }],
            ports,
            user: self.settings.container_user.clone(),
            working_dir: self.settings.mountpoint.clone(),
            detached: true,
            interactive: true,
        }
    }
}

fn ensure_parent(path: &Utf8Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ManagerError::io(parent, e))?;
    }
    Ok(())
}
