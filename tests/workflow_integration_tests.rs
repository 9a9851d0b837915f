//! Integration tests for the instance lifecycle workflows
//!
//! These tests drive [`Orchestrator`] end to end against in-memory collaborators:
//! - An archive fetcher that "downloads" by writing the URL and "extracts" canned files
//! - A container runtime that records calls and tracks running containers
//! - A folder sync that records its arguments
//!
//! Filesystem effects (instance folders, patched files, rotation) are real, inside a
//! temporary directory.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use instancectl::services::console::{Packet, read_packet};
use instancectl::services::{
    ArchiveFetcher, ContainerRuntime, FolderSync, InstanceLock, RunSpec,
};
use instancectl::{DefinitionStore, InstanceState, ManagerError, Orchestrator, Result, Settings};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

type ArchiveEntries = Vec<(&'static str, &'static str)>;

#[derive(Default)]
struct FakeFetcher {
    archives: HashMap<String, ArchiveEntries>,
    downloads: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn with_archive(mut self, file_name: &str, entries: ArchiveEntries) -> Self {
        self.archives.insert(file_name.to_string(), entries);
        self
    }
}

#[async_trait]
impl ArchiveFetcher for FakeFetcher {
    async fn download(&self, url: &str, folder: &Utf8Path) -> Result<Utf8PathBuf> {
        self.downloads.lock().unwrap().push(url.to_string());
        fs::create_dir_all(folder).unwrap();
        let path = folder.join(url.rsplit('/').next().unwrap());
        fs::write(&path, url).unwrap();
        Ok(path)
    }

    async fn extract(&self, archive: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let entries = self
            .archives
            .get(archive.file_name().unwrap())
            .ok_or_else(|| ManagerError::Extraction {
                archive: archive.to_path_buf(),
                target: target.to_path_buf(),
                code: Some(9),
            })?;
        for (relative, contents) in entries {
            let path = target.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, _context: &Utf8Path, no_cache: bool, tags: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("build nocache={} {}", no_cache, tags.join(",")));
        Ok(())
    }

    async fn prune_stopped_containers(&self) -> Result<()> {
        self.calls.lock().unwrap().push("prune".into());
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("run {} {}", spec.name, spec.command));
        self.running.lock().unwrap().insert(spec.name.clone());
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", name));
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(name))
    }
}

#[derive(Default)]
struct RecordingSync {
    calls: Mutex<Vec<(Utf8PathBuf, String, Option<String>)>>,
}

#[async_trait]
impl FolderSync for RecordingSync {
    async fn sync(&self, source: &Utf8Path, dest: &str, remote_helper: Option<&str>) -> Result<()> {
        self.calls.lock().unwrap().push((
            source.to_path_buf(),
            dest.to_string(),
            remote_helper.map(str::to_string),
        ));
        Ok(())
    }
}

const FOO_DEFINITION: &str = r#"
url: https://example.com/pack/Server-1.2.zip
configs:
  server.properties:
    motd: hello
    max-players: 20
modsList:
  install:
    - https://example.com/mods/extra.jar
  disable:
    - broken.jar
upgradeList:
  - world
  - ops.json
entrypoint: start.sh
port: 25565
"#;

fn server_archive() -> ArchiveEntries {
    vec![
        ("start.sh", "#!/bin/sh\r\nexec java -jar server.jar\r\n"),
        ("server.jar", "jar-1.2"),
        ("server.properties", "motd=A\npvp=true\n"),
        ("mods/broken.jar", "broken"),
        ("mods/good.jar", "good"),
    ]
}

struct Harness {
    _temp: TempDir,
    settings: Settings,
    orchestrator: Orchestrator,
    runtime: Arc<FakeRuntime>,
    fetcher: Arc<FakeFetcher>,
    syncer: Arc<RecordingSync>,
}

fn harness(definition: &str, fetcher: FakeFetcher) -> Harness {
    let temp = TempDir::new().unwrap();
    let base = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
    let mut settings = Settings::rooted_at(&base);
    settings.console_host = "127.0.0.1".into();

    fs::create_dir_all(&settings.instance_root).unwrap();
    fs::create_dir_all(&settings.definitions_root).unwrap();
    fs::write(settings.definitions_root.join("foo.yaml"), definition).unwrap();
    fs::write(
        base.join("Dockerfile.template"),
        "FROM eclipse-temurin:21-jre\nRUN useradd -u {{ uid }} minecraft\n",
    )
    .unwrap();

    let definitions = DefinitionStore::load(&settings.definitions_root).unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let fetcher = Arc::new(fetcher);
    let syncer = Arc::new(RecordingSync::default());
    let orchestrator = Orchestrator::new(
        settings.clone(),
        definitions,
        runtime.clone(),
        fetcher.clone(),
        syncer.clone(),
    );

    Harness {
        _temp: temp,
        settings,
        orchestrator,
        runtime,
        fetcher,
        syncer,
    }
}

fn foo_harness() -> Harness {
    harness(
        FOO_DEFINITION,
        FakeFetcher::default().with_archive("Server-1.2.zip", server_archive()),
    )
}

fn rotated_backups(settings: &Settings) -> Vec<Utf8PathBuf> {
    let mut found: Vec<Utf8PathBuf> = settings
        .instance_root
        .read_dir_utf8()
        .unwrap()
        .map(|e| e.unwrap().path().to_path_buf())
        .filter(|p| p.is_dir() && p.file_name().is_some_and(|n| n.starts_with("foo_")))
        .collect();
    found.sort();
    found
}

#[tokio::test]
async fn test_install_scenario() {
    let h = foo_harness();

    h.orchestrator.install("foo").await.unwrap();

    let dir = h.settings.instance_dir("foo");
    assert_eq!(
        fs::read_to_string(dir.join("server.properties")).unwrap(),
        "motd=hello\npvp=true\nmax-players=20\n"
    );
    assert!(fs::read_to_string(dir.join("eula.txt")).unwrap().contains("eula=true"));
    assert!(dir.join("mods/broken.jar.disabled").exists());
    assert!(!dir.join("mods/broken.jar").exists());
    assert!(dir.join("mods/good.jar").exists());
    assert!(dir.join("mods/extra.jar").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dir.join("start.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "entrypoint must be executable");
    }

    assert_eq!(
        h.runtime.calls(),
        vec!["build nocache=false sirius2/server:1.0,sirius2/server:latest"]
    );
    assert_eq!(
        *h.fetcher.downloads.lock().unwrap(),
        vec![
            "https://example.com/pack/Server-1.2.zip",
            "https://example.com/mods/extra.jar"
        ]
    );
    let dockerfile = fs::read_to_string(h.settings.working_dir.join("Dockerfile")).unwrap();
    assert!(!dockerfile.contains("{{"));

    assert_eq!(
        h.orchestrator.list().await.unwrap(),
        vec![("foo".to_string(), InstanceState::Configured)]
    );
}

#[tokio::test]
async fn test_install_plain_archive_without_configs() {
    let definition = "url: http://x/a.zip\nentrypoint: start.sh\nport: 25565\n";
    let h = harness(
        definition,
        FakeFetcher::default().with_archive(
            "a.zip",
            vec![
                ("start.sh", "#!/bin/sh\nexec java -jar server.jar\n"),
                ("server.jar", "jar"),
                ("libraries/lib.jar", "lib"),
            ],
        ),
    );
    assert!(fs::read_dir(&h.settings.instance_root).unwrap().next().is_none());

    h.orchestrator.install("foo").await.unwrap();

    let dir = h.settings.instance_dir("foo");
    assert_eq!(dir, h.settings.instance_root.join("foo"));
    assert_eq!(fs::read_to_string(dir.join("server.jar")).unwrap(), "jar");
    assert_eq!(fs::read_to_string(dir.join("libraries/lib.jar")).unwrap(), "lib");
    let eula = fs::read_to_string(dir.join("eula.txt")).unwrap();
    assert!(eula.lines().any(|line| line == "eula=true"));
    // No configs and no template: nothing seeds server.properties
    assert!(!dir.join("server.properties").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dir.join("start.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "entrypoint must be executable");
    }

    assert_eq!(
        h.orchestrator.state("foo").await.unwrap(),
        InstanceState::Configured
    );
}

#[tokio::test]
async fn test_install_twice_is_rejected() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();

    let err = h.orchestrator.install("foo").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidStateError");
}

#[tokio::test]
async fn test_install_seeds_properties_template() {
    let h = harness(
        FOO_DEFINITION,
        FakeFetcher::default().with_archive(
            "Server-1.2.zip",
            vec![("start.sh", "#!/bin/sh\n"), ("server.jar", "jar")],
        ),
    );
    fs::write(
        h.settings.working_dir.join("server.properties.template"),
        "motd=template\nview-distance=8\n",
    )
    .unwrap();

    h.orchestrator.install("foo").await.unwrap();

    assert_eq!(
        fs::read_to_string(h.settings.instance_dir("foo").join("server.properties")).unwrap(),
        "motd=hello\nview-distance=8\nmax-players=20\n"
    );
}

#[tokio::test]
async fn test_install_missing_entrypoint_fails() {
    let h = harness(
        FOO_DEFINITION,
        FakeFetcher::default().with_archive("Server-1.2.zip", vec![("server.jar", "jar")]),
    );

    let err = h.orchestrator.install("foo").await.unwrap_err();
    assert_eq!(err.kind(), "IoError");
    assert!(err.to_string().contains("start.sh"));
}

#[tokio::test]
async fn test_install_from_patch_archive() {
    let definition = r#"
patch:
  url: https://example.com/pack/ServerPatch-3.zip
  basefolder: ServerFiles-3
entrypoint: run.sh
port: 25565
"#;
    let h = harness(
        definition,
        FakeFetcher::default().with_archive(
            "ServerPatch-3.zip",
            vec![
                ("ServerFiles-3/run.sh", "#!/bin/sh\n"),
                ("ServerFiles-3/libraries/forge.jar", "forge"),
                ("README.txt", "outside base folder"),
            ],
        ),
    );

    h.orchestrator.install("foo").await.unwrap();

    let dir = h.settings.instance_dir("foo");
    assert!(dir.join("run.sh").is_file());
    assert_eq!(fs::read(dir.join("libraries/forge.jar")).unwrap(), b"forge");
    assert!(!dir.join("README.txt").exists());
    assert!(dir.join("patches/ServerPatch-3.zip").exists());
}

#[tokio::test]
async fn test_download_failure_aborts_install() {
    let h = harness(FOO_DEFINITION, FakeFetcher::default());

    let err = h.orchestrator.install("foo").await.unwrap_err();
    assert_eq!(err.kind(), "ExtractionError");
    assert_eq!(
        h.orchestrator.state("foo").await.unwrap(),
        InstanceState::Downloaded
    );
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();

    h.orchestrator.start("foo").await.unwrap();

    let calls = h.runtime.calls();
    assert_eq!(&calls[1..], &["prune", "run foo /minecraft/start.sh"]);
    let script = fs::read_to_string(h.settings.instance_dir("foo").join("start.sh")).unwrap();
    assert!(!script.contains('\r'));
    assert_eq!(h.orchestrator.state("foo").await.unwrap(), InstanceState::Running);

    let err = h.orchestrator.start("foo").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidStateError");

    h.orchestrator.stop("foo").await.unwrap();
    assert_eq!(
        h.orchestrator.state("foo").await.unwrap(),
        InstanceState::Configured
    );
    assert_eq!(h.runtime.calls().last().unwrap(), "stop foo");
}

#[tokio::test]
async fn test_upgrade_carries_over_user_data() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();

    let dir = h.settings.instance_dir("foo");
    fs::create_dir_all(dir.join("world/region")).unwrap();
    fs::write(dir.join("world/level.dat"), b"level").unwrap();
    fs::write(dir.join("world/region/r.0.0.mca"), b"region").unwrap();
    fs::write(dir.join("ops.json"), b"[]").unwrap();
    fs::write(dir.join("server.jar"), b"locally modified").unwrap();

    let rotated = h.orchestrator.upgrade("foo").await.unwrap();

    assert_eq!(rotated_backups(&h.settings), vec![rotated.clone()]);
    assert_eq!(fs::read(rotated.join("server.jar")).unwrap(), b"locally modified");

    assert_eq!(fs::read(dir.join("world/level.dat")).unwrap(), b"level");
    assert_eq!(fs::read(dir.join("world/region/r.0.0.mca")).unwrap(), b"region");
    assert_eq!(fs::read(dir.join("ops.json")).unwrap(), b"[]");
    assert_eq!(fs::read(dir.join("server.jar")).unwrap(), b"jar-1.2");
    assert!(dir.join("eula.txt").exists());
    assert_eq!(
        h.orchestrator.state("foo").await.unwrap(),
        InstanceState::Configured
    );
}

#[tokio::test]
async fn test_upgrade_missing_file_keeps_both_folders() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();
    // upgradeList names `world` and `ops.json`; only the world exists
    fs::create_dir_all(h.settings.instance_dir("foo").join("world")).unwrap();

    let err = h.orchestrator.upgrade("foo").await.unwrap_err();

    assert_eq!(err.kind(), "MissingUpgradeFileError");
    assert!(err.to_string().contains("ops.json"));
    let backups = rotated_backups(&h.settings);
    assert_eq!(backups.len(), 1);
    assert!(backups[0].join("eula.txt").exists());
    let fresh = h.settings.instance_dir("foo");
    assert!(fresh.join("server.jar").exists());
    assert!(!fresh.join("world").exists());
}

#[tokio::test]
async fn test_upgrade_requires_installed_instance() {
    let h = foo_harness();
    let err = h.orchestrator.upgrade("foo").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidStateError");
}

#[tokio::test]
async fn test_destroy_dry_run_and_confirmed() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();
    let dir = h.settings.instance_dir("foo");

    assert!(!h.orchestrator.destroy("foo", false).await.unwrap());
    assert!(dir.join("eula.txt").exists());

    assert!(h.orchestrator.destroy("foo", true).await.unwrap());
    assert!(!dir.exists());
    assert_eq!(h.orchestrator.state("foo").await.unwrap(), InstanceState::Absent);
}

#[tokio::test]
async fn test_locked_instance_is_rejected() {
    let h = foo_harness();
    let _held = InstanceLock::acquire(&h.settings.instance_root, "foo").unwrap();

    let err = h.orchestrator.install("foo").await.unwrap_err();
    assert_eq!(err.kind(), "InstanceLockedError");
    assert!(!h.settings.instance_dir("foo").exists());
}

#[tokio::test]
async fn test_unknown_instance() {
    let h = foo_harness();
    let err = h.orchestrator.start("bar").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownInstanceError");
}

#[tokio::test]
async fn test_exec_with_console_disabled() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();
    h.orchestrator.start("foo").await.unwrap();

    let reply = h.orchestrator.exec("foo", "say hi").await.unwrap();
    assert_eq!(reply, None);
}

/// Accepts password "secret" once and answers the next command with "ran <cmd>".
async fn spawn_console_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let auth = read_packet(&mut socket).await.unwrap();
        let id = if auth.body == "secret" { auth.id } else { -1 };
        let reply = Packet { id, kind: 2, body: String::new() };
        socket.write_all(&reply.encode()).await.unwrap();

        let command = read_packet(&mut socket).await.unwrap();
        let reply = Packet {
            id: command.id,
            kind: 0,
            body: format!("ran {}", command.body),
        };
        socket.write_all(&reply.encode()).await.unwrap();
    });

    port
}

#[tokio::test]
async fn test_exec_sends_console_command() {
    let port = spawn_console_server().await;
    let definition = format!(
        "{FOO_DEFINITION}rconport: {port}\n"
    )
    .replace(
        "    max-players: 20\n",
        &format!(
            "    max-players: 20\n    enable-rcon: true\n    rcon.port: {port}\n    rcon.password: secret\n"
        ),
    );
    let h = harness(
        &definition,
        FakeFetcher::default().with_archive("Server-1.2.zip", server_archive()),
    );
    h.orchestrator.install("foo").await.unwrap();
    h.orchestrator.start("foo").await.unwrap();

    let reply = h.orchestrator.exec("foo", "list").await.unwrap();

    assert_eq!(reply.as_deref(), Some("ran /list"));
}

#[tokio::test]
async fn test_sync_backups_destination() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();
    let backups = h.settings.instance_dir("foo").join("backups");
    fs::create_dir_all(&backups).unwrap();

    h.orchestrator
        .sync_backups("foo", "nas:/srv/backups/", Some("sudo rsync"))
        .await
        .unwrap();

    assert_eq!(
        *h.syncer.calls.lock().unwrap(),
        vec![(
            backups,
            "nas:/srv/backups/foo".to_string(),
            Some("sudo rsync".to_string())
        )]
    );
}

#[tokio::test]
async fn test_sync_backups_without_backups_folder() {
    let h = foo_harness();
    h.orchestrator.install("foo").await.unwrap();

    let err = h
        .orchestrator
        .sync_backups("foo", "/mnt/backups", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InstanceMissingError");
    assert!(h.syncer.calls.lock().unwrap().is_empty());
}
