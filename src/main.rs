//! instancectl - lifecycle manager for containerised game-server instances
//!
//! Main entry point for the command-line interface.
//!
//! # Execution Flow
//!
//! 1. Parse the command line
//! 2. Resolve settings (defaults → `instancectl.yaml` → `INSTANCECTL_*` env vars)
//! 3. Initialize logging → `<log_dir>/instancectl.<date>` plus stderr
//! 4. Load every instance definition from the definitions directory
//! 5. Build the [`Orchestrator`] with the docker, HTTP and rsync collaborators
//! 6. Run the requested workflow on a current-thread tokio runtime
//!
//! Any failure is printed as `error[<Kind>]: <message>` and the process exits with status 1.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use instancectl::services::{DockerCli, HttpArchiveFetcher, Rsync};
use instancectl::{APP_NAME, ConfigManager, DefinitionStore, ManagerError, Orchestrator, VERSION};
use std::process::ExitCode;
use std::sync::Arc;

/// instancectl - install, upgrade and run game-server instances in containers
#[derive(Parser, Debug)]
#[command(name = "instancectl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the settings file (default: ./instancectl.yaml)
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Only write logs to the log file
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the server container image
    Build {
        /// Build without using the image cache
        #[arg(long)]
        nocache: bool,
    },

    /// Build the image, then download, mod and configure a new instance
    Install {
        /// Instance name
        name: String,
    },

    /// Reinstall an instance, carrying over the files in its upgrade list
    Upgrade {
        /// Instance name
        name: String,
    },

    /// Start an instance container
    Start {
        /// Instance name
        name: String,
    },

    /// Stop an instance container
    Stop {
        /// Instance name
        name: String,
    },

    /// Delete an instance folder (dry run unless --confirm)
    Destroy {
        /// Instance name
        name: String,

        /// Actually delete the folder
        #[arg(long)]
        confirm: bool,
    },

    /// Send a command to a running instance's remote console
    Exec {
        /// Instance name
        name: String,

        /// Console command, e.g. `say hello`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Mirror an instance's backups folder to `<dest>/<name>`
    #[command(name = "syncbackups")]
    SyncBackups {
        /// Instance name
        name: String,

        /// Local path or `host:path`
        dest: String,

        /// rsync binary to run on the remote side (e.g. `sudo rsync`)
        #[arg(long)]
        remote_helper: Option<String>,
    },

    /// List defined instances and their state
    #[command(alias = "ls")]
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ManagerError>() {
                Some(manager_err) => eprintln!("error[{}]: {}", manager_err.kind(), manager_err),
                None => eprintln!("error[Error]: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let cwd = Utf8PathBuf::try_from(cwd).context("Current directory is not valid UTF-8")?;

    let config_manager = ConfigManager::new(&cwd, cli.config.clone());
    let settings = config_manager.load_settings()?;
    let created_root = config_manager.prepare(&settings)?;

    // Held until `run` returns so buffered log lines are flushed
    let _guard = instancectl::logging::setup_logging(
        &settings.log_dir,
        APP_NAME,
        cli.debug || settings.debug,
        !cli.quiet,
    )?;
    tracing::debug!("Starting {} v{}", APP_NAME, VERSION);
    match config_manager.settings_file() {
        Some(path) => tracing::debug!("Settings read from {}", path),
        None => tracing::debug!("No settings file found, using defaults"),
    }
    if created_root {
        tracing::info!("Created instance root {}", settings.instance_root);
    }
    tracing::debug!("Settings: {:?}", settings);

    let definitions = DefinitionStore::load(&settings.definitions_root)?;
    tracing::debug!("Loaded {} instance definitions", definitions.len());

    let orchestrator = Orchestrator::new(
        settings,
        definitions,
        Arc::new(DockerCli::new()),
        Arc::new(HttpArchiveFetcher::new()?),
        Arc::new(Rsync::new()),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(dispatch(&orchestrator, cli.command))?;
    Ok(())
}

async fn dispatch(orchestrator: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Build { nocache } => orchestrator.build(nocache).await?,
        Commands::Install { name } => orchestrator.install(&name).await?,
        Commands::Upgrade { name } => {
            let backup = orchestrator.upgrade(&name).await?;
            println!("Previous files of {} kept in {}", name, backup);
        }
        Commands::Start { name } => orchestrator.start(&name).await?,
        Commands::Stop { name } => orchestrator.stop(&name).await?,
        Commands::Destroy { name, confirm } => {
            let removed = orchestrator.destroy(&name, confirm).await?;
            if !removed {
                println!("Dry run: re-run with --confirm to delete instance {}", name);
            }
        }
        Commands::Exec { name, command } => {
            if let Some(reply) = orchestrator.exec(&name, &command.join(" ")).await? {
                println!("{}", reply);
            }
        }
        Commands::SyncBackups {
            name,
            dest,
            remote_helper,
        } => {
            orchestrator
                .sync_backups(&name, &dest, remote_helper.as_deref())
                .await?
        }
        Commands::List => {
            for (name, state) in orchestrator.list().await? {
                println!("{:<24} {}", name, state);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec_joins_words() {
        let cli = Cli::try_parse_from(["instancectl", "exec", "foo", "say", "hello", "there"]).unwrap();
        match cli.command {
            Commands::Exec { name, command } => {
                assert_eq!(name, "foo");
                assert_eq!(command.join(" "), "say hello there");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_syncbackups() {
        let cli = Cli::try_parse_from([
            "instancectl",
            "syncbackups",
            "foo",
            "nas:/backups",
            "--remote-helper",
            "sudo rsync",
        ])
        .unwrap();
        match cli.command {
            Commands::SyncBackups {
                name,
                dest,
                remote_helper,
            } => {
                assert_eq!(name, "foo");
                assert_eq!(dest, "nas:/backups");
                assert_eq!(remote_helper.as_deref(), Some("sudo rsync"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_destroy_defaults_to_dry_run() {
        let cli = Cli::try_parse_from(["instancectl", "destroy", "foo"]).unwrap();
        assert!(matches!(cli.command, Commands::Destroy { confirm: false, .. }));
    }
}
