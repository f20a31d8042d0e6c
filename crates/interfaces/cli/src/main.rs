mod daemon;
mod startup;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use bounce_config::{AppConfig, LoggingConfig, default_config_path};

#[derive(Debug, Parser)]
#[command(
    name = "bounce-watcher",
    version,
    about = "Watches DAW session folders and converts finished mix bounces"
)]
struct Cli {
    /// Config file (defaults to $BOUNCE_WATCHER_CONFIG or
    /// ~/.config/bounce-watcher/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log notifications instead of showing them on the desktop.
    #[arg(long, global = true)]
    no_notify: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch in the foreground until interrupted (default).
    Run,
    /// Manage the background service.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Inspect or create the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Verify configuration, destination, script and watch roots.
    Check,
}

#[derive(Debug, Subcommand)]
enum DaemonCommands {
    Start {
        /// Replace a running daemon.
        #[arg(long)]
        force: bool,
    },
    Stop,
    Restart,
    Status,
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the config file location.
    Path,
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration for mistakes.
    Validate,
}

/// Install the global subscriber: stderr always, plus the configured log
/// file.  `RUST_LOG` overrides the configured level.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let file = logging.log_file.as_ref().and_then(|path| {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
        let name = path.file_name()?;
        fs::create_dir_all(dir).ok()?;
        Some(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name)))
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr_layer).init();
            None
        }
    }
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; use `bounce-watcher config init --force` to overwrite",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Written without validation: the user still has to list folders.
    let rendered = toml::to_string_pretty(&AppConfig::default())?;
    fs::write(path, rendered)?;
    println!("wrote default configuration to {}", path.display());
    println!("edit [source] folders (or set mode = \"all_external_drives\") before running");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load_from(&config_path)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _guard = init_logging(&config.logging);
            if std::env::var(daemon::DAEMON_PROCESS_ENV).ok().as_deref() == Some("1") {
                tracing::info!(pid = std::process::id(), "starting as background daemon");
            }
            daemon::run_watcher_process(config, cli.no_notify).await?;
        }
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { force } => {
                daemon::daemon_start(&config, &config_path, cli.no_notify, force)?;
            }
            DaemonCommands::Stop => daemon::daemon_stop(&config)?,
            DaemonCommands::Restart => {
                daemon::daemon_stop(&config)?;
                daemon::daemon_start(&config, &config_path, cli.no_notify, true)?;
            }
            DaemonCommands::Status => daemon::daemon_status(&config)?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Path => println!("{}", config_path.display()),
            ConfigCommands::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigCommands::Init { force } => config_init(&config_path, force)?,
            ConfigCommands::Validate => {
                config.validate()?;
                println!("configuration is valid");
            }
        },
        Commands::Check => startup::run_check(&config).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs_the_watcher() {
        let cli = Cli::try_parse_from(["bounce-watcher"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.no_notify);
    }

    #[test]
    fn global_flags_work_after_subcommands() {
        let cli = Cli::try_parse_from([
            "bounce-watcher",
            "daemon",
            "start",
            "--force",
            "--config",
            "/tmp/bw.toml",
            "--no-notify",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/bw.toml")));
        assert!(cli.no_notify);
        assert!(matches!(
            cli.command,
            Some(Commands::Daemon {
                command: DaemonCommands::Start { force: true }
            })
        ));
    }

    #[test]
    fn config_init_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        config_init(&path, false).unwrap();
        assert!(path.exists());
        assert!(config_init(&path, false).is_err());
        assert!(config_init(&path, true).is_ok());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.source.audio_files_folder, "Audio Files");
    }
}
