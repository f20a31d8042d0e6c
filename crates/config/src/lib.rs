use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that points at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "BOUNCE_WATCHER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn data_dir() -> PathBuf {
    home().join(".local").join("share").join("bounce-watcher")
}

/// Location of the config file: `$BOUNCE_WATCHER_CONFIG` when set, else
/// `~/.config/bounce-watcher/config.toml`.
pub fn default_config_path() -> PathBuf {
    match env::var(CONFIG_PATH_ENV) {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => home()
            .join(".config")
            .join("bounce-watcher")
            .join("config.toml"),
    }
}

// ── Source config ─────────────────────────────────────────────────────────────

/// Where watch roots come from.
///
/// | Mode                  | Roots                                              |
/// |-----------------------|----------------------------------------------------|
/// | `specific_folders`    | The `folders` list, fixed for the daemon lifetime. |
/// | `all_external_drives` | Every mounted volume, tracked as drives come and go. |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    SpecificFolders,
    AllExternalDrives,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub mode: SourceMode,
    pub folders: Vec<PathBuf>,
    /// Name of the per-session folder the DAW bounces into.  Matched
    /// case-sensitively against every ancestor of a new file.
    pub audio_files_folder: String,
    /// Case-insensitive filename prefix that marks a bounce as a mix.
    pub mix_file_prefix: String,
    /// Directory whose children are mounted volumes.
    pub volumes_dir: PathBuf,
    /// Regexes matched (case-insensitively) against volume names; a match
    /// keeps the volume out of the watch set.
    pub exclude_patterns: Vec<String>,
    /// Delay before a freshly mounted volume is watched.
    pub volume_settle_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::SpecificFolders,
            folders: vec![],
            audio_files_folder: "Audio Files".to_string(),
            mix_file_prefix: "mix".to_string(),
            volumes_dir: PathBuf::from("/Volumes"),
            exclude_patterns: vec![
                "Time Machine".to_string(),
                r"\.timemachine".to_string(),
                r"Backups\.backupdb".to_string(),
                r"^\.Trash".to_string(),
                r"^\.Spotlight".to_string(),
                r"^\.fseventsd".to_string(),
            ],
            volume_settle_ms: 1000,
        }
    }
}

// ── Destination config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationMode {
    #[default]
    Icloud,
    Nas,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub mode: DestinationMode,
    pub icloud_path: PathBuf,
    /// `smb://server/share` URL of the network share.
    pub nas_url: String,
    /// Account name; the password is read from the login keychain.
    pub nas_username: String,
    pub nas_mount_point: PathBuf,
    pub custom_path: PathBuf,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            mode: DestinationMode::Icloud,
            icloud_path: home()
                .join("Library")
                .join("Mobile Documents")
                .join("com~apple~CloudDocs")
                .join("Downloads"),
            nas_url: "smb://your-nas-server.local/share".to_string(),
            nas_username: "your-username".to_string(),
            nas_mount_point: PathBuf::from("/Volumes/NAS"),
            custom_path: home().join("Music").join("Bounce Watcher"),
        }
    }
}

impl DestinationConfig {
    /// The configured base directory for the active mode.
    pub fn active_path(&self) -> &Path {
        match self.mode {
            DestinationMode::Icloud => &self.icloud_path,
            DestinationMode::Nas => &self.nas_mount_point,
            DestinationMode::Custom => &self.custom_path,
        }
    }
}

// ── Conversion config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub sample_rate: u32,
    /// Seconds between two size samples of a tracked file.
    pub stability_check_interval: u64,
    /// Consecutive equal samples needed before a file counts as written.
    pub stability_checks_required: u32,
    /// Conversion script invoked as `script <input> <output_dir> <sample_rate>`.
    /// Overridden at runtime by `BOUNCE_WATCHER_SCRIPT` when set.
    pub script_path: PathBuf,
    pub timeout_secs: u64,
    /// Extension of the files the script produces.
    pub output_extension: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            stability_check_interval: 2,
            stability_checks_required: 3,
            script_path: data_dir().join("scripts").join("convert_mix.sh"),
            timeout_secs: 30 * 60,
            output_extension: "m4a".to_string(),
        }
    }
}

impl ConversionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.stability_check_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Scheduler config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wait between wakeups while nothing is being tracked.
    pub idle_interval_secs: u64,
    /// Upper bound the idle wait backs off to.
    pub idle_max_secs: u64,
    /// Consecutive empty idle wakeups before the idle wait doubles.
    pub idle_backoff_after: u32,
    /// Capacity of the filesystem event channel.
    pub event_buffer: usize,
    /// How long shutdown waits for in-flight conversions.
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 30,
            idle_max_secs: 60,
            idle_backoff_after: 10,
            event_buffer: 1024,
            shutdown_grace_secs: 10,
        }
    }
}

// ── Logging / daemon ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Optional log file written in addition to stderr.
    pub log_file: Option<PathBuf>,
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: Some(data_dir().join("bounce_watcher.log")),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Holds the pid, lock and daemon log files.
    pub runtime_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime_dir: data_dir().join("runtime"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub conversion: ConversionConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };

        if let Ok(level) = env::var("BOUNCE_WATCHER_LOG_LEVEL") {
            if !level.is_empty() {
                config.logging.level = level;
            }
        }

        if let Ok(script) = env::var("BOUNCE_WATCHER_SCRIPT") {
            if !script.is_empty() {
                config.conversion.script_path = PathBuf::from(script);
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: String) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg))
        }

        let source = &self.source;
        if source.mode == SourceMode::SpecificFolders && source.folders.is_empty() {
            return invalid("'folders' must be specified when source mode is 'specific_folders'".into());
        }
        if source.audio_files_folder.trim().is_empty() {
            return invalid("'audio_files_folder' must not be empty".into());
        }
        for pattern in &source.exclude_patterns {
            if let Err(err) = regex::Regex::new(pattern) {
                return invalid(format!("invalid exclude pattern '{pattern}': {err}"));
            }
        }

        let dest = &self.destination;
        match dest.mode {
            DestinationMode::Icloud if dest.icloud_path.as_os_str().is_empty() => {
                return invalid("'icloud_path' must be specified when destination mode is 'icloud'".into());
            }
            DestinationMode::Custom if dest.custom_path.as_os_str().is_empty() => {
                return invalid("'custom_path' must be specified when destination mode is 'custom'".into());
            }
            DestinationMode::Nas => {
                if dest.nas_url.trim().is_empty() {
                    return invalid("'nas_url' must be specified when destination mode is 'nas'".into());
                }
                if dest.nas_username.trim().is_empty() {
                    return invalid("'nas_username' must be specified when destination mode is 'nas'".into());
                }
                if dest.nas_mount_point.as_os_str().is_empty() {
                    return invalid("'nas_mount_point' must be specified when destination mode is 'nas'".into());
                }
            }
            _ => {}
        }

        let conv = &self.conversion;
        if conv.sample_rate == 0 {
            return invalid("'sample_rate' must be a positive integer".into());
        }
        if conv.stability_check_interval == 0 {
            return invalid("'stability_check_interval' must be at least 1 second".into());
        }
        if conv.stability_checks_required == 0 {
            return invalid("'stability_checks_required' must be at least 1".into());
        }

        let sched = &self.scheduler;
        if sched.idle_interval_secs == 0 {
            return invalid("'idle_interval_secs' must be at least 1 second".into());
        }
        if sched.idle_max_secs < sched.idle_interval_secs {
            return invalid("'idle_max_secs' must not be smaller than 'idle_interval_secs'".into());
        }
        if sched.event_buffer == 0 {
            return invalid("'event_buffer' must be at least 1".into());
        }

        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
