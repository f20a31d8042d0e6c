//! Collaborators the watch engine hands work to: the conversion step, the
//! destination resolver, and the notification sink.
//!
//! The engine only sees the traits below.  The concrete implementations wrap
//! external programs (the conversion script, `mount`, `security`,
//! `osascript`) and are picked from configuration at startup.

pub mod convert;
pub mod destination;
pub mod notification;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use bounce_config::{DestinationConfig, DestinationMode};

pub use convert::{ScriptConverter, format_duration, format_file_size};
pub use destination::{FolderDestination, NasDestination};
pub use notification::{DesktopNotifier, LogNotifier};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("conversion script not found: {0}")]
    ScriptMissing(PathBuf),
    #[error("input file does not exist: {0}")]
    InputMissing(PathBuf),
    #[error("conversion failed: {0}")]
    Failed(String),
    #[error("conversion timed out after {0}s")]
    TimedOut(u64),
    #[error("output file was not created in {0}")]
    OutputMissing(PathBuf),
    #[error("conversion I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{0} not configured")]
    NotConfigured(&'static str),
    #[error("destination path does not exist: {0}")]
    Missing(PathBuf),
    #[error("destination path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("invalid NAS URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to get NAS password from keychain: {0}")]
    Keychain(String),
    #[error("failed to mount NAS: {0}")]
    Mount(String),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Turns a finished bounce into the delivery format.
#[async_trait]
pub trait ConversionService: Send + Sync {
    /// Convert `source` into `dest_dir`, returning the path of the file
    /// that was produced.
    async fn convert(
        &self,
        source: &Path,
        dest_dir: &Path,
        sample_rate: u32,
    ) -> Result<PathBuf, ConversionError>;
}

/// Maps a session name to the directory its conversions land in.
///
/// Implementations create the directory when it is absent and must tolerate
/// concurrent calls for the same session.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, session: &str) -> Result<PathBuf, DestinationError>;

    /// Whether the destination is reachable and writable right now.
    async fn probe(&self) -> Result<(), DestinationError>;

    /// Short label for logs (`icloud`, `nas`, `custom`).
    fn label(&self) -> &'static str;
}

/// Fire-and-forget user notifications.  Failures are swallowed.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str, subtitle: Option<&str>);
}

/// Pick the resolver for the configured destination mode.
pub fn build_destination(config: &DestinationConfig) -> Arc<dyn DestinationResolver> {
    match config.mode {
        DestinationMode::Icloud => Arc::new(FolderDestination::new("icloud", &config.icloud_path)),
        DestinationMode::Custom => Arc::new(FolderDestination::new("custom", &config.custom_path)),
        DestinationMode::Nas => Arc::new(NasDestination::new(
            config.nas_url.clone(),
            config.nas_username.clone(),
            config.nas_mount_point.clone(),
        )),
    }
}

/// Desktop notifications on macOS, log lines everywhere else or when
/// `enabled` is false.
pub fn build_notifier(enabled: bool) -> Arc<dyn NotificationSink> {
    if enabled && cfg!(target_os = "macos") {
        Arc::new(DesktopNotifier::default())
    } else {
        Arc::new(LogNotifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn build_destination_follows_mode() {
        let dir = TempDir::new().unwrap();
        let mut config = DestinationConfig::default();
        config.mode = DestinationMode::Custom;
        config.custom_path = dir.path().to_path_buf();

        let resolver = build_destination(&config);
        assert_eq!(resolver.label(), "custom");
        let session_dir = resolver.resolve("Session42").await.unwrap();
        assert_eq!(session_dir, dir.path().join("Session42"));

        config.mode = DestinationMode::Nas;
        assert_eq!(build_destination(&config).label(), "nas");
    }

    #[test]
    fn errors_render_readably() {
        let err = DestinationError::NotConfigured("custom path");
        assert_eq!(err.to_string(), "custom path not configured");
        let err = ConversionError::TimedOut(30);
        assert_eq!(err.to_string(), "conversion timed out after 30s");
    }
}
