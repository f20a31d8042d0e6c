//! Hands stable files to the conversion pipeline.
//!
//! Each file gets its own task: resolve the session, resolve the
//! destination, convert, notify.  Failures stay inside that task; nothing is
//! retried and the source file is never touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use bounce_exec::{
    ConversionError, ConversionService, DestinationError, DestinationResolver, NotificationSink,
};

use crate::scheduler::StableFileSink;

const APP_TITLE: &str = "Bounce Watcher";
const ERROR_TITLE: &str = "Bounce Watcher Error";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not determine session name for {}", .0.display())]
    SessionResolution(PathBuf),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Name of the session `path` belongs to: the parent directory of the
/// nearest ancestor called `audio_folder`.
///
/// `/Sessions/Song/Audio Files/Mix.wav` → `Song`.
pub fn session_name(path: &Path, audio_folder: &str) -> Result<String, DispatchError> {
    path.ancestors()
        .skip(1)
        .find(|dir| dir.file_name().is_some_and(|n| n == audio_folder))
        .and_then(|audio_dir| audio_dir.parent())
        .and_then(|session_dir| session_dir.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DispatchError::SessionResolution(path.to_path_buf()))
}

struct Inner {
    converter: Arc<dyn ConversionService>,
    destination: Arc<dyn DestinationResolver>,
    notifier: Arc<dyn NotificationSink>,
    audio_folder: String,
    sample_rate: u32,
    tasks: TaskTracker,
}

/// Runs one conversion task per stable file.
#[derive(Clone)]
pub struct DispatchCoordinator {
    inner: Arc<Inner>,
}

impl DispatchCoordinator {
    pub fn new(
        converter: Arc<dyn ConversionService>,
        destination: Arc<dyn DestinationResolver>,
        notifier: Arc<dyn NotificationSink>,
        audio_folder: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                converter,
                destination,
                notifier,
                audio_folder: audio_folder.into(),
                sample_rate,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Spawn the pipeline for `path` and return immediately.
    pub fn on_stable(&self, path: PathBuf) {
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            let _ = this.dispatch(&path).await;
        });
    }

    /// Run the whole pipeline for one file and report the outcome.
    pub async fn dispatch(&self, path: &Path) -> Result<PathBuf, DispatchError> {
        let inner = &self.inner;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let session = match session_name(path, &inner.audio_folder) {
            Ok(session) => session,
            Err(err) => {
                error!(path = %path.display(), "{err}");
                inner
                    .notifier
                    .notify(ERROR_TITLE, &format!("Could not determine session name for {file_name}"), None)
                    .await;
                return Err(err);
            }
        };
        info!(file = %file_name, session = %session, "dispatching");

        let result = self.convert(path, &file_name, &session).await;
        match &result {
            Ok(output) => {
                info!(file = %file_name, output = %output.display(), "mix delivered");
                inner
                    .notifier
                    .notify(APP_TITLE, &format!("Successfully converted {file_name}"), Some(session.as_str()))
                    .await;
            }
            Err(err) => {
                error!(file = %file_name, session = %session, error = %err, "dispatch failed");
                inner
                    .notifier
                    .notify(ERROR_TITLE, &format!("Failed to convert {file_name}: {err}"), None)
                    .await;
            }
        }
        result
    }

    async fn convert(&self, path: &Path, file_name: &str, session: &str) -> Result<PathBuf, DispatchError> {
        let inner = &self.inner;
        let dest_dir = inner.destination.resolve(session).await?;
        info!(destination = %dest_dir.display(), via = inner.destination.label(), "destination ready");

        inner
            .notifier
            .notify(APP_TITLE, &format!("Converting {file_name}..."), Some(session))
            .await;
        let output = inner
            .converter
            .convert(path, &dest_dir, inner.sample_rate)
            .await?;
        Ok(output)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Stop accepting work and wait up to `grace` for running dispatches.
    /// Returns false when some were still running at the deadline; those
    /// are left to finish or die with the process.
    pub async fn drain(&self, grace: Duration) -> bool {
        let tasks = &self.inner.tasks;
        tasks.close();
        if tasks.is_empty() {
            return true;
        }
        info!(in_flight = tasks.len(), "waiting for running conversions");
        match tokio::time::timeout(grace, tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = tasks.len(), "conversions still running at shutdown");
                false
            }
        }
    }
}

impl StableFileSink for DispatchCoordinator {
    fn file_stable(&self, path: PathBuf) {
        self.on_stable(path);
    }
}
