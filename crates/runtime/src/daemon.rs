//! Wires the watch set, scheduler, dispatcher and volume monitor together
//! and runs them until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use bounce_config::{AppConfig, SourceConfig, SourceMode};
use bounce_exec::{ConversionService, DestinationResolver, NotificationSink};

use crate::dispatch::DispatchCoordinator;
use crate::filter::MixFileFilter;
use crate::scheduler::StabilityScheduler;
use crate::volumes::{VolumeFilter, VolumeMonitor, list_volumes};
use crate::watch_set::{WatchEvent, WatchSetManager};

/// External capabilities the daemon drives.
#[derive(Clone)]
pub struct Collaborators {
    pub converter: Arc<dyn ConversionService>,
    pub destination: Arc<dyn DestinationResolver>,
    pub notifier: Arc<dyn NotificationSink>,
}

/// Directories to watch at startup.
///
/// Configured folders that do not exist are skipped with a warning.  In
/// external-drive mode this is the filtered listing of the volumes dir.
pub fn initial_roots(source: &SourceConfig) -> Result<Vec<PathBuf>> {
    match source.mode {
        SourceMode::SpecificFolders => Ok(source
            .folders
            .iter()
            .filter_map(|folder| {
                if folder.is_dir() {
                    Some(std::path::absolute(folder).unwrap_or_else(|_| folder.clone()))
                } else {
                    warn!(folder = %folder.display(), "configured folder does not exist");
                    None
                }
            })
            .collect()),
        SourceMode::AllExternalDrives => {
            let filter = VolumeFilter::from_config(source).context("invalid exclude pattern")?;
            Ok(list_volumes(&source.volumes_dir, &filter).into_iter().collect())
        }
    }
}

/// Number of directories named `audio_folder` below `root`.
pub fn count_audio_folders(root: &Path, audio_folder: &str) -> usize {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.') || e.depth() == 0)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() == audio_folder)
        .count()
}

async fn add_root(watch_set: &Arc<WatchSetManager>, root: PathBuf, audio_folder: &str) -> bool {
    let set = Arc::clone(watch_set);
    let target = root.clone();
    match tokio::task::spawn_blocking(move || set.add_root(&target)).await {
        Ok(Ok(true)) => {
            info!(root = %root.display(), "watch root added");
            // Informational only; a large volume can take a while to walk.
            let name = audio_folder.to_string();
            tokio::task::spawn_blocking(move || {
                let found = count_audio_folders(&root, &name);
                info!(root = %root.display(), audio_folders = found, "scanned watch root");
            });
            true
        }
        Ok(Ok(false)) => false,
        Ok(Err(err)) => {
            warn!(error = %err, "could not watch root");
            false
        }
        Err(err) => {
            warn!(root = %root.display(), error = %err, "watch setup panicked");
            false
        }
    }
}

async fn remove_root(watch_set: &Arc<WatchSetManager>, root: PathBuf) {
    let set = Arc::clone(watch_set);
    if let Err(err) = tokio::task::spawn_blocking(move || set.remove_root(&root)).await {
        warn!(error = %err, "watch removal panicked");
    }
}

/// Applies root additions and removals in arrival order, off the ingest
/// path.  Ends when `changes` closes.
async fn apply_root_changes(
    watch_set: Arc<WatchSetManager>,
    audio_folder: String,
    mut changes: mpsc::UnboundedReceiver<WatchEvent>,
) {
    while let Some(change) = changes.recv().await {
        match change {
            WatchEvent::RootAdded(root) => {
                add_root(&watch_set, root, &audio_folder).await;
            }
            WatchEvent::RootRemoved(root) => remove_root(&watch_set, root).await,
            WatchEvent::Created { .. } => {}
        }
    }
}

/// Run until `shutdown` flips to true.
///
/// Fails only during startup: no usable watch root, or a watcher that cannot
/// be created.  Everything after that is logged and survived.
pub async fn run_watch_daemon(
    config: AppConfig,
    collaborators: Collaborators,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(config.scheduler.event_buffer.max(1));
    let watch_set = Arc::new(WatchSetManager::new(event_tx.clone()));
    run_with_watch_set(config, collaborators, shutdown, watch_set, event_tx, event_rx).await
}

/// Body of [`run_watch_daemon`] around a caller-built watch set that feeds
/// `event_tx`.
async fn run_with_watch_set(
    config: AppConfig,
    collaborators: Collaborators,
    mut shutdown: watch::Receiver<bool>,
    watch_set: Arc<WatchSetManager>,
    event_tx: mpsc::Sender<WatchEvent>,
    mut event_rx: mpsc::Receiver<WatchEvent>,
) -> Result<()> {
    let source = &config.source;
    let roots = initial_roots(source)?;
    if roots.is_empty() {
        bail!("No valid watch paths found");
    }

    for root in &roots {
        add_root(&watch_set, root.clone(), &source.audio_files_folder).await;
    }
    let watched = watch_set.subscription_count();
    if watched == 0 {
        bail!("No valid watch paths found");
    }

    // ── Scheduler + dispatch ─────────────────────────────────────────────
    let coordinator = DispatchCoordinator::new(
        Arc::clone(&collaborators.converter),
        Arc::clone(&collaborators.destination),
        Arc::clone(&collaborators.notifier),
        &source.audio_files_folder,
        config.conversion.sample_rate,
    );
    let (scheduler, scheduler_handle) =
        StabilityScheduler::from_config(&config.conversion, &config.scheduler, coordinator.clone());
    let scheduler_task = scheduler.spawn(shutdown.clone());

    // ── Volume monitor ───────────────────────────────────────────────────
    let volume_monitor = if source.mode == SourceMode::AllExternalDrives {
        let filter = VolumeFilter::from_config(source).context("invalid exclude pattern")?;
        match VolumeMonitor::start(
            &source.volumes_dir,
            filter,
            roots.iter().cloned().collect(),
            Duration::from_millis(source.volume_settle_ms),
            event_tx.clone(),
            Arc::clone(&collaborators.notifier),
        ) {
            Ok(monitor) => Some(monitor),
            Err(err) => {
                warn!(error = %err, "volume monitoring unavailable; new drives will not be picked up");
                None
            }
        }
    } else {
        None
    };
    drop(event_tx);

    info!(
        roots = ?watch_set.roots(),
        destination = collaborators.destination.label(),
        sample_rate = config.conversion.sample_rate,
        "bounce watcher running"
    );
    let subtitle = format!("Watching {watched} location(s)");
    collaborators
        .notifier
        .notify("Bounce Watcher", "Bounce Watcher is now running", Some(subtitle.as_str()))
        .await;

    // ── Ingest ───────────────────────────────────────────────────────────
    let (root_tx, root_rx) = mpsc::unbounded_channel();
    let root_task = tokio::spawn(apply_root_changes(
        Arc::clone(&watch_set),
        source.audio_files_folder.clone(),
        root_rx,
    ));
    let filter = MixFileFilter::from_config(source);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = event_rx.recv() => match event {
                Some(WatchEvent::Created { path, is_dir }) => {
                    if filter.is_candidate(&path, is_dir) {
                        scheduler_handle.track(path);
                    } else {
                        debug!(path = %path.display(), "ignored");
                    }
                }
                Some(change) => {
                    let _ = root_tx.send(change);
                }
                None => break,
            },
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    info!("shutting down");
    drop(volume_monitor);
    drop(root_tx);
    if let Err(err) = root_task.await {
        warn!(error = %err, "root change task ended abnormally");
    }
    let set = Arc::clone(&watch_set);
    let _ = tokio::task::spawn_blocking(move || set.clear()).await;
    drop(event_rx);

    if let Err(err) = scheduler_task.await {
        warn!(error = %err, "scheduler task ended abnormally");
    }
    coordinator
        .drain(Duration::from_secs(config.scheduler.shutdown_grace_secs))
        .await;
    info!("bounce watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use async_trait::async_trait;
    use bounce_exec::{ConversionError, DestinationError};
    use tempfile::TempDir;

    struct ChannelConverter(mpsc::UnboundedSender<PathBuf>);

    #[async_trait]
    impl ConversionService for ChannelConverter {
        async fn convert(&self, source: &Path, dest_dir: &Path, _rate: u32) -> Result<PathBuf, ConversionError> {
            let _ = self.0.send(source.to_path_buf());
            Ok(dest_dir.join("out.m4a"))
        }
    }

    struct TempDestination(PathBuf);

    #[async_trait]
    impl DestinationResolver for TempDestination {
        async fn resolve(&self, session: &str) -> Result<PathBuf, DestinationError> {
            Ok(self.0.join(session))
        }
        async fn probe(&self) -> Result<(), DestinationError> {
            Ok(())
        }
        fn label(&self) -> &'static str {
            "temp"
        }
    }

    struct Quiet;

    #[async_trait]
    impl NotificationSink for Quiet {
        async fn notify(&self, _: &str, _: &str, _: Option<&str>) {}
    }

    fn collaborators(dest: &Path) -> (Collaborators, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collab = Collaborators {
            converter: Arc::new(ChannelConverter(tx)),
            destination: Arc::new(TempDestination(dest.to_path_buf())),
            notifier: Arc::new(Quiet),
        };
        (collab, rx)
    }

    fn config_for(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.source.folders = vec![root.to_path_buf()];
        config.conversion.stability_check_interval = 1;
        config.conversion.stability_checks_required = 1;
        config.scheduler.shutdown_grace_secs = 1;
        config
    }

    #[test]
    fn initial_roots_skip_missing_folders() {
        let dir = TempDir::new().unwrap();
        let mut source = SourceConfig::default();
        source.folders = vec![dir.path().to_path_buf(), dir.path().join("missing")];
        assert_eq!(initial_roots(&source).unwrap(), vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn external_drive_roots_come_from_the_volumes_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("Studio SSD")).unwrap();
        fs::create_dir(dir.path().join("Time Machine Backups")).unwrap();

        let mut source = SourceConfig::default();
        source.mode = SourceMode::AllExternalDrives;
        source.volumes_dir = dir.path().to_path_buf();
        assert_eq!(initial_roots(&source).unwrap(), vec![dir.path().join("Studio SSD")]);
    }

    #[test]
    fn counts_audio_folders_at_any_depth() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("A/Audio Files")).unwrap();
        fs::create_dir_all(dir.path().join("Projects/B/Audio Files")).unwrap();
        fs::create_dir_all(dir.path().join(".Trash/C/Audio Files")).unwrap();
        assert_eq!(count_audio_folders(dir.path(), "Audio Files"), 2);
    }

    #[tokio::test]
    async fn no_usable_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir.path().join("missing"));
        let (collab, _rx) = collaborators(dir.path());
        let (_tx, shutdown) = watch::channel(false);

        let err = run_watch_daemon(config, collab, shutdown).await.unwrap_err();
        assert_eq!(err.to_string(), "No valid watch paths found");
    }

    async fn wait_for_count(set: &WatchSetManager, expected: usize) -> bool {
        for _ in 0..100 {
            if set.subscription_count() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn drives_are_watched_while_connected() {
        let volumes = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::create_dir(volumes.path().join("Boot")).unwrap();

        let mut config = config_for(volumes.path());
        config.source.mode = SourceMode::AllExternalDrives;
        config.source.volumes_dir = volumes.path().to_path_buf();
        config.source.volume_settle_ms = 50;

        let (collab, mut converted) = collaborators(dest.path());
        let (event_tx, event_rx) = mpsc::channel(1024);
        let set = Arc::new(WatchSetManager::new(event_tx.clone()));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let daemon = tokio::spawn(run_with_watch_set(
            config,
            collab,
            shutdown,
            Arc::clone(&set),
            event_tx,
            event_rx,
        ));
        assert!(wait_for_count(&set, 1).await, "boot volume watched");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Plug in a drive and bounce onto it.
        let drive = volumes.path().join("Studio SSD");
        fs::create_dir(&drive).unwrap();
        assert!(wait_for_count(&set, 2).await, "new drive watched");
        let audio = drive.join("Song").join("Audio Files");
        fs::create_dir_all(&audio).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(audio.join("Mix.wav"), vec![0u8; 1000]).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), converted.recv())
            .await
            .expect("conversion within timeout")
            .unwrap();
        assert!(got.ends_with("Studio SSD/Song/Audio Files/Mix.wav"));

        // Eject it.
        fs::remove_dir_all(&drive).unwrap();
        assert!(wait_for_count(&set, 1).await, "ejected drive released");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(set.subscription_count(), 0);
    }

    #[tokio::test]
    async fn bounced_mix_reaches_the_converter() {
        let root = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let audio = root.path().join("Session42").join("Audio Files");
        fs::create_dir_all(&audio).unwrap();

        let (collab, mut converted) = collaborators(dest.path());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let daemon = tokio::spawn(run_watch_daemon(config_for(root.path()), collab, shutdown));

        // Let the watchers come up before writing.
        tokio::time::sleep(Duration::from_millis(300)).await;
        fs::write(audio.join("Vocals.wav"), b"not a mix").unwrap();
        fs::write(audio.join("Mix_Final.wav"), vec![0u8; 1000]).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), converted.recv())
            .await
            .expect("conversion within timeout")
            .unwrap();
        assert!(got.ends_with("Session42/Audio Files/Mix_Final.wav"));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(converted.try_recv().is_err());
    }
}
