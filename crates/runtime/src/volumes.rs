//! Mounted-volume tracking for `all_external_drives` mode.
//!
//! `volumes_dir` is watched non-recursively.  Any change there triggers a
//! diff of the current listing against the known set; the difference is
//! published as `RootAdded` / `RootRemoved` on the shared event channel.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::{Regex, RegexBuilder};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bounce_config::SourceConfig;
use bounce_exec::NotificationSink;

use crate::watch_set::{WatchError, WatchEvent};

/// Which entries of the volumes directory count as watchable volumes.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    exclude: Vec<Regex>,
}

impl VolumeFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exclude = patterns
            .into_iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { exclude })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, regex::Error> {
        Self::new(&config.exclude_patterns)
    }

    /// Hidden entries and anything matching an exclude pattern (by name or
    /// by full path) are rejected.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        let full = path.to_string_lossy();
        !self
            .exclude
            .iter()
            .any(|re| re.is_match(name) || re.is_match(&full))
    }
}

/// Current volumes under `dir` that pass `filter`.
///
/// Symlinks are skipped: the boot volume shows up as a link to `/`.
pub fn list_volumes(dir: &Path, filter: &VolumeFilter) -> BTreeSet<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| filter.accepts(path))
        .collect()
}

/// Difference between two listings: (added, removed).
pub fn diff_volumes(
    known: &BTreeSet<PathBuf>,
    current: &BTreeSet<PathBuf>,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let added = current.difference(known).cloned().collect();
    let removed = known.difference(current).cloned().collect();
    (added, removed)
}

fn volume_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Running volume watcher.  Dropping it stops monitoring.
pub struct VolumeMonitor {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl VolumeMonitor {
    /// Start watching `dir`.  `known` is the listing the daemon already
    /// watches, so only later changes are reported.
    pub fn start(
        dir: &Path,
        filter: VolumeFilter,
        known: BTreeSet<PathBuf>,
        settle: Duration,
        events: mpsc::Sender<WatchEvent>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, WatchError> {
        // Capacity 1: bursts of events collapse into one rescan.
        let (poke_tx, poke_rx) = mpsc::channel::<()>(1);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if !matches!(event.kind, EventKind::Access(_)) => {
                    let _ = poke_tx.try_send(());
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "volume watch error"),
            },
            NotifyConfig::default(),
        )
        .map_err(|source| WatchError::Notify {
            path: dir.to_path_buf(),
            source,
        })?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: dir.to_path_buf(),
                source,
            })?;

        info!(dir = %dir.display(), volumes = known.len(), "monitoring volumes");
        let task = tokio::spawn(rescan_loop(
            dir.to_path_buf(),
            filter,
            known,
            settle,
            poke_rx,
            events,
            notifier,
        ));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

async fn rescan_loop(
    dir: PathBuf,
    filter: VolumeFilter,
    mut known: BTreeSet<PathBuf>,
    settle: Duration,
    mut pokes: mpsc::Receiver<()>,
    events: mpsc::Sender<WatchEvent>,
    notifier: Arc<dyn NotificationSink>,
) {
    while pokes.recv().await.is_some() {
        let current = list_volumes(&dir, &filter);
        let (added, removed) = diff_volumes(&known, &current);

        for volume in removed {
            known.remove(&volume);
            let name = volume_name(&volume);
            info!(volume = %name, "volume disconnected");
            if events.send(WatchEvent::RootRemoved(volume)).await.is_err() {
                return;
            }
            notifier
                .notify("Bounce Watcher", &format!("Stopped monitoring: {name}"), Some("External drive disconnected"))
                .await;
        }

        if added.is_empty() {
            continue;
        }
        // Give the mount a moment to finish before walking it.
        tokio::time::sleep(settle).await;
        for volume in added {
            if !volume.is_dir() {
                debug!(volume = %volume.display(), "volume vanished while settling");
                continue;
            }
            known.insert(volume.clone());
            let name = volume_name(&volume);
            info!(volume = %name, "volume connected");
            if events.send(WatchEvent::RootAdded(volume)).await.is_err() {
                return;
            }
            notifier
                .notify("Bounce Watcher", &format!("Now monitoring: {name}"), Some("External drive connected"))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn notify(&self, _title: &str, message: &str, _subtitle: Option<&str>) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn default_filter() -> VolumeFilter {
        VolumeFilter::from_config(&SourceConfig::default()).unwrap()
    }

    #[test]
    fn filter_skips_hidden_and_excluded() {
        let f = default_filter();
        assert!(f.accepts(Path::new("/Volumes/Studio SSD")));
        assert!(!f.accepts(Path::new("/Volumes/.Spotlight-V100")));
        assert!(!f.accepts(Path::new("/Volumes/time machine backups")));
        assert!(!f.accepts(Path::new("/Volumes/Backups.backupdb")));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(VolumeFilter::new(["(unclosed"]).is_err());
    }

    #[test]
    fn listing_ignores_files_and_filtered_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("Studio SSD")).unwrap();
        fs::create_dir(dir.path().join("Time Machine")).unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let listed = list_volumes(dir.path(), &default_filter());
        assert_eq!(listed.len(), 1);
        assert!(listed.contains(&dir.path().join("Studio SSD")));
    }

    #[cfg(unix)]
    #[test]
    fn listing_skips_symlinked_volumes() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/", dir.path().join("Macintosh HD")).unwrap();
        assert!(list_volumes(dir.path(), &default_filter()).is_empty());
    }

    #[test]
    fn diff_reports_both_directions() {
        let known: BTreeSet<_> = [PathBuf::from("/V/A"), PathBuf::from("/V/B")].into();
        let current: BTreeSet<_> = [PathBuf::from("/V/B"), PathBuf::from("/V/C")].into();
        let (added, removed) = diff_volumes(&known, &current);
        assert_eq!(added, vec![PathBuf::from("/V/C")]);
        assert_eq!(removed, vec![PathBuf::from("/V/A")]);
    }

    #[tokio::test]
    async fn mount_and_unmount_are_announced() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let recorder = Arc::new(Recorder::default());
        let _monitor = VolumeMonitor::start(
            dir.path(),
            default_filter(),
            BTreeSet::new(),
            Duration::from_millis(10),
            tx,
            recorder.clone(),
        )
        .unwrap();

        let volume = dir.path().join("Studio SSD");
        fs::create_dir(&volume).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(event, Some(WatchEvent::RootAdded(volume.clone())));

        fs::remove_dir(&volume).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(event, Some(WatchEvent::RootRemoved(volume)));

        let messages = recorder.0.lock().unwrap().clone();
        assert_eq!(messages[0], "Now monitoring: Studio SSD");
    }
}
