//! The set of directories currently subscribed to filesystem events.
//!
//! Each root gets its own recursive `notify` watcher; all of them feed the
//! same bounded channel.  Removing a root flips its `active` flag before the
//! watcher is dropped, so a callback that is already running cannot deliver
//! anything for that root afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Everything the ingest loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A path appeared below a watched root.
    Created { path: PathBuf, is_dir: bool },
    /// A volume was mounted and should be watched.
    RootAdded(PathBuf),
    /// A volume went away.
    RootRemoved(PathBuf),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot resolve watch root {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

struct Subscription {
    _watcher: RecommendedWatcher,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Roots {
    /// Keyed by canonical path.
    subscriptions: HashMap<PathBuf, Subscription>,
    /// Absolute spelling a caller used → canonical key.  An unmounted
    /// volume can no longer be canonicalized, and its absolute path differs
    /// from the canonical one when a parent is a symlink.
    aliases: HashMap<PathBuf, PathBuf>,
}

impl Roots {
    fn remember(&mut self, requested: PathBuf, canonical: &Path) {
        if requested != canonical {
            self.aliases.insert(requested, canonical.to_path_buf());
        }
    }

    fn take(&mut self, canonical: &Path) -> Option<Subscription> {
        self.aliases.retain(|_, target| target != canonical);
        self.subscriptions.remove(canonical)
    }
}

fn spelled(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Owns every active watch subscription.
pub struct WatchSetManager {
    events: mpsc::Sender<WatchEvent>,
    roots: Mutex<Roots>,
}

impl WatchSetManager {
    pub fn new(events: mpsc::Sender<WatchEvent>) -> Self {
        Self {
            events,
            roots: Mutex::new(Roots::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Roots> {
        // A panic while holding the lock leaves the maps themselves consistent.
        self.roots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start watching `path` recursively.  Returns `Ok(false)` when it is
    /// already watched.
    ///
    /// Sets up OS resources synchronously; call from `spawn_blocking` when
    /// on the runtime.
    pub fn add_root(&self, path: &Path) -> Result<bool, WatchError> {
        let root = path.canonicalize().map_err(|source| WatchError::Resolve {
            path: path.to_path_buf(),
            source,
        })?;
        if !root.is_dir() {
            return Err(WatchError::NotADirectory { path: root });
        }
        {
            let mut roots = self.lock();
            if roots.subscriptions.contains_key(&root) {
                roots.remember(spelled(path), &root);
                debug!(root = %root.display(), "already watching");
                return Ok(false);
            }
        }

        let active = Arc::new(AtomicBool::new(true));
        let watcher = build_watcher(&root, self.events.clone(), Arc::clone(&active))?;

        let mut roots = self.lock();
        roots.remember(spelled(path), &root);
        if roots.subscriptions.contains_key(&root) {
            // Lost a race with a concurrent add of the same root.
            active.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        roots.subscriptions.insert(
            root.clone(),
            Subscription {
                _watcher: watcher,
                active,
            },
        );
        info!(root = %root.display(), total = roots.subscriptions.len(), "watching");
        Ok(true)
    }

    /// Stop watching `path`, given either the spelling it was added under or
    /// its canonical form.  Returns false when it was not watched.
    pub fn remove_root(&self, path: &Path) -> bool {
        let requested = spelled(path);
        let removed = {
            let mut roots = self.lock();
            let key = roots
                .aliases
                .get(&requested)
                .cloned()
                .or_else(|| path.canonicalize().ok())
                .unwrap_or_else(|| requested.clone());
            roots.take(&key).map(|subscription| (key, subscription))
        };
        match removed {
            Some((key, subscription)) => {
                subscription.active.store(false, Ordering::SeqCst);
                drop(subscription);
                info!(root = %key.display(), "stopped watching");
                true
            }
            None => {
                debug!(root = %requested.display(), "not watched; nothing to remove");
                false
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut roots = self.lock();
            roots.aliases.clear();
            roots.subscriptions.drain().collect()
        };
        for (_, subscription) in &drained {
            subscription.active.store(false, Ordering::SeqCst);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "stopped all watches");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<_> = self.lock().subscriptions.keys().cloned().collect();
        roots.sort();
        roots
    }
}

fn build_watcher(
    root: &Path,
    events: mpsc::Sender<WatchEvent>,
    active: Arc<AtomicBool>,
) -> Result<RecommendedWatcher, WatchError> {
    let root_label = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if !active.load(Ordering::SeqCst) {
                return;
            }
            match res {
                Ok(event) => {
                    for created in created_paths(&event) {
                        // The callback runs on the watcher's own thread; never
                        // block it on a full channel.
                        match events.try_send(created) {
                            Ok(()) => {}
                            Err(TrySendError::Full(dropped)) => {
                                warn!(root = %root_label.display(), ?dropped, "event channel full; dropping event");
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(err) => warn!(root = %root_label.display(), error = %err, "watch error"),
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|source| WatchError::Notify {
        path: root.to_path_buf(),
        source,
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Notify {
            path: root.to_path_buf(),
            source,
        })?;
    Ok(watcher)
}

/// Map a raw notify event to creation events.  A rename into a watched tree
/// counts as a creation.
pub(crate) fn created_paths(event: &Event) -> Vec<WatchEvent> {
    let created = |path: &PathBuf, is_dir: bool| WatchEvent::Created {
        path: path.clone(),
        is_dir,
    };
    match event.kind {
        EventKind::Create(CreateKind::File) => event.paths.iter().map(|p| created(p, false)).collect(),
        EventKind::Create(CreateKind::Folder) => event.paths.iter().map(|p| created(p, true)).collect(),
        EventKind::Create(_) => event.paths.iter().map(|p| created(p, p.is_dir())).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| created(p, p.is_dir())).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .last()
            .map(|p| vec![created(p, p.is_dir())])
            .unwrap_or_default(),
        // Backends that cannot tell the two ends of a rename apart.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| created(p, p.is_dir()))
            .collect(),
        _ => Vec::new(),
    }
}
