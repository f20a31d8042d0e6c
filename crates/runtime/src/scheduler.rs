//! Single owner of every [`TrackedFile`].
//!
//! | Mode   | Trackers | Wakes on                                          |
//! |--------|----------|---------------------------------------------------|
//! | Active | ≥ 1      | new file, or the earliest tracker coming due      |
//! | Idle   | 0        | new file, or the idle backoff timer               |
//!
//! New paths arrive on a bounded channel; their arrival is the wake signal
//! that ends an idle wait early.  Each tracker is sampled at most once per
//! `check_interval`, the first sample happening on the wakeup right after it
//! was added.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bounce_config::{ConversionConfig, SchedulerConfig};

use crate::tracker::{SampleOutcome, TrackedFile};

/// Receives files once they have stopped growing.  Must not block.
pub trait StableFileSink: Send + Sync + 'static {
    fn file_stable(&self, path: PathBuf);
}

// ── Idle backoff ─────────────────────────────────────────────────────────────

/// Idle wait that doubles every `after` consecutive empty wakeups, up to
/// `max`.  Any new file resets it.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    base: Duration,
    max: Duration,
    after: u32,
    wakeups: u32,
}

impl IdleBackoff {
    pub fn new(base: Duration, max: Duration, after: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            after: after.max(1),
            wakeups: 0,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.idle_interval_secs),
            Duration::from_secs(config.idle_max_secs),
            config.idle_backoff_after,
        )
    }

    pub fn current(&self) -> Duration {
        let doublings = self.wakeups / self.after;
        let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn record_idle_wakeup(&mut self) {
        self.wakeups = self.wakeups.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.wakeups = 0;
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Cloneable entry point for handing new paths to the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<PathBuf>,
}

impl SchedulerHandle {
    /// Queue `path` for tracking.  Returns false when the scheduler is gone
    /// or its queue is full.
    pub fn track(&self, path: PathBuf) -> bool {
        match self.tx.try_send(path) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(path)) => {
                warn!(path = %path.display(), "scheduler queue full; dropping file");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct StabilityScheduler {
    trackers: HashMap<PathBuf, TrackedFile>,
    incoming: mpsc::Receiver<PathBuf>,
    check_interval: Duration,
    checks_required: u32,
    idle: IdleBackoff,
    sink: Box<dyn StableFileSink>,
}

impl StabilityScheduler {
    pub fn new(
        check_interval: Duration,
        checks_required: u32,
        idle: IdleBackoff,
        queue: usize,
        sink: impl StableFileSink,
    ) -> (Self, SchedulerHandle) {
        let (tx, incoming) = mpsc::channel(queue.max(1));
        let scheduler = Self {
            trackers: HashMap::new(),
            incoming,
            check_interval,
            checks_required,
            idle,
            sink: Box::new(sink),
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn from_config(
        conversion: &ConversionConfig,
        scheduler: &SchedulerConfig,
        sink: impl StableFileSink,
    ) -> (Self, SchedulerHandle) {
        Self::new(
            conversion.check_interval(),
            conversion.stability_checks_required,
            IdleBackoff::from_config(scheduler),
            scheduler.event_buffer,
            sink,
        )
    }

    /// Run on a new task until `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    fn begin_tracking(&mut self, path: PathBuf) {
        self.idle.reset();
        if self.trackers.contains_key(&path) {
            debug!(path = %path.display(), "already tracking");
            return;
        }
        info!(path = %path.display(), "tracking new mix file");
        let tracker = TrackedFile::new(path.clone(), self.checks_required);
        self.trackers.insert(path, tracker);
    }

    /// When the next tracker comes due, or None in idle mode.
    fn next_due(&self) -> Option<Instant> {
        self.trackers
            .values()
            .map(|t| match t.last_sampled() {
                Some(at) => at + self.check_interval,
                None => Instant::now(),
            })
            .min()
    }

    /// Sample every due tracker once; hand off stable files and drop
    /// vanished ones.
    async fn sample_due(&mut self) {
        let now = Instant::now();
        let interval = self.check_interval;
        let mut finished = Vec::new();

        for (path, tracker) in self.trackers.iter_mut() {
            let due = tracker
                .last_sampled()
                .is_none_or(|at| now.duration_since(at) >= interval);
            if !due {
                continue;
            }
            match tracker.sample().await {
                SampleOutcome::Growing => {}
                outcome => finished.push((path.clone(), outcome)),
            }
        }

        for (path, outcome) in finished {
            let Some(tracker) = self.trackers.remove(&path) else {
                continue;
            };
            match outcome {
                SampleOutcome::Stable => {
                    let waited = chrono::Utc::now() - tracker.created_at();
                    info!(
                        path = %path.display(),
                        waited_secs = waited.num_seconds(),
                        "file is stable"
                    );
                    self.sink.file_stable(path);
                }
                SampleOutcome::Vanished => {
                    info!(path = %path.display(), "file disappeared before it settled; abandoning");
                }
                SampleOutcome::Growing => {}
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("stability scheduler started");
        loop {
            let (deadline, idle) = match self.next_due() {
                Some(at) => (at, false),
                None => (Instant::now() + self.idle.current(), true),
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.incoming.recv() => match received {
                    Some(path) => self.begin_tracking(path),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if idle {
                        self.idle.record_idle_wakeup();
                        debug!(next_wait = ?self.idle.current(), "idle wakeup");
                    } else {
                        self.sample_due().await;
                    }
                }
            }
        }

        if !self.trackers.is_empty() {
            info!(abandoned = self.trackers.len(), "scheduler stopping with files still settling");
        }
        info!("stability scheduler stopped");
    }
}
