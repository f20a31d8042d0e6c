//! The watch engine: filesystem subscriptions, stability detection and
//! dispatch of finished bounces.

pub mod daemon;
pub mod dispatch;
pub mod filter;
pub mod scheduler;
pub mod tracker;
pub mod volumes;
pub mod watch_set;

pub use daemon::{Collaborators, count_audio_folders, initial_roots, run_watch_daemon};
pub use dispatch::{DispatchCoordinator, DispatchError, session_name};
pub use filter::MixFileFilter;
pub use scheduler::{IdleBackoff, SchedulerHandle, StabilityScheduler, StableFileSink};
pub use tracker::{SampleOutcome, TrackedFile};
pub use volumes::{VolumeFilter, VolumeMonitor, diff_volumes, list_volumes};
pub use watch_set::{WatchError, WatchEvent, WatchSetManager};
