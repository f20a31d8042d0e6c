use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of one size sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Still being written, or not enough equal samples yet.
    Growing,
    /// Size held for the required number of consecutive samples.
    Stable,
    /// The file is gone.  Terminal.
    Vanished,
}

/// Size history of one file that is still being written.
#[derive(Debug)]
pub struct TrackedFile {
    path: PathBuf,
    /// Distinct sizes seen, most recent last.
    sizes: Vec<u64>,
    matches: u32,
    required: u32,
    vanished: bool,
    created_at: DateTime<Utc>,
    last_sampled: Option<Instant>,
}

impl TrackedFile {
    pub fn new(path: PathBuf, required: u32) -> Self {
        Self {
            path,
            sizes: Vec::new(),
            matches: 0,
            required: required.max(1),
            vanished: false,
            created_at: Utc::now(),
            last_sampled: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub fn matches(&self) -> u32 {
        self.matches
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_sampled(&self) -> Option<Instant> {
        self.last_sampled
    }

    /// Fold one size reading into the history.
    pub fn observe(&mut self, size: u64) -> SampleOutcome {
        if self.vanished {
            return SampleOutcome::Vanished;
        }
        match self.sizes.last() {
            None => {
                self.sizes.push(size);
                SampleOutcome::Growing
            }
            Some(&last) if last == size => {
                self.matches += 1;
                if self.matches >= self.required {
                    SampleOutcome::Stable
                } else {
                    SampleOutcome::Growing
                }
            }
            Some(_) => {
                self.sizes.push(size);
                self.matches = 0;
                SampleOutcome::Growing
            }
        }
    }

    /// Mark the file as gone.  Every later sample reports `Vanished`.
    pub fn mark_vanished(&mut self) -> SampleOutcome {
        self.vanished = true;
        SampleOutcome::Vanished
    }

    /// Read the current size from disk and fold it in.
    pub async fn sample(&mut self) -> SampleOutcome {
        self.last_sampled = Some(Instant::now());
        if self.vanished {
            return SampleOutcome::Vanished;
        }
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                let outcome = self.observe(meta.len());
                debug!(
                    path = %self.path.display(),
                    size = meta.len(),
                    matches = self.matches,
                    ?outcome,
                    "sampled"
                );
                outcome
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => self.mark_vanished(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "transient error while sampling");
                SampleOutcome::Growing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    use SampleOutcome::*;

    #[test]
    fn seed_then_three_equal_readings_is_stable() {
        let mut t = TrackedFile::new(PathBuf::from("/x/mix.wav"), 3);
        let outcomes: Vec<_> = [1000, 1000, 1000, 1000].into_iter().map(|s| t.observe(s)).collect();
        assert_eq!(outcomes, vec![Growing, Growing, Growing, Stable]);
    }

    #[test]
    fn size_change_resets_the_count() {
        let mut t = TrackedFile::new(PathBuf::from("/x/mix.wav"), 3);
        assert_eq!(t.observe(10), Growing);
        assert_eq!(t.observe(10), Growing);
        assert_eq!(t.observe(10), Growing);
        assert_eq!(t.matches(), 2);

        assert_eq!(t.observe(20), Growing);
        assert_eq!(t.matches(), 0);
        assert_eq!(t.observe(20), Growing);
        assert_eq!(t.observe(20), Growing);
        assert_eq!(t.observe(20), Stable);
        assert_eq!(t.sizes(), &[10, 20]);
    }

    #[test]
    fn single_required_check() {
        let mut t = TrackedFile::new(PathBuf::from("/x/mix.wav"), 1);
        assert_eq!(t.observe(5), Growing);
        assert_eq!(t.observe(5), Stable);
    }

    #[test]
    fn vanished_is_terminal() {
        let mut t = TrackedFile::new(PathBuf::from("/x/mix.wav"), 2);
        t.observe(1);
        assert_eq!(t.mark_vanished(), Vanished);
        for _ in 0..5 {
            assert_eq!(t.observe(1), Vanished);
        }
    }

    #[tokio::test]
    async fn sample_reads_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mix.wav");
        fs::write(&path, vec![0u8; 100]).unwrap();

        let mut t = TrackedFile::new(path.clone(), 2);
        assert_eq!(t.sample().await, Growing);
        assert!(t.last_sampled().is_some());
        assert_eq!(t.sample().await, Growing);
        assert_eq!(t.sample().await, Stable);
        assert_eq!(t.sizes(), &[100]);
    }

    #[tokio::test]
    async fn reappearing_file_stays_vanished() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mix.wav");
        fs::write(&path, b"abc").unwrap();

        let mut t = TrackedFile::new(path.clone(), 1);
        assert_eq!(t.sample().await, Growing);
        fs::remove_file(&path).unwrap();
        assert_eq!(t.sample().await, Vanished);

        fs::write(&path, b"abc").unwrap();
        assert_eq!(t.sample().await, Vanished);
        assert_eq!(t.sample().await, Vanished);
    }
}
