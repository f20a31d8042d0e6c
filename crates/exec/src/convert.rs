//! Conversion through an external script.
//!
//! The script is called as `script <input> <output_dir> <sample_rate>` and
//! may pick its own file name inside `output_dir` (it appends a counter when
//! the natural name is taken).  It reports that name as the last line of its
//! stdout.  Scripts that print nothing fall back to the newest
//! `<input stem>*.<ext>` written during the run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, error, info};

use bounce_config::ConversionConfig;

use crate::{ConversionError, ConversionService};

const MTIME_SLACK: Duration = Duration::from_secs(2);

pub struct ScriptConverter {
    script: PathBuf,
    timeout: Duration,
    output_extension: String,
}

impl ScriptConverter {
    /// Fails with [`ConversionError::ScriptMissing`] when the script is not
    /// a regular file.
    pub fn new(
        script: impl Into<PathBuf>,
        timeout: Duration,
        output_extension: impl Into<String>,
    ) -> Result<Self, ConversionError> {
        let converter = Self {
            script: script.into(),
            timeout,
            output_extension: output_extension.into(),
        };
        converter.check_script()?;
        Ok(converter)
    }

    pub fn from_config(config: &ConversionConfig) -> Result<Self, ConversionError> {
        Self::new(&config.script_path, config.timeout(), &config.output_extension)
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Re-checked before every conversion.
    pub fn check_script(&self) -> Result<(), ConversionError> {
        if self.script.is_file() {
            Ok(())
        } else {
            Err(ConversionError::ScriptMissing(self.script.clone()))
        }
    }

    /// Newest `<stem>*.<ext>` in `dest_dir` modified no earlier than
    /// `since`.  Only used when the script does not print its output path.
    fn find_output(&self, source: &Path, dest_dir: &Path, since: SystemTime) -> Option<PathBuf> {
        let stem = source.file_stem()?.to_string_lossy().into_owned();
        let wanted_ext = self.output_extension.to_lowercase();

        let entries = std::fs::read_dir(dest_dir).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                let name_ok = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with(&stem))
                    .unwrap_or(false);
                let ext_ok = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase() == wanted_ext)
                    .unwrap_or(false);
                name_ok && ext_ok && path.is_file()
            })
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                (modified >= since).then_some((modified, path))
            })
            .max_by_key(|(modified, _)| *modified)
            .map(|(_, path)| path)
    }
}

/// The path named on the last non-empty stdout line, when it is an
/// existing file inside `dest_dir`.  Relative paths are taken relative to
/// `dest_dir`.
fn reported_output(stdout: &str, dest_dir: &Path) -> Option<PathBuf> {
    let line = stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let path = dest_dir.join(line);
    if !path.is_file() {
        return None;
    }
    let dir = dest_dir.canonicalize().ok()?;
    let resolved = path.canonicalize().ok()?;
    resolved.starts_with(&dir).then_some(path)
}

#[async_trait]
impl ConversionService for ScriptConverter {
    async fn convert(
        &self,
        source: &Path,
        dest_dir: &Path,
        sample_rate: u32,
    ) -> Result<PathBuf, ConversionError> {
        self.check_script()?;
        if !source.is_file() {
            return Err(ConversionError::InputMissing(source.to_path_buf()));
        }

        let input_size = tokio::fs::metadata(source).await?.len();
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %name, size = %format_file_size(input_size), "starting conversion");
        debug!(input = %source.display(), output_dir = %dest_dir.display(), sample_rate, "conversion parameters");

        tokio::fs::create_dir_all(dest_dir).await?;

        let started = Instant::now();
        // Filesystem timestamps can be coarser than the wall clock.
        let since = SystemTime::now()
            .checked_sub(MTIME_SLACK)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.script)
                .arg(source)
                .arg(dest_dir)
                .arg(sample_rate.to_string())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ConversionError::TimedOut(self.timeout.as_secs()))??;
        let elapsed = started.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("script exited with {}", output.status)
            } else {
                stderr
            };
            error!(file = %name, took = %format_duration(elapsed), "conversion failed: {reason}");
            return Err(ConversionError::Failed(reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(output = %stdout.trim(), "script output");
        }

        let produced = reported_output(&stdout, dest_dir)
            .or_else(|| self.find_output(source, dest_dir, since))
            .ok_or_else(|| ConversionError::OutputMissing(dest_dir.to_path_buf()))?;

        let output_size = tokio::fs::metadata(&produced).await.map(|m| m.len()).unwrap_or(0);
        let saved = if input_size > 0 {
            (1.0 - output_size as f64 / input_size as f64) * 100.0
        } else {
            0.0
        };
        info!(
            output = %produced.display(),
            size = %format_file_size(output_size),
            took = %format_duration(elapsed),
            "conversion complete ({saved:.1}% smaller)"
        );

        Ok(produced)
    }
}

// ── Formatting helpers ───────────────────────────────────────────────────────

/// `1536` → `"1.5 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PB")
}

/// `45.2s`, `1m 30s`, `2h 5m`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let whole = duration.as_secs();
    let minutes = whole / 60;
    if minutes < 60 {
        return format!("{minutes}m {}s", whole % 60);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}
