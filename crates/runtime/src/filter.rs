//! Decides which newly created paths are worth tracking.

use std::path::Path;

use bounce_config::SourceConfig;

/// Extensions a DAW bounce can carry, lowercase.
pub const AUDIO_EXTENSIONS: [&str; 3] = ["wav", "aiff", "aif"];

/// Accepts files that look like a mix bounced into a session's audio folder.
#[derive(Debug, Clone)]
pub struct MixFileFilter {
    audio_folder: String,
    prefix_lower: String,
}

impl MixFileFilter {
    pub fn new(audio_folder: impl Into<String>, mix_prefix: &str) -> Self {
        Self {
            audio_folder: audio_folder.into(),
            prefix_lower: mix_prefix.to_lowercase(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(&config.audio_files_folder, &config.mix_file_prefix)
    }

    /// True when `path` sits below an audio folder (case-sensitive, any
    /// depth).
    pub fn in_audio_folder(&self, path: &Path) -> bool {
        path.parent()
            .map(|parent| {
                parent
                    .components()
                    .any(|c| c.as_os_str() == self.audio_folder.as_str())
            })
            .unwrap_or(false)
    }

    pub fn is_candidate(&self, path: &Path, is_dir: bool) -> bool {
        if is_dir {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let audio_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);

        audio_ext
            && name.to_lowercase().starts_with(&self.prefix_lower)
            && self.in_audio_folder(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> MixFileFilter {
        MixFileFilter::new("Audio Files", "mix")
    }

    #[test]
    fn accepts_mix_bounces() {
        let f = filter();
        for path in [
            "/Volumes/SSD/Session42/Audio Files/Mix_Final.wav",
            "/Volumes/SSD/Session42/Audio Files/mix v2.AIFF",
            "/Users/me/Sessions/Song/Audio Files/Bounces/MIX.aif",
        ] {
            assert!(f.is_candidate(Path::new(path), false), "{path}");
        }
    }

    #[test]
    fn rejects_directories() {
        assert!(!filter().is_candidate(Path::new("/s/Song/Audio Files/mix.wav"), true));
    }

    #[test]
    fn rejects_files_outside_audio_folder() {
        let f = filter();
        assert!(!f.is_candidate(Path::new("/s/Song/Bounced Files/mix.wav"), false));
        // Case-sensitive folder match.
        assert!(!f.is_candidate(Path::new("/s/Song/audio files/mix.wav"), false));
        // The file itself being named like the folder does not count.
        assert!(!f.is_candidate(Path::new("/s/Song/mix.wav"), false));
    }

    #[test]
    fn rejects_other_extensions() {
        let f = filter();
        for ext in ["mp3", "m4a", "ptx", "wav.tmp"] {
            let path = format!("/s/Song/Audio Files/mix.{ext}");
            assert!(!f.is_candidate(Path::new(&path), false), "{path}");
        }
        assert!(!f.is_candidate(Path::new("/s/Song/Audio Files/mix"), false));
    }

    #[test]
    fn rejects_names_without_prefix() {
        let f = filter();
        assert!(!f.is_candidate(Path::new("/s/Song/Audio Files/Vocals_01.wav"), false));
        assert!(!f.is_candidate(Path::new("/s/Song/Audio Files/final mix.wav"), false));
    }

    #[test]
    fn custom_prefix_and_folder() {
        let f = MixFileFilter::new("Bounces", "Final");
        assert!(f.is_candidate(Path::new("/s/Song/Bounces/FINAL take.wav"), false));
        assert!(!f.is_candidate(Path::new("/s/Song/Audio Files/final.wav"), false));
    }
}
