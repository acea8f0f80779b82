//! # Diagnostic Recording
//!
//! Keeps a rolling window of recent utterances next to their transcripts so
//! recognition problems can be replayed offline.
//!
//! ## File Layout:
//! Each request writes a pair `<UTC timestamp>_<short id>.wav` and
//! `<UTC timestamp>_<short id>.txt`. The timestamp sorts lexically, so the
//! oldest files are always first in name order.
//!
//! ## Rotation:
//! After every write, the oldest recordings are deleted pair by pair until
//! no more than `max_files` `.wav`/`.txt` files remain. The newest pair is
//! always kept. Other files in the directory are never touched. Another
//! writer may prune the same file first; that is not an error.

use crate::audio::Utterance;
use crate::config::RecordingConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const RECORDING_EXTENSIONS: [&str; 2] = ["wav", "txt"];

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("recording directory error: {0}")]
    Io(#[from] io::Error),

    #[error("could not encode utterance: {0}")]
    Wav(#[from] hound::Error),
}

#[derive(Debug, Clone)]
pub struct Recorder {
    directory: PathBuf,
    max_files: usize,
}

impl Recorder {
    /// Create the recorder, making the directory if needed.
    pub fn new(config: &RecordingConfig) -> Result<Self, RecordingError> {
        fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory.clone(),
            max_files: config.max_files,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the utterance and transcript, then prune. Returns the `.wav` path.
    pub fn save(&self, utterance: &Utterance, transcript: &str) -> Result<PathBuf, RecordingError> {
        let stem = recording_stem(Utc::now(), Uuid::new_v4());
        let wav_path = self.directory.join(format!("{}.wav", stem));
        let txt_path = self.directory.join(format!("{}.txt", stem));

        fs::write(&wav_path, utterance.to_wav()?)?;
        fs::write(&txt_path, transcript)?;

        let removed = self.prune()?;
        tracing::debug!(
            path = %wav_path.display(),
            removed,
            "Recording saved"
        );

        Ok(wav_path)
    }

    /// Delete the oldest recordings until at most `max_files` files remain.
    /// A `.wav` and its `.txt` share a stem and are always removed together.
    /// Returns how many files were removed.
    pub fn prune(&self) -> Result<usize, RecordingError> {
        let mut by_stem: BTreeMap<OsString, Vec<PathBuf>> = BTreeMap::new();
        for path in fs::read_dir(&self.directory)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_recording(path))
        {
            if let Some(stem) = path.file_stem() {
                by_stem.entry(stem.to_os_string()).or_default().push(path);
            }
        }

        let mut remaining: usize = by_stem.values().map(Vec::len).sum();
        let mut removed = 0;

        let prunable = by_stem.len().saturating_sub(1);
        for paths in by_stem.values().take(prunable) {
            if remaining <= self.max_files {
                break;
            }
            for path in paths {
                match fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            remaining -= paths.len();
        }

        Ok(removed)
    }
}

fn is_recording(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| RECORDING_EXTENSIONS.contains(&ext))
}

/// `20240131T235959.123Z_1a2b3c4d`
pub fn recording_stem(at: DateTime<Utc>, id: Uuid) -> String {
    let id = id.simple().to_string();
    format!("{}_{}", at.format("%Y%m%dT%H%M%S%.3fZ"), &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn recorder(dir: &Path, max_files: usize) -> Recorder {
        Recorder::new(&RecordingConfig {
            enabled: true,
            directory: dir.to_path_buf(),
            max_files,
        })
        .unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_stem_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
        let id = Uuid::parse_str("1a2b3c4d-0000-0000-0000-000000000000").unwrap();
        assert_eq!(recording_stem(at, id), "20240131T235959.000Z_1a2b3c4d");
    }

    #[test]
    fn test_save_writes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), 10);

        let wav = recorder
            .save(&Utterance::from_samples(vec![1, 2, 3]), "hello world")
            .unwrap();

        let txt = wav.with_extension("txt");
        assert_eq!(fs::read_to_string(txt).unwrap(), "hello world");
        assert_eq!(&fs::read(&wav).unwrap()[0..4], b"RIFF");
        assert_eq!(names(dir.path()).len(), 2);
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let recorder = recorder(&nested, 10);
        assert!(recorder.directory().is_dir());
    }

    #[test]
    fn test_prunes_oldest_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "20200101T000000.000Z_aaaaaaaa.wav",
            "20200101T000000.000Z_aaaaaaaa.txt",
            "20210101T000000.000Z_bbbbbbbb.wav",
            "20210101T000000.000Z_bbbbbbbb.txt",
            "notes.md",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let recorder = recorder(dir.path(), 4);
        let wav = recorder.save(&Utterance::from_samples(vec![0; 16]), "").unwrap();

        let remaining = names(dir.path());
        assert_eq!(remaining.len(), 5);
        assert!(!remaining.iter().any(|n| n.contains("aaaaaaaa")));
        assert!(remaining.contains(&"20210101T000000.000Z_bbbbbbbb.wav".to_string()));
        assert!(remaining.contains(&"notes.md".to_string()));
        assert!(wav.exists());
    }

    #[test]
    fn test_odd_limit_never_splits_a_pair() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["20200101T000000.000Z_aaaaaaaa", "20210101T000000.000Z_bbbbbbbb"] {
            fs::write(dir.path().join(format!("{}.wav", stem)), b"x").unwrap();
            fs::write(dir.path().join(format!("{}.txt", stem)), b"x").unwrap();
        }

        let removed = recorder(dir.path(), 3).prune().unwrap();

        assert_eq!(removed, 2);
        assert_eq!(
            names(dir.path()),
            vec![
                "20210101T000000.000Z_bbbbbbbb.txt".to_string(),
                "20210101T000000.000Z_bbbbbbbb.wav".to_string(),
            ]
        );
    }

    #[test]
    fn test_newest_pair_survives_limit_of_one() {
        let dir = tempfile::tempdir().unwrap();
        let wav = recorder(dir.path(), 1)
            .save(&Utterance::from_samples(vec![0; 16]), "kept")
            .unwrap();

        assert!(wav.exists());
        assert!(wav.with_extension("txt").exists());
    }

    #[test]
    fn test_prune_under_limit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20200101T000000.000Z_aaaaaaaa.wav"), b"x").unwrap();
        assert_eq!(recorder(dir.path(), 4).prune().unwrap(), 0);
    }
}
