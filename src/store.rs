#![forbid(unsafe_code)]

//! Flat on-disk store for downloaded audio files.
//!
//! The download directory is the single source of truth for "is this song
//! already downloaded": filenames are derived deterministically from the
//! 11-character video ID, so a plain existence check replaces any bookkeeping
//! database. Concurrent downloads of the same ID may race; both writers
//! produce the same filename, so the race is wasteful but harmless.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Placeholder that keeps the directory present in version control; the
/// cleanup sweep must never delete it.
const SENTINEL_FILE: &str = ".gitkeep";

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Handle to the download directory. All path resolution goes through this
/// struct so nothing else in the crate touches the directory layout.
pub struct DownloadStore {
    root: PathBuf,
}

impl DownloadStore {
    /// Opens the store, creating the directory when missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating download directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path for a video ID. Pure; does not touch the
    /// filesystem.
    pub fn resolve_path(&self, video_id: &str) -> PathBuf {
        self.root.join(format!("{video_id}.mp3"))
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn file_size(&self, path: &Path) -> Result<u64> {
        let metadata =
            fs::metadata(path).with_context(|| format!("reading size of {}", path.display()))?;
        Ok(metadata.len())
    }

    /// Regular files currently in the store, sentinel included.
    pub fn list_entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() {
                entries.push(path);
            }
        }
        Ok(entries)
    }

    pub fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("deleting {}", path.display()))
    }

    /// Deletes files strictly older than `max_age_hours` and returns the
    /// count. The sweep is not transactional; a file downloaded mid-sweep can
    /// race with deletion.
    pub fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let now = SystemTime::now();
        let mut deleted = 0;
        for path in self.list_entries()? {
            if path.file_name().and_then(|name| name.to_str()) == Some(SENTINEL_FILE) {
                continue;
            }
            let Ok(modified) = fs::metadata(&path).and_then(|meta| meta.modified()) else {
                continue;
            };
            let age_hours = now
                .duration_since(modified)
                .map(|age| age.as_secs_f64() / SECONDS_PER_HOUR)
                .unwrap_or(0.0);
            if age_hours > max_age_hours as f64 {
                self.delete(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
