//! Filesystem-backed job table.
//!
//! One directory per job under the downloads root. There is no other
//! persistent state: markers and artifacts written into a job directory are
//! the only channel between a background adapter and the status poller.

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use crate::errors::{AppError, Result};
use crate::sources::SourceKind;

pub const STARTED_MARKER: &str = "download_started.txt";
pub const COMPLETE_MARKER: &str = "download_complete.txt";
pub const ERROR_MARKER: &str = "download_error.txt";
pub const FILES_MANIFEST: &str = "files.json";
pub const FILE_MAPPING: &str = "file_mapping.json";
/// Adapters that cannot write straight into the job directory use this
/// hidden directory and move finished files up.
pub const STAGING_DIR: &str = ".staging";

const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "tmp", "temp"];

pub fn is_error_marker(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "error.txt" || name.ends_with("_error.txt")
}

/// Markers and artifacts written by this system rather than by a downloader.
pub fn is_reserved_name(name: &str) -> bool {
    matches!(name, STARTED_MARKER | COMPLETE_MARKER | FILES_MANIFEST | FILE_MAPPING)
        || is_error_marker(name)
}

/// Entries that are never deliverable and never count as progress: hidden
/// files (temp files, staging), partially downloaded files including yt-dlp's
/// fragment pieces (`name.mp4.part-Frag3`), and yt-dlp's per-format
/// intermediates (`name.f137.mp4`, `name.temp.mp4`) that disappear once
/// streams are merged.
pub fn is_transient_name(name: &str) -> bool {
    if name.starts_with('.') {
        return true;
    }
    let parts: Vec<&str> = name.split('.').collect();
    let Some((ext, middle)) = parts.split_last() else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    if PARTIAL_EXTENSIONS.contains(&ext.as_str()) || ext.starts_with("part-") {
        return true;
    }
    middle.iter().skip(1).any(|part| {
        *part == "temp"
            || (part.len() > 1
                && part.starts_with('f')
                && part[1..].chars().all(|c| c.is_ascii_digit() || c == '-'))
    })
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub source_kind: SourceKind,
    pub url: String,
    pub directory_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// One entry of a job directory listing.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_file: bool,
    pub size: u64,
}

pub struct JobStore {
    root: PathBuf,
    last_id: AtomicI64,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_id: AtomicI64::new(0),
        }
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Millisecond timestamp, bumped past the previous id when two jobs land
    /// in the same millisecond.
    fn next_job_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_id.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed) {
                Ok(_) => return candidate.to_string(),
                Err(actual) => last = actual,
            }
        }
    }

    /// Allocates a fresh job id, creates its directory and writes the
    /// started marker.
    pub async fn create_job(&self, source_kind: SourceKind, url: &str) -> Result<Job> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            AppError::Setup(format!("Cannot create downloads directory {:?}: {}", self.root, e))
        })?;

        // create_dir (not create_dir_all) so an id left over from a previous
        // process run is never reused
        let (job_id, directory_path) = loop {
            let job_id = self.next_job_id();
            let dir = self.job_dir(&job_id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => break (job_id, dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(AppError::Setup(format!("Cannot create job directory {:?}: {}", dir, e)))
                }
            }
        };

        let created_at = Utc::now();
        let started = format!(
            "Download started at {}\nURL: {}\nSource: {}\nStarted: {}\n",
            job_id,
            url,
            source_kind,
            created_at.to_rfc3339()
        );
        write_atomic(&directory_path, STARTED_MARKER, started.as_bytes())
            .map_err(|e| AppError::Setup(format!("Cannot write started marker: {}", e)))?;

        Ok(Job {
            job_id,
            source_kind,
            url: url.to_string(),
            directory_path,
            created_at,
        })
    }

    /// Lists a job directory. `None` when the job does not exist.
    pub async fn list(&self, job_id: &str) -> Result<Option<Vec<DirEntryInfo>>> {
        let dir = self.job_dir(job_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // an entry may vanish between listing and stat (adapter renames)
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            entries.push(DirEntryInfo {
                name,
                path: entry.path(),
                is_file: metadata.is_file(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(entries))
    }
}

/// Replaces `dir/name` atomically: readers see the old content or the new
/// content, never a partial write.
pub fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

/// Like [`write_atomic`] but only if `dir/name` does not exist yet. Returns
/// `false` when another writer got there first.
pub fn write_new_atomic(dir: &Path, name: &str, contents: &[u8]) -> Result<bool> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(dir.join(name)) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(AppError::Io(e.error)),
    }
}

/// First line of a marker file, trimmed. `None` if unreadable or blank.
pub async fn read_first_line(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let text = String::from_utf8_lossy(&bytes);
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}
