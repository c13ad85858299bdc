//! Status reconciliation: job state and deliverables derived from whatever
//! is currently in a job directory.
//!
//! Nothing here is cached between calls. Each poll lists the directory and
//! classifies it:
//!
//! * no directory: `not_found`
//! * an error marker, whatever else is present: `error`
//! * at least one deliverable: `complete`
//! * only markers, artifacts and transient files: `in_progress`, unless the
//!   completion marker says the adapter finished with nothing to show
//!
//! The only write is the file-id mapping, which is append-only.

pub mod manifest;
pub mod mapping;

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::errors::Result;
use crate::security::InputValidator;
use crate::store::{self, DirEntryInfo, JobStore, COMPLETE_MARKER};
use crate::utils;
use self::manifest::FilesManifest;
use self::mapping::{FileIdMapping, MappingEntry};

const LOCK_STRIPES: usize = 16;
const ERROR_FALLBACK_MESSAGE: &str = "Download failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotFound,
    InProgress,
    Error,
    Complete,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::NotFound => "not_found",
            JobState::InProgress => "in_progress",
            JobState::Error => "error",
            JobState::Complete => "complete",
        }
    }
}

/// One file a client can download.
#[derive(Debug, Clone, PartialEq)]
pub struct Deliverable {
    pub display_name: String,
    pub opaque_id: String,
    pub on_disk_path: PathBuf,
    pub size_bytes: Option<u64>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: JobState,
    pub message: Option<String>,
    pub files: Vec<Deliverable>,
}

impl Status {
    fn bare(state: JobState) -> Self {
        Self {
            state,
            message: None,
            files: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self::bare(JobState::NotFound)
    }

    pub fn in_progress() -> Self {
        Self::bare(JobState::InProgress)
    }

    pub fn error(message: String) -> Self {
        Self {
            state: JobState::Error,
            message: Some(message),
            files: Vec::new(),
        }
    }

    pub fn complete(files: Vec<Deliverable>) -> Self {
        Self {
            state: JobState::Complete,
            message: None,
            files,
        }
    }
}

/// A mapping entry being matched against the current listing.
struct Slot {
    entry: MappingEntry,
    is_new: bool,
    found: Option<usize>,
}

pub struct StatusReconciler {
    store: Arc<JobStore>,
    validator: InputValidator,
    // serialises mapping load/extend/write per job within this process
    locks: Vec<Mutex<()>>,
}

impl StatusReconciler {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            validator: InputValidator::new(),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_for(&self, job_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        job_id.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    pub async fn reconcile(&self, job_id: &str) -> Result<Status> {
        // an id that could never have been issued names no directory
        if self.validator.validate_job_id(job_id).is_err() {
            return Ok(Status::not_found());
        }

        let Some(entries) = self.store.list(job_id).await? else {
            return Ok(Status::not_found());
        };
        if entries.is_empty() {
            return Ok(Status::in_progress());
        }

        if let Some(marker) = entries.iter().find(|e| e.is_file && store::is_error_marker(&e.name)) {
            let message = store::read_first_line(&marker.path)
                .await
                .unwrap_or_else(|| ERROR_FALLBACK_MESSAGE.to_string());
            log::info!("[RECONCILE] Job {} failed: {}", job_id, message);
            return Ok(Status::error(message));
        }

        let candidates: Vec<DirEntryInfo> = entries
            .iter()
            .filter(|e| e.is_file && !store::is_reserved_name(&e.name) && !store::is_transient_name(&e.name))
            .cloned()
            .collect();
        let finished = entries.iter().any(|e| e.is_file && e.name == COMPLETE_MARKER);

        if candidates.is_empty() && !finished {
            return Ok(Status::in_progress());
        }

        let dir = self.store.job_dir(job_id);
        let _guard = self.lock_for(job_id).lock().await;
        let files = self.collect_deliverables(job_id, &dir, &candidates).await;
        log::debug!("[RECONCILE] Job {} complete with {} files", job_id, files.len());
        Ok(Status::complete(files))
    }

    /// Matches the existing mapping plus any newly discovered entries against
    /// `candidates`, extending the mapping on disk when new ids appear.
    async fn collect_deliverables(&self, job_id: &str, dir: &Path, candidates: &[DirEntryInfo]) -> Vec<Deliverable> {
        let existing = FileIdMapping::load(dir).await;
        let mut mapping = existing.clone().unwrap_or_else(|| FileIdMapping::new(job_id));
        let mut claimed = vec![false; candidates.len()];

        let mut slots: Vec<Slot> = mapping
            .entries
            .iter()
            .map(|entry| Slot {
                entry: entry.clone(),
                is_new: false,
                found: None,
            })
            .collect();
        match_slots(&mut slots, candidates, &mut claimed);

        let manifest_slots = match FilesManifest::load(dir).await {
            Some(manifest) => manifest_entries(&manifest)
                .into_iter()
                .filter(|entry| !mapping.contains(&entry.id))
                .map(|entry| Slot {
                    entry,
                    is_new: true,
                    found: None,
                })
                .collect(),
            None => Vec::new(),
        };

        let mut trial_claimed = claimed.clone();
        let mut trial = manifest_slots;
        match_slots(&mut trial, candidates, &mut trial_claimed);
        let manifest_in_use = slots.iter().any(|s| s.entry.from_manifest && s.found.is_some())
            || trial.iter().any(|s| s.found.is_some());

        let mut new_slots = Vec::new();
        if manifest_in_use {
            new_slots = trial;
        } else {
            if !trial.is_empty() {
                // a manifest that matches nothing on disk is no better than none
                log::debug!("[RECONCILE] Job {}: files.json matches no files, listing directory", job_id);
            }

            for (index, candidate) in candidates.iter().enumerate() {
                if claimed[index] || mapping.contains(&candidate.name) {
                    continue;
                }
                claimed[index] = true;
                new_slots.push(Slot {
                    entry: MappingEntry {
                        id: candidate.name.clone(),
                        path: candidate.name.clone(),
                        alternate_path: None,
                        media_type: None,
                        from_manifest: false,
                        exists: true,
                    },
                    is_new: true,
                    found: Some(index),
                });
            }
        }

        slots.extend(new_slots);

        let mut added = 0;
        for slot in slots.iter_mut().filter(|s| s.is_new) {
            if let Some(index) = slot.found {
                slot.entry.path = candidates[index].name.clone();
            }
            if slot.entry.alternate_path.as_deref() == Some(slot.entry.path.as_str()) {
                slot.entry.alternate_path = None;
            }
            slot.entry.exists = slot.found.is_some();
            mapping.entries.push(slot.entry.clone());
            added += 1;
        }

        if added > 0 {
            persist_mapping(dir, mapping, existing.is_none()).await;
        }

        slots
            .iter()
            .filter_map(|slot| {
                let candidate = &candidates[slot.found?];
                Some(Deliverable {
                    display_name: candidate.name.clone(),
                    opaque_id: slot.entry.id.clone(),
                    on_disk_path: candidate.path.clone(),
                    size_bytes: Some(candidate.size),
                    media_type: slot
                        .entry
                        .media_type
                        .clone()
                        .or_else(|| utils::media_type_for(&candidate.path)),
                })
            })
            .collect()
    }
}

/// Writes the mapping off the async workers; the caller still holds the job
/// lock, so writes for one job never overlap.
async fn persist_mapping(dir: &Path, mapping: FileIdMapping, is_first: bool) {
    let dir = dir.to_path_buf();
    let target = dir.clone();
    let written = tokio::task::spawn_blocking(move || {
        if is_first {
            mapping.create(&dir).map(|created| {
                if !created {
                    log::debug!("[RECONCILE] Mapping in {:?} was created concurrently", dir);
                }
            })
        } else {
            mapping.save(&dir)
        }
    })
    .await;
    // the mapping is advisory; a failed write only costs a rescan later
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("[RECONCILE] Could not write file mapping in {:?}: {}", target, e),
        Err(e) => log::warn!("[RECONCILE] Mapping write task for {:?} failed: {}", target, e),
    }
}

/// Mapping entries for everything `files.json` lists, keyed by position.
fn manifest_entries(manifest: &FilesManifest) -> Vec<MappingEntry> {
    manifest
        .files
        .iter()
        .enumerate()
        .filter_map(|(index, file)| {
            // only the final component: the manifest may record absolute or
            // staging-relative paths
            let name = Path::new(&file.path).file_name()?.to_str()?.to_string();
            let id = match utils::extension_of(Path::new(&name)) {
                Some(ext) => format!("track_{}.{}", index + 1, ext),
                None => format!("track_{}", index + 1),
            };
            Some(MappingEntry {
                id,
                path: name.clone(),
                alternate_path: Some(name),
                media_type: file.media_type.clone(),
                from_manifest: true,
                exists: false,
            })
        })
        .collect()
}

/// Matches slots to unclaimed candidates: exact names for every slot first,
/// then same-extension substitutes for manifest-derived slots still
/// unmatched.
fn match_slots(slots: &mut [Slot], candidates: &[DirEntryInfo], claimed: &mut [bool]) {
    for slot in slots.iter_mut().filter(|s| s.found.is_none()) {
        for name in slot.entry.names() {
            let hit = candidates
                .iter()
                .enumerate()
                .position(|(i, c)| !claimed[i] && c.name == name);
            if let Some(index) = hit {
                claimed[index] = true;
                slot.found = Some(index);
                break;
            }
        }
    }

    for slot in slots.iter_mut().filter(|s| s.found.is_none() && s.entry.from_manifest) {
        let Some(ext) = slot.entry.names().find_map(|name| utils::extension_of(Path::new(name))) else {
            continue;
        };
        let hit = candidates
            .iter()
            .enumerate()
            .position(|(i, c)| !claimed[i] && utils::extension_of(&c.path).as_deref() == Some(ext.as_str()));
        if let Some(index) = hit {
            log::debug!(
                "[RECONCILE] {} not found, using {} instead",
                slot.entry.path,
                candidates[index].name
            );
            claimed[index] = true;
            slot.found = Some(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use crate::store::{FILES_MANIFEST, FILE_MAPPING};

    async fn setup() -> (tempfile::TempDir, Arc<JobStore>, StatusReconciler, String, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(root.path()));
        let job = store.create_job(SourceKind::Deezer, "https://www.deezer.com/album/1").await.unwrap();
        let reconciler = StatusReconciler::new(store.clone());
        (root, store, reconciler, job.job_id, job.directory_path)
    }

    fn ids(status: &Status) -> Vec<&str> {
        status.files.iter().map(|f| f.opaque_id.as_str()).collect()
    }

    #[tokio::test]
    async fn started_marker_alone_is_in_progress() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join("song.mp3.part"), b"half").unwrap();
        std::fs::create_dir(dir.join(".staging")).unwrap();
        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::InProgress);
        assert!(!dir.join(FILE_MAPPING).exists());
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let (_root, _store, reconciler, _job_id, _dir) = setup().await;
        assert_eq!(reconciler.reconcile("1").await.unwrap().state, JobState::NotFound);
        assert_eq!(reconciler.reconcile("../etc").await.unwrap().state, JobState::NotFound);
    }

    #[tokio::test]
    async fn error_marker_wins_over_files() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join("a.mp3"), b"a").unwrap();
        std::fs::write(dir.join("spotify_conversion_error.txt"), "Could not convert\nmore").unwrap();
        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.message.as_deref(), Some("Could not convert"));
    }

    #[tokio::test]
    async fn blank_error_marker_uses_fallback_message() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join("error.txt"), b"\n\n").unwrap();
        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.message.as_deref(), Some(ERROR_FALLBACK_MESSAGE));
    }

    #[tokio::test]
    async fn completion_marker_with_no_files_is_complete_and_empty() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join(COMPLETE_MARKER), b"Download completed successfully\n").unwrap();
        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Complete);
        assert!(status.files.is_empty());
    }

    #[tokio::test]
    async fn manifest_gives_positional_ids_and_substitutes() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(
            dir.join(FILES_MANIFEST),
            r#"{"files":[{"path":"/tmp/x/01 Intro.mp3","type":"audio/mp3"},{"path":"02 Outro.flac"}]}"#,
        )
        .unwrap();
        // the adapter renamed the first track after writing the manifest
        std::fs::write(dir.join("Artist - Intro.mp3"), b"aaaa").unwrap();
        std::fs::write(dir.join("02 Outro.flac"), b"bb").unwrap();

        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Complete);
        assert_eq!(ids(&status), vec!["track_1.mp3", "track_2.flac"]);
        assert_eq!(status.files[0].on_disk_path, dir.join("Artist - Intro.mp3"));
        assert_eq!(status.files[0].media_type.as_deref(), Some("audio/mp3"));
        assert_eq!(status.files[1].size_bytes, Some(2));

        let mapping = FileIdMapping::load(&dir).await.unwrap();
        let first = mapping.get("track_1.mp3").unwrap();
        assert_eq!(first.path, "Artist - Intro.mp3");
        assert_eq!(first.alternate_path.as_deref(), Some("01 Intro.mp3"));
        assert!(first.exists);
    }

    #[tokio::test]
    async fn repeated_polls_are_stable_and_only_append() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join("b.mp3"), b"b").unwrap();

        let first = reconciler.reconcile(&job_id).await.unwrap();
        let second = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["b.mp3"]);

        std::fs::write(dir.join("a.mp3"), b"a").unwrap();
        let third = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(ids(&third), vec!["b.mp3", "a.mp3"]);

        let mapping = FileIdMapping::load(&dir).await.unwrap();
        assert_eq!(mapping.entries.len(), 2);
    }

    #[tokio::test]
    async fn manifest_matching_nothing_falls_back_to_listing() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join(FILES_MANIFEST), r#"{"files":[{"path":"gone.flac"}]}"#).unwrap();
        std::fs::write(dir.join("video-1.mp4"), b"v").unwrap();
        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(ids(&status), vec!["video-1.mp4"]);
    }

    #[tokio::test]
    async fn fragment_pieces_keep_job_in_progress() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        let video = format!("video-{}.mp4", job_id);
        std::fs::write(dir.join(format!("{}.part", video)), b"half").unwrap();
        std::fs::write(dir.join(format!("{}.ytdl", video)), b"{}").unwrap();
        std::fs::write(dir.join(format!("{}.part-Frag3", video)), b"frag").unwrap();

        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::InProgress);
        assert!(!dir.join(FILE_MAPPING).exists());
    }

    #[tokio::test]
    async fn malformed_manifest_falls_back_to_listing() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join(FILES_MANIFEST), b"{not json").unwrap();
        std::fs::write(dir.join("Artist - Song.mp3"), b"a").unwrap();

        let status = reconciler.reconcile(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Complete);
        assert_eq!(ids(&status), vec!["Artist - Song.mp3"]);
        let mapping = FileIdMapping::load(&dir).await.unwrap();
        assert!(mapping.entries.iter().all(|e| !e.from_manifest));
    }

    #[tokio::test]
    async fn concurrent_polls_agree() {
        let (_root, _store, reconciler, job_id, dir) = setup().await;
        std::fs::write(dir.join("one.mp3"), b"1").unwrap();
        std::fs::write(dir.join("two.mp3"), b"2").unwrap();
        let reconciler = Arc::new(reconciler);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = reconciler.clone();
                let job_id = job_id.clone();
                tokio::spawn(async move { reconciler.reconcile(&job_id).await.unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(ids(&results[0]), vec!["one.mp3", "two.mp3"]);
    }
}
