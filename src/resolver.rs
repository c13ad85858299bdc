use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use crate::errors::{AppError, Result};
use crate::reconciler::mapping::FileIdMapping;
use crate::security::InputValidator;
use crate::store::{self, DirEntryInfo, JobStore};
use crate::utils;

/// Turns a file reference from a download URL into an existing file.
///
/// The reference is usually an opaque id issued by the reconciler, but a
/// literal file name is accepted too. Candidates are tried in order and the
/// first that exists on disk wins:
///
/// 1. the mapping entry's recorded path
/// 2. the entry's alternate path
/// 3. the reference as a literal file name
/// 4. a file sharing the reference's extension, preferring one no other id
///    points at
/// 5. any audio or video file in the job directory
pub struct FileResolver {
    store: Arc<JobStore>,
    validator: InputValidator,
}

impl FileResolver {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            validator: InputValidator::new(),
        }
    }

    pub async fn resolve(&self, job_id: &str, reference: &str) -> Result<PathBuf> {
        // an id that could never have been issued names no job
        if self.validator.validate_job_id(job_id).is_err() {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        self.validator.validate_file_reference(reference)?;

        let Some(entries) = self.store.list(job_id).await? else {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        };
        let dir = self.store.job_dir(job_id);

        let candidates: Vec<&DirEntryInfo> = entries
            .iter()
            .filter(|e| e.is_file && !store::is_reserved_name(&e.name) && !store::is_transient_name(&e.name))
            .collect();
        let find = |name: &str| candidates.iter().find(|c| c.name == name).map(|c| c.path.clone());

        // files other ids currently point at; heuristic matches avoid them
        let mapping = FileIdMapping::load(&dir).await;
        let mut owned: HashSet<&str> = HashSet::new();
        if let Some(mapping) = &mapping {
            if let Some(entry) = mapping.get(reference) {
                for name in entry.names() {
                    if let Some(path) = find(name) {
                        return Ok(path);
                    }
                }
                log::debug!("[RESOLVE] Mapping for {}/{} is stale, searching directory", job_id, reference);
            }
            for entry in mapping.entries.iter().filter(|e| e.id != reference) {
                if let Some(name) = entry.names().find(|name| find(*name).is_some()) {
                    owned.insert(name);
                }
            }
        }

        if let Some(path) = find(reference) {
            return Ok(path);
        }

        if let Some(ext) = utils::extension_of(Path::new(reference)) {
            let same_ext = prefer_unowned(&candidates, &owned, |c| {
                utils::extension_of(&c.path).as_deref() == Some(ext.as_str())
            });
            if let Some(candidate) = same_ext {
                log::info!("[RESOLVE] {}/{} resolved by extension to {}", job_id, reference, candidate.name);
                return Ok(candidate.path.clone());
            }
        }

        if let Some(candidate) = prefer_unowned(&candidates, &owned, |c| utils::is_media_file(&c.path)) {
            log::info!("[RESOLVE] {}/{} resolved to first media file {}", job_id, reference, candidate.name);
            return Ok(candidate.path.clone());
        }

        Err(AppError::NotFound(format!("File {} not found for job {}", reference, job_id)))
    }
}

/// First candidate matching `pred`, preferring ones no other id owns.
fn prefer_unowned<'a>(
    candidates: &[&'a DirEntryInfo],
    owned: &HashSet<&str>,
    pred: impl Fn(&DirEntryInfo) -> bool,
) -> Option<&'a DirEntryInfo> {
    let mut matching = candidates.iter().copied().filter(|c| pred(*c));
    let first = matching.next()?;
    if !owned.contains(first.name.as_str()) {
        return Some(first);
    }
    matching.find(|c| !owned.contains(c.name.as_str())).or(Some(first))
}
