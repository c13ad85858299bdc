//! `file_mapping.json`: opaque file ids handed to clients, and the file each
//! one pointed at when it was issued.
//!
//! The mapping is advisory. Paths are re-checked on every reconcile and every
//! file request, and entries are only ever appended, so an id keeps meaning
//! the same file for the life of the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::errors::Result;
use crate::store::{self, FILE_MAPPING};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub id: String,
    /// File name inside the job directory at the time the id was issued.
    pub path: String,
    /// Name recorded for this entry by the adapter, when it differs from
    /// `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Came from `files.json` rather than a raw directory listing. Only these
    /// entries may be matched to a same-extension substitute.
    #[serde(default)]
    pub from_manifest: bool,
    pub exists: bool,
}

impl MappingEntry {
    /// Candidate file names for this entry, primary first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.alternate_path.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIdMapping {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<MappingEntry>,
}

impl FileIdMapping {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub async fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(FILE_MAPPING);
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                log::warn!("[RECONCILE] Ignoring malformed {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&MappingEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Writes the mapping only if none exists yet. `false` means another
    /// writer created it first.
    pub fn create(&self, dir: &Path) -> Result<bool> {
        let content = serde_json::to_vec_pretty(self)?;
        store::write_new_atomic(dir, FILE_MAPPING, &content)
    }

    /// Replaces the mapping. Callers only use this to append entries to a
    /// mapping they loaded.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        store::write_atomic(dir, FILE_MAPPING, &content)
    }
}
