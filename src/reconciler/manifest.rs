//! `files.json`: the optional list of outputs an adapter writes once it knows
//! what it produced.

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::errors::Result;
use crate::store::{self, FILES_MANIFEST};
use crate::utils;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
    #[serde(default = "default_readable")]
    pub readable: bool,
}

fn default_readable() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesManifest {
    pub files: Vec<ManifestEntry>,
}

impl FilesManifest {
    /// Reads and parses the manifest in `dir`. Missing or malformed manifests
    /// both yield `None`; callers fall back to listing the directory.
    pub async fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(FILES_MANIFEST);
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<FilesManifest>(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("[RECONCILE] Ignoring malformed {:?}: {}", path, e);
                None
            }
        }
    }

    /// Describes `files` as they currently are on disk.
    pub fn describe(files: &[(String, u64)]) -> Self {
        let files = files
            .iter()
            .map(|(name, size)| ManifestEntry {
                path: name.clone(),
                size: Some(*size),
                media_type: utils::media_type_for(Path::new(name)),
                readable: true,
            })
            .collect();
        Self { files }
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        store::write_atomic(dir, FILES_MANIFEST, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_manifest_written_by_other_tools() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(FILES_MANIFEST),
            r#"{"files": [{"path": "Artist - Title.mp3", "size": 4096, "type": "audio/mp3", "readable": true},
                          {"path": "Other.flac"}]}"#,
        )
        .unwrap();

        let manifest = FilesManifest::load(dir.path()).await.unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].media_type.as_deref(), Some("audio/mp3"));
        assert_eq!(manifest.files[1].size, None);
        assert!(manifest.files[1].readable);
    }

    #[tokio::test]
    async fn malformed_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILES_MANIFEST), b"{\"files\": [").unwrap();
        assert!(FilesManifest::load(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn describe_then_write() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = FilesManifest::describe(&[("a.flac".to_string(), 10)]);
        manifest.write_to(dir.path()).unwrap();
        let loaded = FilesManifest::load(dir.path()).await.unwrap();
        assert_eq!(loaded.files[0].media_type.as_deref(), Some("audio/flac"));
        assert_eq!(loaded, manifest);
    }
}
