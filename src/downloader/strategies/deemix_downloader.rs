use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use url::Url;
use crate::config::AppConfig;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::Downloader;
use crate::errors::{AppError, Result};
use crate::reconciler::manifest::FilesManifest;
use crate::sources::is_deezer_short_link;
use crate::store::{Job, STAGING_DIR};
use crate::utils::{self, run_logged};

/// Deezer adapter backed by the deemix CLI.
///
/// deemix writes into its own folder structure, so it is pointed at a hidden
/// staging directory inside the job directory. Once it exits, audio files
/// are described in `files.json`, in the order deemix reported them, and
/// moved up to the job directory.
pub struct DeemixDownloader {
    name: String,
    config: Arc<AppConfig>,
    http: Arc<HttpPool>,
}

impl DeemixDownloader {
    pub fn new(config: Arc<AppConfig>, http: Arc<HttpPool>) -> Self {
        Self {
            name: "deemix".to_string(),
            config,
            http,
        }
    }

    fn arl(&self) -> Result<&str> {
        self.config.credentials.deezer_arl().ok_or_else(|| {
            AppError::Unconfigured(
                "Deezer downloads need an ARL token (credentials.deezer_arl)".to_string(),
            )
        })
    }

    fn build_command(&self, url: &str, staging: &Path) -> Command {
        let mut cmd = Command::new(&self.config.tools.deemix_path);
        cmd.arg("-b").arg(&self.config.tools.deemix_bitrate);
        cmd.arg("-p").arg(staging);
        cmd.arg(url);
        cmd
    }

    /// Downloads an already-resolved Deezer URL into `job`'s directory. Also
    /// the hand-off point for the Spotify adapter.
    pub async fn download_url(&self, url: &str, job: &Job) -> Result<()> {
        let arl = self.arl()?;
        let staging = job.directory_path.join(STAGING_DIR);
        utils::ensure_dir_exists(&staging).await?;

        let cmd = self.build_command(url, &staging);
        log::info!("[DEEMIX] Running deemix for {} into {:?}", url, staging);

        // the ARL goes over stdin so it never touches the disk or the
        // process list
        let output = run_logged(cmd, Some(arl), "DEEMIX").await?;

        let reported = completed_downloads(&output.stdout);
        let staged = order_by_report(find_audio_files(&staging).await?, &reported);
        log::info!(
            "[DEEMIX] Found {} audio files in staging, deemix reported {}",
            staged.len(),
            reported.len()
        );

        let moved = if output.success {
            publish(&staged, &job.directory_path).await
        } else {
            Ok(0)
        };
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            log::warn!("[DEEMIX] Could not remove staging directory {:?}: {}", staging, e);
        }

        if !output.success {
            return Err(AppError::Download(format!(
                "deemix CLI failed with return code {}: {}",
                output.code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                output.failure_summary()
            )));
        }
        if moved? == 0 {
            return Err(AppError::Download(
                "No audio files were found in the output directory".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_url(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{}: {}", url, e)))?;
        if is_deezer_short_link(&parsed) {
            return self.http.resolve_redirects(url).await.map_err(|e| {
                AppError::Download(format!("Error resolving Deezer short URL: {}", e))
            });
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Downloader for DeemixDownloader {
    async fn download(&self, job: &Job) -> Result<()> {
        let url = self.resolve_url(&job.url).await?;
        self.download_url(&url, job).await
    }

    fn check_configured(&self) -> Result<()> {
        self.arl().map(|_| ())
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

/// File names deemix reports as finished, e.g.
/// `[track_116914042_3] Completed download of /Artist - Title.mp3`.
fn completed_downloads(stdout: &[String]) -> Vec<String> {
    let Ok(pattern) = Regex::new(r"(?:Completed download of|Track already downloaded:?)\s+/?(.+?)\s*$") else {
        return Vec::new();
    };
    stdout
        .iter()
        .filter_map(|line| pattern.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Puts files deemix reported as finished first, in report order, so
/// positional ids follow the album's track order. Unreported files keep
/// their path order after them.
fn order_by_report(staged: Vec<PathBuf>, reported: &[String]) -> Vec<PathBuf> {
    let mut remaining = staged;
    let mut ordered = Vec::with_capacity(remaining.len());
    for name in reported {
        let Some(wanted) = Path::new(name).file_name() else {
            continue;
        };
        match remaining.iter().position(|p| p.file_name() == Some(wanted)) {
            Some(index) => ordered.push(remaining.remove(index)),
            None => log::warn!("[DEEMIX] Reported {} but it is not in staging", name),
        }
    }
    ordered.extend(remaining);
    ordered
}

/// Audio files anywhere below `root`, sorted by path so the manifest order is
/// deterministic.
async fn find_audio_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && utils::is_audio_file(&path) {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// A name for `file_name` that does not collide with anything already in
/// `dir` or already chosen in this batch.
fn unique_destination(dir: &Path, file_name: &str, taken: &[String]) -> String {
    let path = Path::new(file_name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("track");
    let ext = path.extension().and_then(|e| e.to_str());

    let mut candidate = file_name.to_string();
    let mut n = 1;
    while dir.join(&candidate).exists() || taken.contains(&candidate) {
        n += 1;
        candidate = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
    }
    candidate
}

/// Writes the manifest for `staged`, then moves each file into `job_dir` in
/// manifest order. Returns how many files were published.
async fn publish(staged: &[PathBuf], job_dir: &Path) -> Result<usize> {
    let mut plan: Vec<(PathBuf, String, u64)> = Vec::with_capacity(staged.len());
    let mut taken = Vec::new();
    for source in staged {
        let Some(file_name) = source.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let file_name = utils::sanitize_filename(file_name);
        let destination = unique_destination(job_dir, &file_name, &taken);
        let size = tokio::fs::metadata(source).await.map(|m| m.len()).unwrap_or(0);
        taken.push(destination.clone());
        plan.push((source.clone(), destination, size));
    }

    if plan.is_empty() {
        return Ok(0);
    }

    let described: Vec<(String, u64)> = plan.iter().map(|(_, name, size)| (name.clone(), *size)).collect();
    FilesManifest::describe(&described).write_to(job_dir)?;

    for (source, destination, _) in &plan {
        tokio::fs::rename(source, job_dir.join(destination)).await?;
        log::info!("[DEEMIX] Published {}", destination);
    }
    Ok(plan.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FILES_MANIFEST;

    fn downloader(arl: Option<&str>) -> DeemixDownloader {
        let mut config = AppConfig::default();
        config.credentials.deezer_arl = arl.map(str::to_string);
        let http = Arc::new(HttpPool::new(5, None).unwrap());
        DeemixDownloader::new(Arc::new(config), http)
    }

    #[test]
    fn missing_arl_is_unconfigured() {
        assert!(matches!(downloader(None).check_configured(), Err(AppError::Unconfigured(_))));
        assert!(downloader(Some("arl-token")).check_configured().is_ok());
    }

    #[test]
    fn command_points_at_staging() {
        let d = downloader(Some("arl"));
        let cmd = d.build_command("https://www.deezer.com/track/3135556", Path::new("/jobs/1/.staging"));
        let args: Vec<String> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["-b", "320", "-p", "/jobs/1/.staging", "https://www.deezer.com/track/3135556"]);
    }

    #[test]
    fn parses_completed_lines() {
        let stdout = vec![
            "[track_116914042_3] Downloading: Artist - Title".to_string(),
            "[track_116914042_3] Completed download of /Artist - Title.mp3".to_string(),
            "Track already downloaded: Other - Song.flac".to_string(),
        ];
        assert_eq!(
            completed_downloads(&stdout),
            vec!["Artist - Title.mp3".to_string(), "Other - Song.flac".to_string()]
        );
    }

    #[test]
    fn reported_files_lead_in_report_order() {
        let staged = vec![
            PathBuf::from("/s/Artist/A - Outro.mp3"),
            PathBuf::from("/s/Artist/B - Intro.mp3"),
            PathBuf::from("/s/Artist/C - Bonus.mp3"),
        ];
        let reported = vec![
            "B - Intro.mp3".to_string(),
            "Missing.mp3".to_string(),
            "A - Outro.mp3".to_string(),
        ];
        assert_eq!(
            order_by_report(staged, &reported),
            vec![
                PathBuf::from("/s/Artist/B - Intro.mp3"),
                PathBuf::from("/s/Artist/A - Outro.mp3"),
                PathBuf::from("/s/Artist/C - Bonus.mp3"),
            ]
        );
    }

    #[tokio::test]
    async fn publish_flattens_staging_and_writes_manifest() {
        let job_dir = tempfile::tempdir().unwrap();
        let staging = job_dir.path().join(STAGING_DIR);
        std::fs::create_dir_all(staging.join("Artist").join("Album")).unwrap();
        std::fs::write(staging.join("Artist").join("Album").join("01 - Intro.mp3"), b"aaa").unwrap();
        std::fs::write(staging.join("Artist").join("Album").join("cover.jpg"), b"img").unwrap();
        std::fs::write(staging.join("Single.flac"), b"bbbb").unwrap();
        // collides with the nested one once flattened
        std::fs::write(job_dir.path().join("01 - Intro.mp3"), b"old").unwrap();

        let staged = find_audio_files(&staging).await.unwrap();
        assert_eq!(staged.len(), 2);

        let moved = publish(&staged, job_dir.path()).await.unwrap();
        assert_eq!(moved, 2);
        assert!(job_dir.path().join("01 - Intro (2).mp3").is_file());
        assert!(job_dir.path().join("Single.flac").is_file());

        let manifest = FilesManifest::load(job_dir.path()).await.unwrap();
        let names: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["01 - Intro (2).mp3", "Single.flac"]);
        assert_eq!(manifest.files[1].size, Some(4));
        assert!(job_dir.path().join(FILES_MANIFEST).is_file());
    }
}
