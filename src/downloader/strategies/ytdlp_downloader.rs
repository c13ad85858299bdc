use std::sync::Arc;
use tokio::process::Command;
use async_trait::async_trait;
use crate::config::AppConfig;
use crate::downloader::Downloader;
use crate::errors::{AppError, Result};
use crate::store::Job;
use crate::utils::run_logged;

/// Video-site adapter backed by the yt-dlp CLI. Output lands directly in the
/// job directory as `video-<job_id>.<ext>`.
pub struct YtDlpDownloader {
    name: String,
    config: Arc<AppConfig>,
}

impl YtDlpDownloader {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            name: "yt-dlp".to_string(),
            config,
        }
    }

    fn build_command(&self, job: &Job) -> Command {
        let template = job.directory_path.join(format!("video-{}.%(ext)s", job.job_id));

        let mut cmd = Command::new(&self.config.tools.ytdlp_path);
        cmd.args([
            "--no-playlist",
            "--newline",
            "--no-color",
            "--merge-output-format", "mp4",
            "--retries", "3",
            "--output",
        ]);
        cmd.arg(&template);

        if let Some(ffmpeg) = &self.config.tools.ffmpeg_location {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }
        if let Some(proxy) = &self.config.proxy {
            cmd.args(["--proxy", proxy.as_str()]);
        }

        // end of options: a URL can never be mistaken for a flag
        cmd.arg("--").arg(&job.url);
        cmd
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn download(&self, job: &Job) -> Result<()> {
        let cmd = self.build_command(job);
        log::info!("[YTDLP] Running yt-dlp command: {:?}", cmd.as_std());

        let output = run_logged(cmd, None, "YTDLP").await?;
        if !output.success {
            return Err(AppError::Download(format!("yt-dlp failed: {}", output.failure_summary())));
        }

        log::info!("[YTDLP] Finished job {}", job.job_id);
        Ok(())
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}
