pub mod cache;
pub mod http_pool;
pub mod manager;
pub mod strategies;

use std::sync::Arc;
use crate::errors::Result;
use crate::store::{self, Job, COMPLETE_MARKER, ERROR_MARKER};

/// One external download mechanism.
///
/// An adapter is handed a job whose directory already exists and is expected
/// to fill that directory with media files. It reports failure by returning
/// an error; [`run_job`] turns that into the on-disk error marker, which is
/// the only way a status poll ever learns about it.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, job: &Job) -> Result<()>;

    /// Fails with `Unconfigured` when credentials this adapter needs are
    /// missing. Checked before a job directory is created.
    fn check_configured(&self) -> Result<()> {
        Ok(())
    }

    fn get_name(&self) -> &str;
}

/// Runs `downloader` for `job` to completion and records the outcome in the
/// job directory. Never returns an error: there is nobody waiting for one.
pub async fn run_job(downloader: Arc<dyn Downloader>, job: Job) {
    let start_time = std::time::Instant::now();
    log::info!("[JOB {}] Started {} download: {}", job.job_id, downloader.get_name(), job.url);

    // run the adapter in its own task so a panic inside it is observed here
    // instead of silently killing the job
    let adapter = downloader.clone();
    let adapter_job = job.clone();
    let outcome = tokio::spawn(async move { adapter.download(&adapter_job).await }).await;

    let duration = start_time.elapsed();
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_error) => Some(format!("Download failed: {} adapter terminated abnormally ({})", downloader.get_name(), join_error)),
    };

    let written = match &failure {
        None => {
            log::info!("[JOB {}] Completed in {:.2} seconds", job.job_id, duration.as_secs_f64());
            let contents = format!(
                "Download completed successfully\nURL: {}\nDownloaded using {}\n",
                job.url,
                downloader.get_name()
            );
            store::write_atomic(&job.directory_path, COMPLETE_MARKER, contents.as_bytes())
        }
        Some(message) => {
            log::error!("[JOB {}] Failed after {:.2} seconds: {}", job.job_id, duration.as_secs_f64(), message);
            let first_line = message.lines().next().unwrap_or("Download failed");
            let contents = format!("{}\nURL: {}\n{}\n", first_line, job.url, message);
            store::write_atomic(&job.directory_path, ERROR_MARKER, contents.as_bytes())
        }
    };

    if let Err(e) = written {
        log::error!("[JOB {}] Could not record job outcome in {:?}: {}", job.job_id, job.directory_path, e);
    }
}
