use std::collections::HashMap;
use std::sync::Arc;
use crate::config::{AppConfig, SourcesConfig};
use crate::downloader::cache::ResponseCache;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::strategies::{DeemixDownloader, SpotifyDownloader, YtDlpDownloader};
use crate::downloader::{run_job, Downloader};
use crate::errors::{AppError, Result};
use crate::sources::{SourceClassifier, SourceKind};
use crate::store::{Job, JobStore};

/// Converted URLs and API tokens are kept for an hour unless the token says
/// otherwise.
const CACHE_TTL_SECS: u64 = 3600;

/// Job launcher: picks the adapter for a URL, allocates the job directory and
/// starts the adapter in the background.
///
/// The manager keeps no reference to running jobs. Once launched, a job is
/// only observable through its directory.
pub struct DownloadManager {
    store: Arc<JobStore>,
    classifier: SourceClassifier,
    downloaders: HashMap<SourceKind, Arc<dyn Downloader>>,
}

impl DownloadManager {
    pub fn new(config: Arc<AppConfig>, store: Arc<JobStore>) -> Result<Self> {
        let http = Arc::new(HttpPool::from_config(&config)?);
        let cache = Arc::new(ResponseCache::new(CACHE_TTL_SECS));

        let deemix = Arc::new(DeemixDownloader::new(config.clone(), http.clone()));
        let spotify = SpotifyDownloader::new(config.clone(), http, cache, deemix.clone());
        let ytdlp = YtDlpDownloader::new(config.clone());

        let mut manager = Self::empty(store, config.sources.clone());
        manager.add_downloader(SourceKind::Video, Arc::new(ytdlp));
        manager.add_downloader(SourceKind::Deezer, deemix);
        manager.add_downloader(SourceKind::Spotify, Arc::new(spotify));
        Ok(manager)
    }

    /// A manager with no adapters registered.
    pub fn empty(store: Arc<JobStore>, sources: SourcesConfig) -> Self {
        Self {
            store,
            classifier: SourceClassifier::new(sources),
            downloaders: HashMap::new(),
        }
    }

    pub fn add_downloader(&mut self, kind: SourceKind, downloader: Arc<dyn Downloader>) {
        self.downloaders.insert(kind, downloader);
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn classify(&self, url: &str) -> Result<SourceKind> {
        self.classifier.classify(url)
    }

    /// Classifies `url` and launches a job for it.
    pub async fn submit(&self, url: &str) -> Result<Job> {
        let url = url.trim();
        let kind = self.classify(url)?;
        self.launch(kind, url).await
    }

    /// Creates the job and starts its adapter without waiting for it.
    ///
    /// Missing credentials are reported here, before the job directory
    /// exists, so an unconfigured source never leaves a job behind.
    pub async fn launch(&self, kind: SourceKind, url: &str) -> Result<Job> {
        let downloader = self
            .downloaders
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::UnsupportedSource(format!("No downloader registered for {} URLs", kind)))?;

        downloader.check_configured()?;

        let job = self.store.create_job(kind, url).await?;
        log::info!(
            "[LAUNCH] Job {} ({}) -> {:?} using {}",
            job.job_id,
            kind,
            job.directory_path,
            downloader.get_name()
        );

        tokio::spawn(run_job(downloader, job.clone()));
        Ok(job)
    }
}
