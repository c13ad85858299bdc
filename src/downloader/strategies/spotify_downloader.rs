use std::sync::Arc;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;
use crate::config::AppConfig;
use crate::downloader::cache::ResponseCache;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::strategies::DeemixDownloader;
use crate::downloader::Downloader;
use crate::errors::{AppError, Result};
use crate::sources::{is_spotify_short_link, parse_spotify_url, SpotifyUrlType};
use crate::store::Job;

const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SPOTIFY_API: &str = "https://api.spotify.com/v1";
const DEEZER_API: &str = "https://api.deezer.com";
const TOKEN_CACHE_KEY: &str = "spotify:token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Spotify adapter: finds the same track or album on Deezer and downloads
/// that through the Deezer adapter.
pub struct SpotifyDownloader {
    name: String,
    config: Arc<AppConfig>,
    http: Arc<HttpPool>,
    cache: Arc<ResponseCache>,
    deemix: Arc<DeemixDownloader>,
}

impl SpotifyDownloader {
    pub fn new(
        config: Arc<AppConfig>,
        http: Arc<HttpPool>,
        cache: Arc<ResponseCache>,
        deemix: Arc<DeemixDownloader>,
    ) -> Self {
        Self {
            name: "spotify".to_string(),
            config,
            http,
            cache,
            deemix,
        }
    }

    fn client_credentials(&self) -> Result<(&str, &str)> {
        self.config.credentials.spotify_client().ok_or_else(|| {
            AppError::Unconfigured(
                "Spotify downloads need credentials.spotify_client_id and credentials.spotify_client_secret"
                    .to_string(),
            )
        })
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cache.get(TOKEN_CACHE_KEY).await {
            return Ok(token);
        }

        let (client_id, client_secret) = self.client_credentials()?;
        log::info!("[SPOTIFY] Requesting client-credentials token");
        let response = self
            .http
            .get_client()
            .post(SPOTIFY_TOKEN_URL)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Download(format!(
                "Spotify token request failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        // refresh a minute early
        let ttl = token.expires_in.saturating_sub(60).max(1);
        self.cache
            .set_with_ttl(TOKEN_CACHE_KEY.to_string(), token.access_token.clone(), ttl)
            .await;
        Ok(token.access_token)
    }

    async fn resolve_url(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url).map_err(|e| AppError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !is_spotify_short_link(&parsed) {
            return Ok(parsed);
        }

        let resolved = self.http.resolve_redirects(url).await.map_err(|e| {
            AppError::Download(format!("Error resolving Spotify short URL: {}", e))
        })?;
        Url::parse(&resolved).map_err(|e| AppError::Download(format!("Error resolving Spotify short URL: {}", e)))
    }

    /// Maps a Spotify URL onto the equivalent Deezer URL.
    async fn find_deezer_url(&self, spotify_url: &str) -> Result<String> {
        let url = self.resolve_url(spotify_url).await?;
        let (url_type, id) = parse_spotify_url(&url)?;

        let cache_key = format!("deezer:{}:{}", url_type.as_str(), id);
        if let Some(cached) = self.cache.get(&cache_key).await {
            log::info!("[SPOTIFY] Using cached conversion for {}: {}", spotify_url, cached);
            return Ok(cached);
        }

        let found = match url_type {
            SpotifyUrlType::Track => self.find_track(&id).await?,
            SpotifyUrlType::Album => self.find_album(&id).await?,
            // no Deezer counterpart for user playlists
            SpotifyUrlType::Playlist => None,
        };

        let Some(deezer_url) = found else {
            return Err(AppError::Download(format!(
                "Could not find equivalent Deezer content for Spotify URL: {}",
                spotify_url
            )));
        };

        log::info!("[SPOTIFY] {} -> {}", spotify_url, deezer_url);
        self.cache.set(cache_key, deezer_url.clone()).await;
        Ok(deezer_url)
    }

    async fn find_track(&self, id: &str) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let track = self
            .http
            .get_json(&format!("{}/tracks/{}", SPOTIFY_API, id), Some(&token))
            .await?;

        if let Some(isrc) = track.pointer("/external_ids/isrc").and_then(Value::as_str) {
            let by_isrc = self.deezer_lookup(&format!("{}/track/isrc:{}", DEEZER_API, isrc)).await;
            if let Some(deezer_id) = by_isrc.as_ref().and_then(deezer_id) {
                return Ok(Some(format!("https://www.deezer.com/track/{}", deezer_id)));
            }
        }

        let Some(query) = search_query(&track) else {
            return Ok(None);
        };
        let results = self.deezer_search("search", &query).await?;
        Ok(first_result_id(&results).map(|id| format!("https://www.deezer.com/track/{}", id)))
    }

    async fn find_album(&self, id: &str) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let album = self
            .http
            .get_json(&format!("{}/albums/{}", SPOTIFY_API, id), Some(&token))
            .await?;

        if let Some(upc) = album.pointer("/external_ids/upc").and_then(Value::as_str) {
            let by_upc = self.deezer_lookup(&format!("{}/album/upc:{}", DEEZER_API, upc)).await;
            if let Some(deezer_id) = by_upc.as_ref().and_then(deezer_id) {
                return Ok(Some(format!("https://www.deezer.com/album/{}", deezer_id)));
            }
        }

        let Some(query) = search_query(&album) else {
            return Ok(None);
        };
        let results = self.deezer_search("search/album", &query).await?;
        Ok(first_result_id(&results).map(|id| format!("https://www.deezer.com/album/{}", id)))
    }

    /// Direct Deezer lookups answer unknown ids with an `error` object rather
    /// than a status code, so any failure here just means "no match".
    async fn deezer_lookup(&self, url: &str) -> Option<Value> {
        match self.http.get_json(url, None).await {
            Ok(value) if value.get("error").is_none() => Some(value),
            Ok(_) => None,
            Err(e) => {
                log::warn!("[SPOTIFY] Deezer lookup {} failed: {}", url, e);
                None
            }
        }
    }

    async fn deezer_search(&self, endpoint: &str, query: &str) -> Result<Value> {
        let url = Url::parse_with_params(&format!("{}/{}", DEEZER_API, endpoint), &[("q", query)])
            .map_err(|e| AppError::Download(format!("Invalid Deezer search URL: {}", e)))?;
        self.http.get_json(url.as_str(), None).await
    }
}

#[async_trait]
impl Downloader for SpotifyDownloader {
    async fn download(&self, job: &Job) -> Result<()> {
        let deezer_url = self.find_deezer_url(&job.url).await?;
        self.deemix.download_url(&deezer_url, job).await
    }

    fn check_configured(&self) -> Result<()> {
        self.deemix.check_configured()?;
        self.client_credentials().map(|_| ())
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

fn deezer_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn first_result_id(results: &Value) -> Option<String> {
    results.get("data")?.as_array()?.first().and_then(deezer_id)
}

/// `"<first artist> <name>"` from a Spotify track or album object.
fn search_query(item: &Value) -> Option<String> {
    let name = item.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    match item.pointer("/artists/0/name").and_then(Value::as_str) {
        Some(artist) => Some(format!("{} {}", artist.trim(), name)),
        None => Some(name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn downloader(arl: Option<&str>, client: Option<(&str, &str)>) -> SpotifyDownloader {
        let mut config = AppConfig::default();
        config.credentials.deezer_arl = arl.map(str::to_string);
        if let Some((id, secret)) = client {
            config.credentials.spotify_client_id = Some(id.to_string());
            config.credentials.spotify_client_secret = Some(secret.to_string());
        }
        let config = Arc::new(config);
        let http = Arc::new(HttpPool::new(5, None).unwrap());
        let cache = Arc::new(ResponseCache::new(3600));
        let deemix = Arc::new(DeemixDownloader::new(config.clone(), http.clone()));
        SpotifyDownloader::new(config, http, cache, deemix)
    }

    #[test]
    fn needs_both_deezer_and_spotify_credentials() {
        assert!(matches!(
            downloader(None, Some(("id", "secret"))).check_configured(),
            Err(AppError::Unconfigured(_))
        ));
        assert!(matches!(
            downloader(Some("arl"), None).check_configured(),
            Err(AppError::Unconfigured(_))
        ));
        assert!(downloader(Some("arl"), Some(("id", "secret"))).check_configured().is_ok());
    }

    #[tokio::test]
    async fn playlists_have_no_deezer_equivalent() {
        let d = downloader(Some("arl"), Some(("id", "secret")));
        let url = "https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M";
        let err = d.find_deezer_url(url).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Download failed: Could not find equivalent Deezer content for Spotify URL: {}", url)
        );
    }

    #[tokio::test]
    async fn cached_conversion_skips_lookups() {
        let d = downloader(Some("arl"), Some(("id", "secret")));
        d.cache
            .set("deezer:track:4iV5W9uYEdYUVa79Axb7Rh".to_string(), "https://www.deezer.com/track/1".to_string())
            .await;
        let found = d
            .find_deezer_url("https://open.spotify.com/intl-de/track/4iV5W9uYEdYUVa79Axb7Rh?si=x")
            .await
            .unwrap();
        assert_eq!(found, "https://www.deezer.com/track/1");
    }

    #[test]
    fn builds_search_queries_and_reads_results() {
        let track = json!({"name": "Blinding Lights", "artists": [{"name": "The Weeknd"}]});
        assert_eq!(search_query(&track).as_deref(), Some("The Weeknd Blinding Lights"));
        assert_eq!(search_query(&json!({"name": "  "})), None);

        let results = json!({"data": [{"id": 908604612}, {"id": 1}]});
        assert_eq!(first_result_id(&results).as_deref(), Some("908604612"));
        assert_eq!(first_result_id(&json!({"data": []})), None);
    }
}
