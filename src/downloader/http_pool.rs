use std::time::Duration;
use reqwest::{Client, ClientBuilder, Proxy};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Shared HTTP client for short-link resolution and the metadata APIs the
/// streaming adapters talk to.
pub struct HttpPool {
    client: Client,
}

impl HttpPool {
    pub fn new(timeout_seconds: u64, proxy_url: Option<&str>) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);

        let mut builder = ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy_url) = proxy_url {
            log::info!("[HTTP] Using proxy: {}", proxy_url);
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.http_timeout_secs, config.proxy.as_deref())
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    /// Follows redirects from a short link and returns the final URL.
    pub async fn resolve_redirects(&self, url: &str) -> Result<String> {
        log::info!("[HTTP] Resolving short URL: {}", url);
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() && !response.status().is_redirection() {
            return Err(AppError::Download(format!(
                "Failed to resolve short URL {}. Status code: {}",
                url,
                response.status()
            )));
        }

        let resolved = response.url().to_string();
        log::info!("[HTTP] Resolved to: {}", resolved);
        Ok(resolved)
    }

    /// GETs `url` and parses the body as JSON, with an optional bearer token.
    pub async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<serde_json::Value> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AppError::Download(format!(
                "Request to {} failed: {}",
                url,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}
