use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::errors::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: String,
    pub downloads_dir: PathBuf,
    pub tools: ToolsConfig,
    pub sources: SourcesConfig,
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub http_timeout_secs: u64,
}

/// Locations and options for the external downloader tools.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    pub ytdlp_path: String,
    pub deemix_path: String,
    pub ffmpeg_location: Option<PathBuf>,
    pub deemix_bitrate: String,
}

/// Host suffixes the classifier matches against. A URL matches an entry when
/// its host equals it or is a subdomain of it.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    pub video_hosts: Vec<String>,
    pub deezer_hosts: Vec<String>,
    pub spotify_hosts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Credentials {
    pub deezer_arl: Option<String>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            downloads_dir: dirs::download_dir()
                .map(|dir| dir.join("stream-downloader"))
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            tools: ToolsConfig::default(),
            sources: SourcesConfig::default(),
            credentials: Credentials::default(),
            proxy: None,
            http_timeout_secs: 30,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            deemix_path: "deemix".to_string(),
            ffmpeg_location: None,
            deemix_bitrate: "320".to_string(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        let hosts = |list: &[&str]| list.iter().map(|h| h.to_string()).collect();
        Self {
            video_hosts: hosts(&[
                "youtube.com", "youtu.be", "youtube-nocookie.com", "vimeo.com",
                "dailymotion.com", "soundcloud.com",
            ]),
            deezer_hosts: hosts(&["deezer.com", "deezer.page.link", "dzr.page.link"]),
            spotify_hosts: hosts(&["spotify.com", "spotify.link"]),
        }
    }
}

impl Credentials {
    fn present(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn deezer_arl(&self) -> Option<&str> {
        Self::present(&self.deezer_arl)
    }

    pub fn spotify_client(&self) -> Option<(&str, &str)> {
        Some((
            Self::present(&self.spotify_client_id)?,
            Self::present(&self.spotify_client_secret)?,
        ))
    }
}

impl AppConfig {
    /// Loads defaults, then the config file (if any), then `STREAM_DL_*`
    /// environment variables, later sources winning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_config_path(),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = file {
            log::info!("Reading configuration from {:?}", file);
            builder = builder.add_source(config::File::from(file).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("STREAM_DL")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stream-downloader").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_credentials_count_as_missing() {
        let creds = Credentials {
            deezer_arl: Some("   ".to_string()),
            spotify_client_id: Some("id".to_string()),
            spotify_client_secret: None,
        };
        assert_eq!(creds.deezer_arl(), None);
        assert_eq!(creds.spotify_client(), None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"bind_address": "0.0.0.0:8080", "credentials": {"deezer_arl": "abc123"}}"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.credentials.deezer_arl(), Some("abc123"));
        assert_eq!(config.tools.ytdlp_path, "yt-dlp");
        assert!(config.sources.spotify_hosts.contains(&"spotify.link".to_string()));
    }
}
