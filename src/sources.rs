//! URL classification: which downloader adapter handles a submitted URL.
//!
//! Classification is a pure host match against the configured host lists; it
//! never touches the network. Short links are recognised here and resolved by
//! the adapter that owns them.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use crate::config::SourcesConfig;
use crate::errors::{AppError, Result};
use crate::security::InputValidator;

const DEEZER_SHORT_HOSTS: &[&str] = &["dzr.page.link", "deezer.page.link"];
const SPOTIFY_SHORT_HOSTS: &[&str] = &["spotify.link"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Video,
    Deezer,
    Spotify,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Video => "video",
            SourceKind::Deezer => "deezer",
            SourceKind::Spotify => "spotify",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
    !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

pub struct SourceClassifier {
    config: SourcesConfig,
    validator: InputValidator,
}

impl SourceClassifier {
    pub fn new(config: SourcesConfig) -> Self {
        Self {
            config,
            validator: InputValidator::new(),
        }
    }

    /// Validates `url` and returns the source kind it belongs to.
    ///
    /// Malformed input fails with `InvalidUrl`; a well-formed URL whose host
    /// is not in any list fails with `UnsupportedSource`.
    pub fn classify(&self, url: &str) -> Result<SourceKind> {
        let parsed = self.validator.validate_url(url)?;
        let host = host_of(&parsed);

        let matches = |list: &[String]| list.iter().any(|domain| host_matches(&host, domain));

        // streaming services first: their short-link hosts are more specific
        // than anything in the video list
        if matches(&self.config.spotify_hosts) {
            Ok(SourceKind::Spotify)
        } else if matches(&self.config.deezer_hosts) {
            Ok(SourceKind::Deezer)
        } else if matches(&self.config.video_hosts) {
            Ok(SourceKind::Video)
        } else {
            Err(AppError::UnsupportedSource(format!(
                "{} is not a supported video or music-streaming site",
                host
            )))
        }
    }
}

pub fn is_deezer_short_link(url: &Url) -> bool {
    let host = host_of(url);
    DEEZER_SHORT_HOSTS.iter().any(|domain| host_matches(&host, domain))
}

pub fn is_spotify_short_link(url: &Url) -> bool {
    let host = host_of(url);
    SPOTIFY_SHORT_HOSTS.iter().any(|domain| host_matches(&host, domain))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyUrlType {
    Track,
    Album,
    Playlist,
}

impl SpotifyUrlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotifyUrlType::Track => "track",
            SpotifyUrlType::Album => "album",
            SpotifyUrlType::Playlist => "playlist",
        }
    }
}

/// Parses Spotify URLs like:
/// https://open.spotify.com/track/4iV5W9uYEdYUVa79Axb7Rh
/// https://open.spotify.com/intl-de/album/1A2GTWGtFfWp7KSQTwWOyo?si=abc
pub fn parse_spotify_url(url: &Url) -> Result<(SpotifyUrlType, String)> {
    let mut segments = url
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|segment| !segment.is_empty() && !segment.starts_with("intl-"));

    let url_type = match segments.next() {
        Some("track") => SpotifyUrlType::Track,
        Some("album") => SpotifyUrlType::Album,
        Some("playlist") => SpotifyUrlType::Playlist,
        _ => {
            return Err(AppError::Download(format!(
                "Could not extract type and ID from Spotify URL: {}",
                url
            )))
        }
    };

    match segments.next() {
        Some(id) if id.chars().all(|c| c.is_ascii_alphanumeric()) => Ok((url_type, id.to_string())),
        _ => Err(AppError::Download(format!(
            "Could not extract type and ID from Spotify URL: {}",
            url
        ))),
    }
}
