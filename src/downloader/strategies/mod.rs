pub mod deemix_downloader;
pub mod spotify_downloader;
pub mod ytdlp_downloader;

// Re-export downloaders for easy access
pub use deemix_downloader::DeemixDownloader;
pub use spotify_downloader::SpotifyDownloader;
pub use ytdlp_downloader::YtDlpDownloader;
