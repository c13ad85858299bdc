//! Media download server: accepts a URL, runs the matching external
//! downloader in the background and reports job state by inspecting the
//! job's directory.

pub mod api;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod reconciler;
pub mod resolver;
pub mod security;
pub mod sources;
pub mod store;
pub mod utils;

pub use errors::{AppError, Result};
