use crate::errors::{AppError, Result};
use url::Url;
use std::path::{Component, Path};

pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Checks that `url` is a well-formed absolute http(s) URL with a host.
    pub fn validate_url(&self, url: &str) -> Result<Url> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::InvalidUrl("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::InvalidUrl(format!("{}: {}", url, e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::InvalidUrl(format!(
                "Unsupported scheme '{}', expected http or https",
                parsed_url.scheme()
            )));
        }

        if parsed_url.host_str().map_or(true, str::is_empty) {
            return Err(AppError::InvalidUrl("URL must have a host".to_string()));
        }

        Ok(parsed_url)
    }

    /// Job ids are generated by the launcher; anything else in that path
    /// segment is rejected before it gets joined onto the downloads root.
    pub fn validate_job_id(&self, job_id: &str) -> Result<()> {
        if job_id.is_empty() || job_id.len() > 64 {
            return Err(AppError::Validation("Invalid job id length".to_string()));
        }
        if !job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(AppError::Validation(format!("Invalid job id: {}", job_id)));
        }
        Ok(())
    }

    /// A file reference must name a single entry directly inside a job
    /// directory.
    pub fn validate_file_reference(&self, reference: &str) -> Result<()> {
        if reference.is_empty() {
            return Err(AppError::Validation("File reference cannot be empty".to_string()));
        }

        if reference.contains('\0') {
            return Err(AppError::Validation("Null bytes not allowed in file reference".to_string()));
        }

        if reference.contains('/') || reference.contains('\\') {
            return Err(AppError::Validation("Path separators not allowed in file reference".to_string()));
        }

        let path = Path::new(reference);
        let mut components = path.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(AppError::Validation("Path traversal detected".to_string())),
        }

        if reference.starts_with('.') {
            return Err(AppError::Validation("Hidden files cannot be requested".to_string()));
        }

        Ok(())
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        let v = InputValidator::new();
        assert!(v.validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(matches!(v.validate_url(""), Err(AppError::InvalidUrl(_))));
        assert!(matches!(v.validate_url("not a url"), Err(AppError::InvalidUrl(_))));
        assert!(matches!(v.validate_url("ftp://example.com/x"), Err(AppError::InvalidUrl(_))));
        assert!(matches!(v.validate_url("file:///etc/passwd"), Err(AppError::InvalidUrl(_))));
    }

    #[test]
    fn job_id_validation() {
        let v = InputValidator::new();
        assert!(v.validate_job_id("1718000000123").is_ok());
        assert!(v.validate_job_id("..").is_err());
        assert!(v.validate_job_id("12/34").is_err());
        assert!(v.validate_job_id("").is_err());
    }

    #[test]
    fn file_reference_validation() {
        let v = InputValidator::new();
        assert!(v.validate_file_reference("track_1.mp3").is_ok());
        assert!(v.validate_file_reference("Artist - Title (Live).flac").is_ok());
        assert!(v.validate_file_reference("..").is_err());
        assert!(v.validate_file_reference("../secret").is_err());
        assert!(v.validate_file_reference("sub/file.mp3").is_err());
        assert!(v.validate_file_reference(".hidden").is_err());
        assert!(v.validate_file_reference("").is_err());
    }
}
