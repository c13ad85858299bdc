use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use crate::errors::{AppError, Result};
use log::info;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "mov", "avi", "flv"];

/// Collected output of an external tool run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ToolOutput {
    /// Last non-empty stderr line, falling back to stdout. Downloader tools put
    /// the actual reason for a failure at the end of their output.
    pub fn failure_summary(&self) -> String {
        self.stderr
            .iter()
            .chain(self.stdout.iter())
            .rev()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
            .map(|line| line.to_string())
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Runs an external tool to completion, optionally feeding `stdin_data`,
/// logging every output line under `tag`.
pub async fn run_logged(mut cmd: Command, stdin_data: Option<&str>, tag: &str) -> Result<ToolOutput> {
    cmd.stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()
        .map_err(|e| AppError::Download(format!("Failed to start {}: {}", tag, e)))?;

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
        stdin.write_all(data.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        // closing stdin lets tools that prompt for input continue
        drop(stdin);
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) = tokio::join!(
        collect_lines(stdout, tag, false),
        collect_lines(stderr, tag, true),
        child.wait(),
    );
    let status = status?;

    Ok(ToolOutput {
        success: status.success(),
        code: status.code(),
        stdout,
        stderr,
    })
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>, tag: &str, is_stderr: bool) -> Vec<String> {
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return collected;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            log::warn!("[{}] {}", tag, line);
        } else {
            log::info!("[{}] {}", tag, line);
        }
        collected.push(line);
    }
    collected
}

/// Sanitizes a filename by removing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Lowercased extension of `path`, if it has one.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_audio_file(path: &Path) -> bool {
    extension_of(path).map_or(false, |ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_media_file(path: &Path) -> bool {
    extension_of(path).map_or(false, |ext| {
        AUDIO_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str())
    })
}

/// Best-effort MIME type from the file extension.
pub fn media_type_for(path: &Path) -> Option<String> {
    let ext = extension_of(path)?;
    let mime = match ext.as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "flv" => "video/x-flv",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("AC/DC: \"Back\" in Black?"), "AC_DC_ _Back_ in Black_");
        assert_eq!(sanitize_filename("line\nbreak"), "line_break");
    }

    #[test]
    fn media_detection_is_case_insensitive() {
        assert!(is_audio_file(&PathBuf::from("Artist - Title.FLAC")));
        assert!(is_media_file(&PathBuf::from("video-1.mp4")));
        assert!(!is_audio_file(&PathBuf::from("video-1.mp4")));
        assert!(!is_media_file(&PathBuf::from("files.json")));
        assert_eq!(media_type_for(&PathBuf::from("a.MP3")).as_deref(), Some("audio/mpeg"));
        assert_eq!(media_type_for(&PathBuf::from("a.bin")), None);
    }

    #[test]
    fn failure_summary_prefers_last_stderr_line() {
        let output = ToolOutput {
            success: false,
            code: Some(1),
            stdout: vec!["[download] 10%".to_string()],
            stderr: vec!["WARNING: retrying".to_string(), "ERROR: network timeout".to_string(), "".to_string()],
        };
        assert_eq!(output.failure_summary(), "ERROR: network timeout");

        let silent = ToolOutput { success: false, code: Some(2), ..Default::default() };
        assert_eq!(silent.failure_summary(), "exited with status 2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_logged_feeds_stdin_and_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "read secret; echo got-$secret; echo oops >&2; exit 3"]);
        let output = run_logged(cmd, Some("token"), "TEST").await.unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, vec!["got-token".to_string()]);
        assert_eq!(output.failure_summary(), "oops");
    }
}
