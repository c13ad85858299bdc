//! HTTP surface: submit a URL, poll a job, fetch its files.
//!
//! ```text
//! POST /download                        {"url": ...}  -> 202 {job_id, status_url}
//! GET  /download/status/{job_id}                      -> 200/404 {status, ...}
//! GET  /download/file/{job_id}/{file}                 -> file stream
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream;
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, ALLOW, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use crate::config::AppConfig;
use crate::downloader::manager::DownloadManager;
use crate::errors::{AppError, Result};
use crate::reconciler::{JobState, Status, StatusReconciler};
use crate::resolver::FileResolver;
use crate::store::JobStore;
use crate::utils;

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_REQUEST_BODY: usize = 64 * 1024;

pub struct AppState {
    pub manager: DownloadManager,
    pub reconciler: StatusReconciler,
    pub resolver: FileResolver,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>) -> Result<Self> {
        let store = Arc::new(JobStore::new(config.downloads_dir.clone()));
        let manager = DownloadManager::new(config, store)?;
        Ok(Self::with_manager(manager))
    }

    /// State around an already-built manager, sharing its job store.
    pub fn with_manager(manager: DownloadManager) -> Self {
        let store = manager.store().clone();
        Self {
            manager,
            reconciler: StatusReconciler::new(store.clone()),
            resolver: FileResolver::new(store),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
}

/// Serves until ctrl-c.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    log::info!("[HTTP] Listening on http://{}", addr);

    server
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("[HTTP] Could not listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            log::info!("[HTTP] Shutting down");
        })
        .await?;
    Ok(())
}

pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    log::debug!("[HTTP] {} {}", method, path);

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let response = match (segments.as_slice(), &method) {
        (["download"], &Method::POST) => submit(&state, req).await,
        (["download"], _) => Ok(method_not_allowed("POST")),
        (["download", "status", job_id], &Method::GET) => status(&state, job_id).await,
        (["download", "status", _], _) => Ok(method_not_allowed("GET")),
        (["download", "file", job_id, reference], &Method::GET) => file(&state, job_id, reference).await,
        (["download", "file", _, _], _) => Ok(method_not_allowed("GET")),
        _ => Ok(json_response(StatusCode::NOT_FOUND, json!({ "error": "Not found" }))),
    };

    Ok(response.unwrap_or_else(|e| error_response(&method, &path, &e)))
}

async fn submit(state: &AppState, req: Request<Body>) -> Result<Response<Body>> {
    let body = read_limited(req.into_body(), MAX_REQUEST_BODY).await?;

    let request: DownloadRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON body: {}", e)))?;
    let url = request
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| AppError::InvalidUrl("No URL provided".to_string()))?;

    let job = state.manager.submit(&url).await?;
    Ok(json_response(
        StatusCode::ACCEPTED,
        json!({
            "job_id": job.job_id,
            "status_url": format!("/download/status/{}", job.job_id),
        }),
    ))
}

/// Collects a request body, giving up as soon as it exceeds `limit` bytes.
async fn read_limited(mut body: Body, limit: usize) -> Result<Vec<u8>> {
    let too_large = || AppError::Validation("Request body too large".to_string());
    if body.size_hint().lower() > limit as u64 {
        return Err(too_large());
    }
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(too_large());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

async fn status(state: &AppState, job_id: &str) -> Result<Response<Body>> {
    let status = state.reconciler.reconcile(job_id).await?;
    let code = match status.state {
        JobState::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok(json_response(code, status_body(job_id, &status)))
}

fn status_body(job_id: &str, status: &Status) -> Value {
    let mut body = json!({ "status": status.state.as_str() });
    match status.state {
        JobState::Error => {
            body["message"] = json!(status.message.as_deref().unwrap_or("Download failed"));
        }
        JobState::Complete => {
            let files: Vec<Value> = status
                .files
                .iter()
                .map(|file| {
                    let mut entry = json!({
                        "name": file.display_name,
                        "url": format!("/download/file/{}/{}", job_id, urlencoding::encode(&file.opaque_id)),
                    });
                    if let Some(size) = file.size_bytes {
                        entry["size"] = json!(size);
                    }
                    if let Some(media_type) = &file.media_type {
                        entry["type"] = json!(media_type);
                    }
                    entry
                })
                .collect();
            body["files"] = Value::Array(files);
        }
        JobState::NotFound | JobState::InProgress => {}
    }
    body
}

async fn file(state: &AppState, job_id: &str, raw_reference: &str) -> Result<Response<Body>> {
    let reference = urlencoding::decode(raw_reference)
        .map_err(|_| AppError::Validation("File reference is not valid UTF-8".to_string()))?;
    let path = state.resolver.resolve(job_id, &reference).await?;

    let file = tokio::fs::File::open(&path).await?;
    let length = file.metadata().await?.len();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| reference.to_string());
    let content_type = utils::media_type_for(&path).unwrap_or_else(|| "application/octet-stream".to_string());
    log::info!("[HTTP] Serving {:?} ({} bytes) for job {}", path, length, job_id);

    let mut response = Response::new(Body::wrap_stream(chunks(file)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&file_name)) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn chunks(file: tokio::fs::File) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let ascii = match ascii.trim() {
        "" => "download.bin".to_string(),
        trimmed => trimmed.to_string(),
    };
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(file_name)
    )
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn method_not_allowed(allowed: &'static str) -> Response<Body> {
    let mut response = json_response(StatusCode::METHOD_NOT_ALLOWED, json!({ "error": "Method not allowed" }));
    response.headers_mut().insert(ALLOW, HeaderValue::from_static(allowed));
    response
}

fn error_response(method: &Method, path: &str, error: &AppError) -> Response<Body> {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        log::error!("[HTTP] {} {} failed: {}", method, path, error);
    } else {
        log::info!("[HTTP] {} {} -> {}: {}", method, path, status.as_u16(), error);
    }
    json_response(status, json!({ "error": error.client_message() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Deliverable;
    use std::path::PathBuf;

    #[test]
    fn disposition_has_ascii_and_utf8_names() {
        assert_eq!(
            content_disposition("Beyoncé - Halo.mp3"),
            "attachment; filename=\"Beyonc_ - Halo.mp3\"; filename*=UTF-8''Beyonc%C3%A9%20-%20Halo.mp3"
        );
        assert!(content_disposition("日本").contains("filename=\"__\""));
    }

    #[test]
    fn complete_status_links_files_by_opaque_id() {
        let status = Status::complete(vec![Deliverable {
            display_name: "A B.mp3".to_string(),
            opaque_id: "track_1.mp3".to_string(),
            on_disk_path: PathBuf::from("/x/A B.mp3"),
            size_bytes: Some(3),
            media_type: None,
        }]);
        let body = status_body("42", &status);
        assert_eq!(body["status"], "complete");
        assert_eq!(body["files"][0]["url"], "/download/file/42/track_1.mp3");
        assert_eq!(body["files"][0]["size"], 3);
        assert!(body["files"][0].get("type").is_none());
    }

    #[test]
    fn literal_ids_are_percent_encoded_in_urls() {
        let status = Status::complete(vec![Deliverable {
            display_name: "A B.mp3".to_string(),
            opaque_id: "A B.mp3".to_string(),
            on_disk_path: PathBuf::from("/x/A B.mp3"),
            size_bytes: None,
            media_type: Some("audio/mpeg".to_string()),
        }]);
        let body = status_body("42", &status);
        assert_eq!(body["files"][0]["url"], "/download/file/42/A%20B.mp3");
        assert_eq!(body["files"][0]["type"], "audio/mpeg");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let body = read_limited(Body::from(r#"{"url":"x"}"#), MAX_REQUEST_BODY).await.unwrap();
        assert_eq!(body, br#"{"url":"x"}"#.to_vec());

        let big = Body::from(vec![b' '; MAX_REQUEST_BODY + 1]);
        assert!(matches!(read_limited(big, MAX_REQUEST_BODY).await, Err(AppError::Validation(_))));

        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![Ok(vec![b' '; 10]), Ok(vec![b' '; 10])];
        let streamed = Body::wrap_stream(stream::iter(chunks));
        assert!(matches!(read_limited(streamed, 15).await, Err(AppError::Validation(_))));
    }

    #[test]
    fn error_status_carries_message() {
        let body = status_body("1", &Status::error("Download failed: boom".to_string()));
        assert_eq!(body, json!({"status": "error", "message": "Download failed: boom"}));
    }
}
