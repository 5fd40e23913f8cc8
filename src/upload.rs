//! 上传入口：校验请求、解析目标目录，并驱动流式上传会话。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Method, header};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::credentials::CredentialStore;
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::paths::{Credentials, PathPolicy, resolve_destination};
use crate::session::UploadSession;

#[derive(Debug)]
pub struct UploadConfig {
    /// Whole-request limit in bytes; 0 disables it.
    pub max_file_size: u64,
    pub overwrite: bool,
    pub auto_create_dirs: bool,
    pub tmp_suffix: String,
    /// Age after which orphaned temp files are swept; zero disables the sweep.
    pub temp_ttl: Duration,
}

/// 准备上传会话：校验方法、身份与目标目录，读取请求体大小提示。
pub async fn prepare(
    method: &Method,
    headers: &HeaderMap,
    store: &CredentialStore,
    policy: &PathPolicy,
    upload: Arc<UploadConfig>,
    locks: Arc<LockManager>,
) -> Result<UploadSession, ApiError> {
    if method != Method::POST && method != Method::PUT {
        return Err(ApiError::MethodNotAllowed(
            "Method Not Allowed - only PUT and POST methods are supported.".into(),
        ));
    }

    let identity = Credentials::from_headers(headers)?;
    let destination = resolve_destination(identity.as_ref(), store, policy).await?;

    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    if upload.max_file_size > 0 && declared_size > upload.max_file_size {
        return Err(ApiError::PayloadTooLarge(format!(
            "Upload exceeds the maximum accepted size of {} bytes.",
            upload.max_file_size
        )));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let boundary = multer::parse_boundary(content_type)
        .map_err(|_| ApiError::BadRequest("Expected a multipart/form-data body.".into()))?;

    info!(
        login = identity.as_ref().map(|id| id.login.as_str()).unwrap_or("<anonymous>"),
        destination = ?destination,
        declared_size,
        "upload started"
    );
    Ok(UploadSession::start(
        destination,
        boundary,
        declared_size,
        upload,
        locks,
    ))
}

/// `POST|PUT /upload`：流式接收 multipart 请求体并落盘。
pub async fn upload_handler(
    Extension(store): Extension<Arc<CredentialStore>>,
    Extension(policy): Extension<Arc<PathPolicy>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(locks): Extension<Arc<LockManager>>,
    method: Method,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<&'static str, ApiError> {
    let mut session = prepare(&method, &headers, &store, &policy, upload, locks).await?;

    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        match chunk {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => session.data_received(chunk).await?,
            Err(err) => {
                warn!(
                    destination = ?session.destination(),
                    received = session.received_bytes(),
                    error = %err,
                    "request body interrupted"
                );
                session.abort().await;
                return Err(ApiError::BadRequest(format!(
                    "Request body interrupted: {err}"
                )));
            }
        }
    }

    session.data_complete().await?;
    Ok("OK")
}

/// 清理目录树中过期的上传临时文件，返回删除数量。
pub async fn cleanup_stale_temp_files(
    root: &Path,
    tmp_suffix: &str,
    ttl: Duration,
) -> Result<usize, std::io::Error> {
    if ttl.is_zero() || tmp_suffix.is_empty() {
        return Ok(0);
    }
    if fs::metadata(root).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
                continue;
            }
            if !file_type.is_file() || !entry.file_name().to_string_lossy().ends_with(tmp_suffix) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let Some(age) = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            else {
                continue;
            };
            if age < ttl {
                continue;
            }
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale upload temp file");
            } else {
                info!(path = ?path, "removed stale upload temp file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}
