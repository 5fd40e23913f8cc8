//! 流式上传会话：增量解析 multipart，边接收边写入临时文件，完成后原子重命名。
//!
//! A session owns a decoder task fed through a bounded channel. Each chunk
//! handed to [`UploadSession::data_received`] is queued for the decoder,
//! which writes the current section straight to its temp file. Closing the
//! channel is the body-complete signal; the decoder then flushes the last
//! section and hands the finished parts back for renaming.

use axum::body::Bytes;
use futures_util::stream;
use multer::{Constraints, Multipart, SizeLimit};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::FINALIZE_LOCK_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::upload::UploadConfig;

const CHUNK_QUEUE_DEPTH: usize = 4;
const MIN_WRITE_BUFFER: usize = 8 * 1024;
const MAX_WRITE_BUFFER: usize = 1024 * 1024;
const DEFAULT_WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    Completing,
    Finalized,
    Aborted,
}

/// 根据声明的请求体大小选择写缓冲容量。
pub fn write_buffer_capacity(declared_size: u64) -> usize {
    if declared_size == 0 {
        return DEFAULT_WRITE_BUFFER;
    }
    usize::try_from(declared_size)
        .unwrap_or(MAX_WRITE_BUFFER)
        .clamp(MIN_WRITE_BUFFER, MAX_WRITE_BUFFER)
}

/// 校验客户端提供的文件名，只允许单个路径分量。
pub fn sanitize_file_name(raw: &str, tmp_suffix: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(ApiError::BadRequest(format!("Invalid file name '{raw}'.")));
    }
    if !tmp_suffix.is_empty() && name.ends_with(tmp_suffix) {
        return Err(ApiError::BadRequest(format!(
            "File names ending with '{tmp_suffix}' are reserved."
        )));
    }
    Ok(name.to_string())
}

/// One multipart section being streamed into a temp file next to its target.
pub struct UploadPart {
    file_name: String,
    temp: Option<AtomicFile>,
    bytes: u64,
}

impl UploadPart {
    /// 在目标目录创建临时文件；目录缺失或目标已存在时失败。
    pub async fn create(
        destination: &Path,
        file_name: String,
        config: &UploadConfig,
        buffer: usize,
    ) -> Result<Self, ApiError> {
        ensure_directory(destination, config.auto_create_dirs).await?;

        let final_path = destination.join(&file_name);
        if !config.overwrite && target_exists(&final_path).await? {
            return Err(conflict());
        }

        let temp_path = destination.join(format!("{}{}", Uuid::new_v4(), config.tmp_suffix));
        let temp = AtomicFile::create(temp_path, final_path, buffer)
            .await
            .map_err(|err| {
                warn!(path = ?destination, error = %err, "cannot create upload temp file");
                misconfigured()
            })?;
        debug!(file_name, temp = ?temp.temp_path(), "upload part opened");

        Ok(Self {
            file_name,
            temp: Some(temp),
            bytes: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), ApiError> {
        let temp = self
            .temp
            .as_mut()
            .ok_or_else(|| ApiError::Internal("upload part already released".into()))?;
        temp.write_all(data)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// 刷新并落盘临时文件。
    pub async fn close(&mut self) -> Result<(), ApiError> {
        if let Some(temp) = self.temp.as_mut() {
            temp.sync()
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        Ok(())
    }

    /// 将临时文件原子重命名为最终文件名。
    ///
    /// The existence check and the rename run under the per-target lock, so
    /// two sessions racing for the same name cannot both win without
    /// overwrite enabled.
    pub async fn finalize(mut self, locks: &LockManager, overwrite: bool) -> Result<PathBuf, ApiError> {
        let Some(temp) = self.temp.take() else {
            return Err(ApiError::Internal("upload part already released".into()));
        };
        let target = temp.target().to_path_buf();

        let Ok(_guard) = locks
            .lock_path_with_timeout(&target, Duration::from_secs(FINALIZE_LOCK_TIMEOUT_SECS))
            .await
        else {
            temp.cleanup().await;
            return Err(ApiError::Conflict(
                "Conflict - file is being written by another upload.".into(),
            ));
        };

        if !overwrite {
            match target_exists(&target).await {
                Ok(false) => {}
                Ok(true) => {
                    temp.cleanup().await;
                    return Err(conflict());
                }
                Err(err) => {
                    temp.cleanup().await;
                    return Err(err);
                }
            }
        }

        temp.persist().await.map_err(|err| {
            ApiError::Internal(format!("Could not finalize '{}': {err}", self.file_name))
        })?;
        info!(path = ?target, bytes = self.bytes, "upload part finalized");
        Ok(target)
    }

    /// 删除临时文件；可重复调用。
    pub async fn release(&mut self) {
        if let Some(temp) = self.temp.take() {
            debug!(temp = ?temp.temp_path(), "releasing upload part");
            temp.cleanup().await;
        }
    }
}

/// Per-request upload state machine: `Receiving → Completing → Finalized | Aborted`.
pub struct UploadSession {
    destination: PathBuf,
    declared_size: u64,
    received: u64,
    state: SessionState,
    sender: Option<mpsc::Sender<Bytes>>,
    decoder: Option<JoinHandle<Result<Vec<UploadPart>, ApiError>>>,
    parts: Vec<UploadPart>,
    config: Arc<UploadConfig>,
    locks: Arc<LockManager>,
}

impl UploadSession {
    /// 启动解码任务并进入 `Receiving` 状态。
    pub fn start(
        destination: PathBuf,
        boundary: String,
        declared_size: u64,
        config: Arc<UploadConfig>,
        locks: Arc<LockManager>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<Bytes>(CHUNK_QUEUE_DEPTH);
        let body = stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|chunk| (Ok::<Bytes, io::Error>(chunk), receiver))
        });

        let mut constraints = Constraints::new();
        if config.max_file_size > 0 {
            constraints =
                constraints.size_limit(SizeLimit::new().whole_stream(config.max_file_size));
        }
        let multipart = Multipart::with_constraints(body, boundary, constraints);
        let decoder = tokio::spawn(decode_parts(
            multipart,
            destination.clone(),
            config.clone(),
            write_buffer_capacity(declared_size),
        ));

        Self {
            destination,
            declared_size,
            received: 0,
            state: SessionState::Receiving,
            sender: Some(sender),
            decoder: Some(decoder),
            parts: Vec::new(),
            config,
            locks,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// 接收一个请求体分块；出错时会话被中止并清理临时文件。
    ///
    /// Chunks arriving after an abort, or after the closing boundary, are
    /// discarded.
    pub async fn data_received(&mut self, chunk: Bytes) -> Result<(), ApiError> {
        if self.state != SessionState::Receiving {
            return Ok(());
        }
        self.received += chunk.len() as u64;

        let Some(sender) = self.sender.as_ref() else {
            return Ok(());
        };
        let delivered = sender.send(chunk).await.is_ok();
        let decoder_done = self
            .decoder
            .as_ref()
            .is_some_and(|decoder| decoder.is_finished());
        if !delivered || decoder_done {
            self.sender = None;
            if let Err(err) = self.join_decoder().await {
                self.abort().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// 标记请求体结束并完成所有分段的重命名，只能调用一次。
    pub async fn data_complete(&mut self) -> Result<Vec<PathBuf>, ApiError> {
        if self.state != SessionState::Receiving {
            return Err(ApiError::Internal(
                "upload session is not receiving data".into(),
            ));
        }
        self.state = SessionState::Completing;
        self.sender = None;

        if let Err(err) = self.join_decoder().await {
            self.abort().await;
            return Err(err);
        }

        let mut finalized = Vec::with_capacity(self.parts.len());
        let mut pending = std::mem::take(&mut self.parts).into_iter();
        while let Some(part) = pending.next() {
            match part.finalize(&self.locks, self.config.overwrite).await {
                Ok(path) => finalized.push(path),
                Err(err) => {
                    for mut rest in pending.by_ref() {
                        rest.release().await;
                    }
                    self.state = SessionState::Aborted;
                    return Err(err);
                }
            }
        }

        self.state = SessionState::Finalized;
        info!(
            destination = ?self.destination,
            files = finalized.len(),
            bytes = self.received,
            declared = self.declared_size,
            "upload complete"
        );
        Ok(finalized)
    }

    /// 中止会话：停止解码并删除所有临时文件；可重复调用。
    pub async fn abort(&mut self) {
        if self.state == SessionState::Finalized {
            return;
        }
        if self.state != SessionState::Aborted {
            debug!(destination = ?self.destination, received = self.received, "aborting upload session");
        }
        self.state = SessionState::Aborted;
        self.sender = None;
        if let Some(decoder) = self.decoder.take()
            && let Ok(Ok(parts)) = decoder.await
        {
            self.parts.extend(parts);
        }
        self.release_parts().await;
    }

    pub async fn release_parts(&mut self) {
        for part in &mut self.parts {
            part.release().await;
        }
        self.parts.clear();
    }

    async fn join_decoder(&mut self) -> Result<(), ApiError> {
        let Some(decoder) = self.decoder.take() else {
            return Ok(());
        };
        match decoder.await {
            Ok(Ok(parts)) => {
                self.parts.extend(parts);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(err) => Err(ApiError::Internal(format!("multipart decoder failed: {err}"))),
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // Dropping `sender` ends the body stream; the decoder releases the
        // parts it still holds, and parts held here are removed on drop.
        if matches!(self.state, SessionState::Receiving | SessionState::Completing) {
            warn!(
                destination = ?self.destination,
                received = self.received,
                "upload session dropped before completion"
            );
        }
    }
}

async fn decode_parts(
    mut multipart: Multipart<'static>,
    destination: PathBuf,
    config: Arc<UploadConfig>,
    buffer: usize,
) -> Result<Vec<UploadPart>, ApiError> {
    let mut parts = Vec::new();
    if let Err(err) = demux(&mut multipart, &destination, &config, buffer, &mut parts).await {
        for part in &mut parts {
            part.release().await;
        }
        return Err(err);
    }
    Ok(parts)
}

async fn demux(
    multipart: &mut Multipart<'static>,
    destination: &Path,
    config: &UploadConfig,
    buffer: usize,
    parts: &mut Vec<UploadPart>,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(raw_name) = field.file_name().map(str::to_owned) else {
            debug!(field = ?field.name(), "skipping form field without file name");
            while field.chunk().await.map_err(multipart_error)?.is_some() {}
            continue;
        };
        let file_name = sanitize_file_name(&raw_name, &config.tmp_suffix)?;
        let mut part = UploadPart::create(destination, file_name, config, buffer).await?;

        let write_result: Result<(), ApiError> = async {
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                part.write(&chunk).await?;
            }
            part.close().await
        }
        .await;
        if let Err(err) = write_result {
            part.release().await;
            return Err(err);
        }

        debug!(
            file_name = part.file_name(),
            bytes = part.bytes_written(),
            "upload part received"
        );
        parts.push(part);
    }
    Ok(())
}

async fn ensure_directory(dir: &Path, auto_create: bool) -> Result<(), ApiError> {
    match fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => {
            warn!(path = ?dir, "upload destination is not a directory");
            Err(misconfigured())
        }
        Err(err) if err.kind() == ErrorKind::NotFound && auto_create => {
            fs::create_dir_all(dir).await.map_err(|err| {
                warn!(path = ?dir, error = %err, "cannot create upload directory");
                misconfigured()
            })?;
            info!(path = ?dir, "created upload directory");
            Ok(())
        }
        Err(err) => {
            warn!(path = ?dir, error = %err, "upload directory unavailable");
            Err(misconfigured())
        }
    }
}

async fn target_exists(path: &Path) -> Result<bool, ApiError> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

fn multipart_error(err: multer::Error) -> ApiError {
    match err {
        multer::Error::StreamSizeExceeded { limit } => ApiError::PayloadTooLarge(format!(
            "Upload exceeds the maximum accepted size of {limit} bytes."
        )),
        other => ApiError::BadRequest(format!("Malformed multipart body: {other}")),
    }
}

fn misconfigured() -> ApiError {
    ApiError::Internal(
        "Server misconfiguration - could not write to user's upload directory.".into(),
    )
}

fn conflict() -> ApiError {
    ApiError::Conflict("Conflict - file already exists.".into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tempfile::tempdir;

    pub(crate) const BOUNDARY: &str = "dropzone-test-boundary";
    const SUFFIX: &str = ".~tmp";

    pub(crate) fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn config(overwrite: bool, auto_create_dirs: bool, max_file_size: u64) -> Arc<UploadConfig> {
        Arc::new(UploadConfig {
            max_file_size,
            overwrite,
            auto_create_dirs,
            tmp_suffix: SUFFIX.to_string(),
            temp_ttl: Duration::from_secs(60),
        })
    }

    fn session(destination: &Path, config: Arc<UploadConfig>, declared: u64) -> UploadSession {
        UploadSession::start(
            destination.to_path_buf(),
            BOUNDARY.to_string(),
            declared,
            config,
            Arc::new(LockManager::new()),
        )
    }

    async fn run_upload(
        session: &mut UploadSession,
        body: &[u8],
        chunk_size: usize,
    ) -> Result<Vec<PathBuf>, ApiError> {
        for piece in body.chunks(chunk_size) {
            session
                .data_received(Bytes::copy_from_slice(piece))
                .await?;
        }
        session.data_complete().await
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn streamed_file_matches_payload_and_leaves_no_temp() {
        let temp = tempdir().expect("tempdir");
        let data = payload(300 * 1024 + 17);
        let body = multipart_body(&[("photo.jpg", &data)]);
        let mut upload = session(temp.path(), config(false, false, 0), body.len() as u64);

        let finalized = run_upload(&mut upload, &body, 7 * 1024)
            .await
            .expect("upload");

        assert_eq!(finalized, vec![temp.path().join("photo.jpg")]);
        assert_eq!(upload.state(), SessionState::Finalized);
        assert_eq!(upload.received_bytes(), body.len() as u64);
        assert_eq!(std::fs::read(temp.path().join("photo.jpg")).expect("read"), data);
        assert_eq!(dir_entries(temp.path()), vec!["photo.jpg"]);
    }

    #[tokio::test]
    async fn multiple_files_and_plain_fields() {
        let temp = tempdir().expect("tempdir");
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n"
        )
        .into_bytes();
        body.extend(multipart_body(&[("a.txt", b"alpha"), ("b.txt", b"beta")]));
        let mut upload = session(temp.path(), config(false, false, 0), 0);

        run_upload(&mut upload, &body, 5).await.expect("upload");

        assert_eq!(dir_entries(temp.path()), vec!["a.txt", "b.txt"]);
        assert_eq!(std::fs::read(temp.path().join("b.txt")).expect("read"), b"beta");
    }

    #[tokio::test]
    async fn abort_mid_stream_leaves_no_files() {
        let temp = tempdir().expect("tempdir");
        let data = payload(64 * 1024);
        let body = multipart_body(&[("big.bin", &data)]);
        let mut upload = session(temp.path(), config(false, false, 0), body.len() as u64);

        let half = body.len() / 2;
        for piece in body[..half].chunks(4096) {
            upload
                .data_received(Bytes::copy_from_slice(piece))
                .await
                .expect("chunk");
        }
        for _ in 0..200 {
            if !dir_entries(temp.path()).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            dir_entries(temp.path())
                .iter()
                .all(|name| name.ends_with(SUFFIX)),
            "only temp files may exist mid-stream"
        );

        upload.abort().await;
        upload.abort().await;

        assert_eq!(upload.state(), SessionState::Aborted);
        assert!(dir_entries(temp.path()).is_empty());
        upload
            .data_received(Bytes::from_static(b"ignored"))
            .await
            .expect("discarded after abort");
        assert!(upload.data_complete().await.is_err());
    }

    #[tokio::test]
    async fn dropped_session_cleans_up_without_abort() {
        let temp = tempdir().expect("tempdir");
        let data = payload(200 * 1024);
        let body = multipart_body(&[("big.bin", &data)]);
        let mut upload = session(temp.path(), config(false, false, 0), body.len() as u64);

        for piece in body[..100 * 1024].chunks(8 * 1024) {
            upload
                .data_received(Bytes::copy_from_slice(piece))
                .await
                .expect("chunk");
        }
        drop(upload);

        for _ in 0..200 {
            if dir_entries(temp.path()).is_empty() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dir_entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn conflict_keeps_first_file() {
        let temp = tempdir().expect("tempdir");
        let config = config(false, false, 0);
        let mut first = session(temp.path(), config.clone(), 0);
        run_upload(&mut first, &multipart_body(&[("a.txt", b"first")]), 64)
            .await
            .expect("first upload");

        let mut second = session(temp.path(), config, 0);
        let result = run_upload(&mut second, &multipart_body(&[("a.txt", b"second")]), 64).await;

        assert_eq!(result.unwrap_err().status(), StatusCode::CONFLICT);
        assert_eq!(std::fs::read(temp.path().join("a.txt")).expect("read"), b"first");
        assert_eq!(dir_entries(temp.path()), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_file() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), b"first").expect("seed");
        let mut upload = session(temp.path(), config(true, false, 0), 0);

        run_upload(&mut upload, &multipart_body(&[("a.txt", b"second")]), 3)
            .await
            .expect("overwrite");

        assert_eq!(std::fs::read(temp.path().join("a.txt")).expect("read"), b"second");
        assert_eq!(dir_entries(temp.path()), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn missing_directory_is_a_server_error_unless_auto_created() {
        let temp = tempdir().expect("tempdir");
        let destination = temp.path().join("team1").join("photos");
        let body = multipart_body(&[("a.txt", b"data")]);

        let mut refused = session(&destination, config(false, false, 0), 0);
        let result = run_upload(&mut refused, &body, 16).await;
        assert_eq!(
            result.unwrap_err().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(!destination.exists());

        let mut created = session(&destination, config(false, true, 0), 0);
        run_upload(&mut created, &body, 16).await.expect("auto create");
        assert_eq!(std::fs::read(destination.join("a.txt")).expect("read"), b"data");
    }

    #[tokio::test]
    async fn truncated_body_is_rejected_without_files() {
        let temp = tempdir().expect("tempdir");
        let body = multipart_body(&[("a.txt", &payload(10_000))]);
        let mut upload = session(temp.path(), config(false, false, 0), 0);

        let result = run_upload(&mut upload, &body[..body.len() - 40], 1024).await;

        assert_eq!(result.unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(upload.state(), SessionState::Aborted);
        assert!(dir_entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let body = multipart_body(&[("a.bin", &payload(8 * 1024))]);
        let mut upload = session(temp.path(), config(false, false, 1024), 0);

        let result = run_upload(&mut upload, &body, 512).await;

        assert_eq!(result.unwrap_err().status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(dir_entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn reserved_file_name_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut upload = session(temp.path(), config(false, false, 0), 0);
        let result = run_upload(&mut upload, &multipart_body(&[("notes.~tmp", b"x")]), 64).await;
        assert_eq!(result.unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert!(dir_entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn data_complete_only_once() {
        let temp = tempdir().expect("tempdir");
        let mut upload = session(temp.path(), config(false, false, 0), 0);
        run_upload(&mut upload, &multipart_body(&[("a.txt", b"x")]), 64)
            .await
            .expect("upload");

        assert!(upload.data_complete().await.is_err());
        upload.abort().await;
        assert_eq!(upload.state(), SessionState::Finalized);
        assert_eq!(dir_entries(temp.path()), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let mut part = UploadPart::create(
            temp.path(),
            "a.txt".into(),
            &config(false, false, 0),
            MIN_WRITE_BUFFER,
        )
        .await
        .expect("create part");
        part.write(b"abc").await.expect("write");
        assert_eq!(dir_entries(temp.path()).len(), 1);

        part.release().await;
        part.release().await;
        assert!(dir_entries(temp.path()).is_empty());
        assert!(part.write(b"more").await.is_err());
    }

    #[test]
    fn file_names_are_single_components() {
        assert_eq!(sanitize_file_name(" report.pdf ", SUFFIX).expect("ok"), "report.pdf");
        for bad in ["", "  ", ".", "..", "a/b", "..\\x", "C:\\tmp\\x", "nul\0byte", "x.~tmp"] {
            assert!(sanitize_file_name(bad, SUFFIX).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn buffer_capacity_follows_declared_size() {
        assert_eq!(write_buffer_capacity(0), DEFAULT_WRITE_BUFFER);
        assert_eq!(write_buffer_capacity(100), MIN_WRITE_BUFFER);
        assert_eq!(write_buffer_capacity(200 * 1024), 200 * 1024);
        assert_eq!(write_buffer_capacity(u64::MAX), MAX_WRITE_BUFFER);
    }
}
