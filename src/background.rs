//! 上传临时文件与路径锁的后台清理任务。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TEMP_CLEAN_INTERVAL_SECS;
use crate::locking::LockManager;
use crate::upload::{UploadConfig, cleanup_stale_temp_files};

/// 启动后台任务：定期清理过期临时文件并回收空闲路径锁。
pub fn spawn_background_tasks(
    roots: Vec<PathBuf>,
    upload: Arc<UploadConfig>,
    locks: Arc<LockManager>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TEMP_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            for root in &roots {
                match cleanup_stale_temp_files(root, &upload.tmp_suffix, upload.temp_ttl).await {
                    Ok(0) => {}
                    Ok(removed) => info!(root = ?root, removed, "stale upload temp files removed"),
                    Err(err) => warn!(root = ?root, error = %err, "upload temp cleanup failed"),
                }
            }
            let held = locks.prune().await;
            debug!(held, "finalize locks pruned");
        }
    });
}
