//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// 可用于原子替换的临时文件封装。
///
/// The temp file is removed on drop unless it was persisted or cleaned up,
/// so an abandoned writer never leaves data behind.
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<BufWriter<File>>,
    settled: bool,
}

impl AtomicFile {
    /// 在 `temp_path` 创建临时文件，最终替换 `target`。
    pub async fn create(temp_path: PathBuf, target: PathBuf, buffer: usize) -> io::Result<Self> {
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target,
            temp_path,
            file: Some(BufWriter::with_capacity(buffer, file)),
            settled: false,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 追加写入数据。
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Err(io::Error::other("temp file already closed")),
        }
    }

    /// 刷新缓冲并落盘，之后不可再写入。
    pub async fn sync(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.get_mut().sync_all().await?;
        }
        Ok(())
    }

    /// 同步并原子替换目标文件。
    pub async fn persist(mut self) -> io::Result<()> {
        if let Err(err) = self.sync().await {
            self.cleanup().await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
                        self.cleanup().await;
                        return Err(err);
                    }
                } else {
                    self.cleanup().await;
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                self.cleanup().await;
                return Err(err);
            }
        }
        self.settled = true;

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
        self.settled = true;
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.settled {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
