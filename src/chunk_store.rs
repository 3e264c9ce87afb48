//! 上传暂存文件：顺序追加、原子发布与清理。

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const PART_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("chunk offset {actual} does not match stored length {expected}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("chunk store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 单个上传会话的追加目标。
#[derive(Debug)]
pub struct ChunkHandle {
    path: PathBuf,
    file: File,
    len: u64,
}

/// 暂存目录，每个打开的会话对应一个 `<session>.part` 文件。
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 创建暂存目录并删除上次运行遗留的分片文件，返回删除数量。
    pub async fn prepare(&self) -> io::Result<usize> {
        fs::create_dir_all(&self.root).await?;
        let mut dir = fs::read_dir(&self.root).await?;
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(PART_SUFFIX) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = ?entry.path(), error = %err, "failed to remove leftover part"),
            }
        }
        Ok(removed)
    }

    /// 为会话创建新的空暂存文件。
    pub async fn open(&self, session_id: &str) -> Result<ChunkHandle, ChunkStoreError> {
        let path = self.root.join(format!("{session_id}{PART_SUFFIX}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(ChunkHandle { path, file, len: 0 })
    }

    /// 在 `offset` 处追加数据，`offset` 必须等于当前长度。返回前同步落盘；
    /// 写入失败时尽量截断回原长度。
    pub async fn append(
        &self,
        handle: &mut ChunkHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ChunkStoreError> {
        if offset != handle.len {
            return Err(ChunkStoreError::OffsetMismatch {
                expected: handle.len,
                actual: offset,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let written = async {
            handle.file.write_all(bytes).await?;
            handle.file.flush().await?;
            handle.file.sync_data().await
        }
        .await;
        if let Err(err) = written {
            if let Err(rollback) = handle.file.set_len(handle.len).await {
                warn!(path = ?handle.path, error = %rollback, "failed to roll back partial chunk");
            }
            return Err(ChunkStoreError::Io(err));
        }

        handle.len += bytes.len() as u64;
        Ok(())
    }

    /// 同步后以 rename 原子发布到 `final_path`，返回文件大小。失败时删除暂存文件。
    pub async fn publish(
        &self,
        handle: ChunkHandle,
        final_path: &Path,
    ) -> Result<u64, ChunkStoreError> {
        let ChunkHandle { path, file, len } = handle;
        if let Err(err) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(ChunkStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&path, final_path).await {
            #[cfg(windows)]
            {
                if fs::remove_file(final_path).await.is_ok()
                    && fs::rename(&path, final_path).await.is_ok()
                {
                    sync_parent(final_path).await;
                    return Ok(len);
                }
            }
            let _ = fs::remove_file(&path).await;
            return Err(ChunkStoreError::Io(err));
        }

        sync_parent(final_path).await;
        debug!(path = ?final_path, size = len, "published upload");
        Ok(len)
    }

    /// 以只读方式重新打开暂存文件，之后的追加必定失败。
    #[cfg(test)]
    pub(crate) async fn reopen_read_only(
        &self,
        handle: ChunkHandle,
    ) -> Result<ChunkHandle, ChunkStoreError> {
        let ChunkHandle { path, file, len } = handle;
        drop(file);
        let file = OpenOptions::new().read(true).open(&path).await?;
        Ok(ChunkHandle { path, file, len })
    }

    /// 放弃会话并删除暂存文件。
    pub async fn discard(&self, handle: ChunkHandle) {
        let ChunkHandle { path, file, .. } = handle;
        drop(file);
        if let Err(err) = fs::remove_file(&path).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?path, error = %err, "failed to discard upload part");
        }
    }
}

async fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Err(err) = sync_dir(parent).await
    {
        debug!(path = ?parent, error = %err, "directory sync failed");
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
