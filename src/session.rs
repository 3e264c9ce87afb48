//! 上传会话管理：创建、顺序追加分片、完成发布与闲置过期清理。
//!
//! 每个会话放在独立的 `tokio::sync::Mutex` 中，不同会话之间互不阻塞。同一会话
//! 的追加与完成操作使用 `try_lock`，已有操作在进行时立即返回 `Conflict`，
//! 不排队等待。终态（Committed / Failed / Aborted）的会话会立即从表中移除。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk_store::{ChunkHandle, ChunkStore, ChunkStoreError};
use crate::config::UPLOAD_TEMP_DIR;
use crate::status::ResourceStatus;
use crate::storage::{Storage, StorageError};

const MAX_NAME_BYTES: usize = 255;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_total_size: u64,
    pub max_chunk_size: u64,
    pub max_concurrent: u64,
    pub idle_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upload session not found")]
    NotFound,
    #[error("chunk of {len} bytes at {received} exceeds declared size {declared}")]
    Overflow { declared: u64, received: u64, len: u64 },
    #[error("chunk offset {actual} does not match received bytes {expected}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("another operation is in progress for this upload")]
    Conflict,
    #[error("upload incomplete: received {received} of {declared} bytes")]
    Incomplete { declared: u64, received: u64 },
    #[error("path escapes the served root")]
    InvalidPath,
    #[error("too many open uploads")]
    TooManySessions,
    #[error("storage fault: {0}")]
    StorageFault(#[source] std::io::Error),
}

impl From<StorageError> for UploadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UploadError::InvalidPath,
            StorageError::NotFound(_) => UploadError::NotFound,
            StorageError::Io(err) => UploadError::StorageFault(err),
        }
    }
}

impl From<ChunkStoreError> for UploadError {
    fn from(error: ChunkStoreError) -> Self {
        match error {
            ChunkStoreError::OffsetMismatch { expected, actual } => {
                UploadError::OffsetMismatch { expected, actual }
            }
            ChunkStoreError::Io(err) => UploadError::StorageFault(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalizing,
    Committed,
    Failed,
    Aborted,
}

#[derive(Debug)]
struct UploadSession {
    target_name: String,
    target: PathBuf,
    declared_size: u64,
    chunk_size_hint: u64,
    bytes_received: u64,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    chunks: Option<ChunkHandle>,
    slot: Option<OwnedSemaphorePermit>,
}

impl UploadSession {
    /// 进入终态：释放并发名额，取出暂存文件句柄交给调用方清理。
    fn close(&mut self, state: SessionState) -> Option<ChunkHandle> {
        self.state = state;
        self.slot = None;
        self.chunks.take()
    }
}

/// 完成发布后对外可见的文件。
#[derive(Debug)]
pub struct PublishedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

pub struct UploadManager {
    sessions: DashMap<String, Arc<Mutex<UploadSession>>>,
    /// 并发会话名额，`max_concurrent` 为 0 时不限制。
    slots: Option<Arc<Semaphore>>,
    store: ChunkStore,
    storage: Arc<Storage>,
    status: Arc<ResourceStatus>,
    config: UploadConfig,
}

impl UploadManager {
    pub fn new(
        store: ChunkStore,
        storage: Arc<Storage>,
        status: Arc<ResourceStatus>,
        config: UploadConfig,
    ) -> Self {
        let slots = (config.max_concurrent > 0).then(|| {
            let permits = usize::try_from(config.max_concurrent)
                .unwrap_or(usize::MAX)
                .min(Semaphore::MAX_PERMITS);
            Arc::new(Semaphore::new(permits))
        });
        Self {
            sessions: DashMap::new(),
            slots,
            store,
            storage,
            status,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 当前打开的会话数量。
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// 创建上传会话，返回会话 ID。`directory` 为根目录下的目标目录，缺省为根目录。
    pub async fn create(
        &self,
        name: &str,
        declared_size: u64,
        chunk_size_hint: u64,
        directory: Option<&str>,
    ) -> Result<String, UploadError> {
        validate_file_name(name)?;
        if chunk_size_hint == 0 {
            return Err(UploadError::InvalidRequest("chunk size must be positive".into()));
        }
        if chunk_size_hint > self.config.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunk size exceeds limit of {} bytes",
                self.config.max_chunk_size
            )));
        }
        if self.config.max_total_size > 0 && declared_size > self.config.max_total_size {
            return Err(UploadError::InvalidRequest("upload size exceeds limit".into()));
        }
        // 名额在第一个 await 之前占用，创建失败时随 permit 一起释放。
        let slot = match &self.slots {
            Some(slots) => Some(
                Arc::clone(slots)
                    .try_acquire_owned()
                    .map_err(|_| UploadError::TooManySessions)?,
            ),
            None => None,
        };

        let directory = directory.unwrap_or(".");
        let target_dir = self.storage.resolve_dir(directory).await?;
        if target_dir == self.storage.root_path() && name == UPLOAD_TEMP_DIR {
            return Err(UploadError::InvalidRequest("reserved file name".into()));
        }
        let target = target_dir.join(name);
        match fs::symlink_metadata(&target).await {
            Ok(metadata) if !metadata.is_file() => {
                return Err(UploadError::InvalidRequest(
                    "target exists and is not a regular file".into(),
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(UploadError::StorageFault(err)),
        }

        let id = Uuid::new_v4().simple().to_string();
        let chunks = self.store.open(&id).await?;
        let session = UploadSession {
            target_name: name.to_string(),
            target,
            declared_size,
            chunk_size_hint,
            bytes_received: 0,
            state: SessionState::Open,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            chunks: Some(chunks),
            slot,
        };
        info!(
            upload_id = id,
            name,
            directory,
            declared_size,
            chunk_size_hint,
            created_at = %session.created_at,
            "create upload"
        );
        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        Ok(id)
    }

    /// 追加一个分片，`offset` 缺省为已接收字节数。返回新的已接收字节数。
    pub async fn append_chunk(
        &self,
        id: &str,
        offset: Option<u64>,
        payload: &[u8],
    ) -> Result<u64, UploadError> {
        let session = self.lookup(id)?;
        let mut session = session.try_lock_owned().map_err(|_| UploadError::Conflict)?;
        if session.state != SessionState::Open {
            return Err(UploadError::NotFound);
        }

        let received = session.bytes_received;
        let len = payload.len() as u64;
        let offset = offset.unwrap_or(received);
        if offset != received {
            return Err(UploadError::OffsetMismatch {
                expected: received,
                actual: offset,
            });
        }
        if received + len > session.declared_size {
            return Err(UploadError::Overflow {
                declared: session.declared_size,
                received,
                len,
            });
        }
        if len > session.chunk_size_hint {
            return Err(UploadError::InvalidRequest(format!(
                "chunk exceeds negotiated size of {} bytes",
                session.chunk_size_hint
            )));
        }

        let Some(chunks) = session.chunks.as_mut() else {
            return Err(UploadError::NotFound);
        };
        let appended = self.store.append(chunks, offset, payload).await;
        match appended {
            Ok(()) => {}
            Err(ChunkStoreError::Io(err)) => {
                let chunks = session.close(SessionState::Failed);
                drop(session);
                self.sessions.remove(id);
                if let Some(chunks) = chunks {
                    self.store.discard(chunks).await;
                }
                error!(upload_id = id, offset, error = %err, "chunk append failed");
                return Err(UploadError::StorageFault(err));
            }
            Err(err) => return Err(err.into()),
        }

        session.bytes_received += len;
        session.last_activity = Instant::now();
        self.status.record_upload(len);
        debug!(
            upload_id = id,
            offset,
            bytes = len,
            received = session.bytes_received,
            "chunk appended"
        );
        Ok(session.bytes_received)
    }

    /// 校验字节数齐全后原子发布文件，并释放会话。
    pub async fn finalize(&self, id: &str) -> Result<PublishedFile, UploadError> {
        let session = self.lookup(id)?;
        let mut session = session.try_lock_owned().map_err(|_| UploadError::Conflict)?;
        if session.state != SessionState::Open {
            return Err(UploadError::NotFound);
        }
        if session.bytes_received != session.declared_size {
            return Err(UploadError::Incomplete {
                declared: session.declared_size,
                received: session.bytes_received,
            });
        }

        session.state = SessionState::Finalizing;
        let Some(chunks) = session.chunks.take() else {
            session.close(SessionState::Failed);
            self.sessions.remove(id);
            return Err(UploadError::NotFound);
        };
        let result = self.store.publish(chunks, &session.target).await;
        self.sessions.remove(id);
        match result {
            Ok(size) => {
                session.close(SessionState::Committed);
                info!(
                    upload_id = id,
                    name = session.target_name,
                    size,
                    "upload committed"
                );
                Ok(PublishedFile {
                    name: session.target_name.clone(),
                    path: session.target.clone(),
                    size,
                })
            }
            Err(err) => {
                session.close(SessionState::Failed);
                error!(
                    upload_id = id,
                    name = session.target_name,
                    error = %err,
                    "publish failed"
                );
                Err(err.into())
            }
        }
    }

    /// 中止闲置超过 TTL 的会话并回收暂存文件，正在处理请求的会话跳过。
    pub async fn sweep_expired(&self) -> usize {
        if self.config.idle_ttl.is_zero() {
            return 0;
        }
        let candidates: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut aborted = 0;
        for (id, session) in candidates {
            let Ok(mut session) = session.try_lock_owned() else {
                continue;
            };
            if session.state != SessionState::Open
                || session.last_activity.elapsed() < self.config.idle_ttl
            {
                continue;
            }
            let chunks = session.close(SessionState::Aborted);
            let received = session.bytes_received;
            drop(session);
            self.sessions.remove(&id);
            if let Some(chunks) = chunks {
                self.store.discard(chunks).await;
            }
            warn!(upload_id = id, received, "aborted idle upload");
            aborted += 1;
        }
        aborted
    }

    fn lookup(&self, id: &str) -> Result<Arc<Mutex<UploadSession>>, UploadError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(UploadError::NotFound)
    }
}

/// 仅接受单层文件名：非空、不含路径分隔符、不是 `.` 或 `..`。
pub fn validate_file_name(name: &str) -> Result<(), UploadError> {
    if name.is_empty() || name.trim().is_empty() {
        return Err(UploadError::InvalidRequest("name is required".into()));
    }
    if name == "." || name == ".." {
        return Err(UploadError::InvalidRequest("name is not a file name".into()));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(UploadError::InvalidRequest("name is too long".into()));
    }
    if name.contains(['/', '\\', '\0']) || (cfg!(windows) && name.contains(':')) {
        return Err(UploadError::InvalidRequest(
            "name must not contain path separators".into(),
        ));
    }
    Ok(())
}
