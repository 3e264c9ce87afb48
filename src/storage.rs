//! 存储根目录：路径归一化、越界校验与目录列举。

use serde::Serialize;
use std::cmp::Ordering;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::debug;

use crate::config::UPLOAD_TEMP_DIR;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes the served root")]
    InvalidPath,
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 被列举目录下的一个直接子项。
#[derive(Debug, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "dir")]
    pub is_directory: bool,
    #[serde(rename = "sym")]
    pub is_symlink: bool,
    #[serde(rename = "size", skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 创建（如不存在）并规范化存储根目录。
    pub async fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 默认的上传暂存目录，位于根目录内以保证 rename 不跨文件系统。
    pub fn default_temp_dir(&self) -> PathBuf {
        self.root.join(UPLOAD_TEMP_DIR)
    }

    /// 解析为根目录内已存在的目录。
    pub async fn resolve_dir(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve_contained(relative).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(StorageError::NotFound(relative.to_string()));
        }
        Ok(target)
    }

    /// 解析为根目录内已存在的普通文件。
    pub async fn resolve_file(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve_contained(relative).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(relative.to_string()));
        }
        Ok(target)
    }

    /// 先按词法规范化 `relative`，再解析真实路径（跟随符号链接）并确认仍在根目录内。
    async fn resolve_contained(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let normalized = normalize_relative(relative)?;
        let candidate = self.root.join(&normalized);
        let canonical = match fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(relative.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        if !self.is_served(&canonical) {
            return Err(StorageError::InvalidPath);
        }
        Ok(canonical)
    }

    /// 判断规范路径是否位于根目录内且不在暂存目录中。
    fn is_served(&self, canonical: &Path) -> bool {
        match canonical.strip_prefix(&self.root) {
            Ok(rest) => rest.iter().next() != Some(OsStr::new(UPLOAD_TEMP_DIR)),
            Err(_) => false,
        }
    }

    /// 列出目录的直接子项（非递归），目录优先、名称不区分大小写排序。
    pub async fn list_dir(&self, relative: &str) -> Result<Vec<DirectoryEntry>, StorageError> {
        let target = self.resolve_dir(relative).await?;
        let at_root = target == self.root;
        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if at_root && name == UPLOAD_TEMP_DIR {
                continue;
            }
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!(name, error = %err, "skip unreadable entry");
                    continue;
                }
            };
            let is_symlink = file_type.is_symlink();
            let metadata = if is_symlink {
                self.contained_target_metadata(&entry.path()).await
            } else {
                entry.metadata().await.ok()
            };
            let Some(metadata) = metadata else {
                if is_symlink {
                    entries.push(DirectoryEntry {
                        name,
                        is_directory: false,
                        is_symlink,
                        size_bytes: None,
                        modified: None,
                    });
                }
                continue;
            };

            let is_directory = metadata.is_dir();
            entries.push(DirectoryEntry {
                name,
                is_directory,
                is_symlink,
                size_bytes: (!is_directory).then(|| metadata.len()),
                modified: metadata
                    .modified()
                    .ok()
                    .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                    .map(|duration| duration.as_secs()),
            });
        }

        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// 符号链接目标仅在根目录内时才读取其元数据。
    async fn contained_target_metadata(&self, link: &Path) -> Option<std::fs::Metadata> {
        let target = fs::canonicalize(link).await.ok()?;
        if !self.is_served(&target) {
            return None;
        }
        fs::metadata(&target).await.ok()
    }
}

/// 将客户端路径按词法转换为相对根目录的路径，不访问文件系统。
///
/// `.` 与空段被忽略，`..` 弹出上一段，无段可弹时拒绝。`/` 与 `\` 均视为分隔符，
/// 开头的分隔符被忽略。
pub fn normalize_relative(raw: &str) -> Result<PathBuf, StorageError> {
    if raw.contains('\0') {
        return Err(StorageError::InvalidPath);
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::InvalidPath);
                }
            }
            // Drive prefixes such as `C:` would reset the join on Windows.
            segment if segment.contains(':') && cfg!(windows) => {
                return Err(StorageError::InvalidPath);
            }
            segment => segments.push(segment),
        }
    }
    if segments.first() == Some(&UPLOAD_TEMP_DIR) {
        return Err(StorageError::InvalidPath);
    }
    Ok(segments.iter().collect())
}
