//! 进程级上传/下载字节计数与状态查询。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const SNAPSHOT_ATTEMPTS: usize = 8;

/// 累计字节计数，进程重启前只增不减。
#[derive(Debug, Default)]
pub struct ResourceStatus {
    upload: AtomicU64,
    download: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub upload: u64,
    pub download: u64,
}

impl ResourceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn record_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::AcqRel);
    }

    /// 双重读取：连续两次读到相同的值即为同一时刻的一致快照。持续竞争时重试数次后
    /// 返回最后一次读取，各字段仍保持单调。
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut previous = self.read_once();
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let current = self.read_once();
            if current == previous {
                return current;
            }
            previous = current;
        }
        previous
    }

    fn read_once(&self) -> StatusSnapshot {
        StatusSnapshot {
            upload: self.upload.load(Ordering::Acquire),
            download: self.download.load(Ordering::Acquire),
        }
    }
}

/// 返回累计上传/下载字节数。
pub async fn get_status(
    Extension(status): Extension<Arc<ResourceStatus>>,
) -> JsonResponse<StatusSnapshot> {
    JsonResponse(status.snapshot())
}
