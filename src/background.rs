//! 闲置上传会话的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::UPLOAD_SWEEP_INTERVAL_SECS;
use crate::session::UploadManager;

/// 周期性中止闲置会话，直到 `shutdown` 被取消。
pub fn spawn_background_tasks(
    manager: Arc<UploadManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let aborted = manager.sweep_expired().await;
                    if aborted > 0 {
                        info!(aborted, open = manager.open_sessions(), "upload sweep finished");
                    } else {
                        debug!(open = manager.open_sessions(), "upload sweep finished");
                    }
                }
            }
        }
        debug!("upload sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStore;
    use crate::session::UploadConfig;
    use crate::status::ResourceStatus;
    use crate::storage::Storage;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sweeper_stops_when_cancelled() {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(
            Storage::open(temp.path().join("root"))
                .await
                .expect("open storage"),
        );
        let store = ChunkStore::new(storage.default_temp_dir());
        store.prepare().await.expect("prepare");
        let manager = Arc::new(UploadManager::new(
            store,
            storage,
            Arc::new(ResourceStatus::new()),
            UploadConfig {
                max_total_size: 0,
                max_chunk_size: 16,
                max_concurrent: 0,
                idle_ttl: Duration::from_secs(60),
            },
        ));

        let shutdown = CancellationToken::new();
        let task = spawn_background_tasks(manager, shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper did not stop")
            .expect("sweeper panicked");
    }
}
