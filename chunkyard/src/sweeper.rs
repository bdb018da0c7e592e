use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{UploadCoordinator, UploadResult};

/// Periodically evicts upload sessions that went idle
pub struct SessionSweeper {
    coordinator: Arc<UploadCoordinator>,
    interval: Duration,
}

impl SessionSweeper {
    /// Create a sweeper that runs at the coordinator's configured interval
    pub fn new(coordinator: Arc<UploadCoordinator>) -> Self {
        let interval = coordinator.config().sweep_interval;
        Self { coordinator, interval }
    }

    /// Create sweeper with custom interval
    pub fn with_interval(coordinator: Arc<UploadCoordinator>, interval: Duration) -> Self {
        Self { coordinator, interval }
    }

    /// Run until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, "starting upload session sweeper");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("upload session sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(0) => debug!("no stale upload sessions"),
                Ok(evicted) => info!(evicted, "evicted stale upload sessions"),
                Err(e) => warn!(error = %e, "error during upload session sweep"),
            }
        }
    }

    /// Run one sweep cycle
    pub async fn run_once(&self) -> UploadResult<usize> {
        self.coordinator.sweep_stale().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsChunkStore, MemoryCatalog, MemoryObjectStore, NewUpload, UploadConfig};
    use bytes::Bytes;

    async fn coordinator(dir: &tempfile::TempDir, stale_after: Duration) -> Arc<UploadCoordinator> {
        let config = UploadConfig::new()
            .with_staging_root(dir.path())
            .with_stale_after(stale_after);
        let chunks = FsChunkStore::open(dir.path()).await.unwrap();
        Arc::new(UploadCoordinator::new(
            config,
            chunks,
            MemoryObjectStore::new(),
            MemoryCatalog::new(),
        ))
    }

    #[tokio::test]
    async fn run_once_evicts_idle_sessions_and_their_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir, Duration::ZERO).await;
        let session = coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();
        coordinator
            .submit_chunk_bytes(&session.id, 0, None, Bytes::from_static(b"x"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let sweeper = SessionSweeper::new(Arc::clone(&coordinator));
        assert_eq!(sweeper.run_once().await.unwrap(), 1);
        assert_eq!(coordinator.active_sessions().await, 0);
        assert!(!dir.path().join(session.id.as_str()).exists());
    }

    #[tokio::test]
    async fn run_once_keeps_fresh_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir, Duration::from_secs(3600)).await;
        coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();

        let sweeper = SessionSweeper::new(Arc::clone(&coordinator));
        assert_eq!(sweeper.run_once().await.unwrap(), 0);
        assert_eq!(coordinator.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn start_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir, Duration::from_secs(3600)).await;
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(
            SessionSweeper::with_interval(coordinator, Duration::from_millis(10)).start(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
