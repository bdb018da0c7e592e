use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    Assembler, ByteStream, CatalogAsset, CatalogNotifier, ChunkAck, ChunkIndex, ChunkRef,
    ChunkStore, DefaultKeyStrategy, FinalizeReceipt, FsChunkStore, MemorySessionRegistry,
    NewUpload, ObjectKeyStrategy, ObjectStoreGateway, SessionId, SessionRegistry, SessionState,
    StoredObject, UploadConfig, UploadError, UploadResult, UploadSession,
};

/// Drives upload sessions from initialize through finalize
///
/// Locks are only taken inside the registry for bookkeeping; staging, assembly
/// and the object store transfer all run without holding any session lock.
pub struct UploadCoordinator {
    registry: Arc<dyn SessionRegistry>,
    chunks: Arc<dyn ChunkStore>,
    gateway: Arc<dyn ObjectStoreGateway>,
    catalog: Arc<dyn CatalogNotifier>,
    keys: Arc<dyn ObjectKeyStrategy>,
    assembler: Assembler,
    config: UploadConfig,
}

impl UploadCoordinator {
    /// Create a coordinator with an in-memory registry and the default key strategy
    pub fn new<C, G, N>(config: UploadConfig, chunks: C, gateway: G, catalog: N) -> Self
    where
        C: ChunkStore + 'static,
        G: ObjectStoreGateway + 'static,
        N: CatalogNotifier + 'static,
    {
        Self::from_parts(
            config,
            Arc::new(MemorySessionRegistry::new()),
            Arc::new(chunks),
            Arc::new(gateway),
            Arc::new(catalog),
        )
    }

    /// Create a coordinator staging chunks under `config.staging_root`
    pub async fn open(
        config: UploadConfig,
        gateway: Arc<dyn ObjectStoreGateway>,
        catalog: Arc<dyn CatalogNotifier>,
    ) -> UploadResult<Self> {
        let chunks = FsChunkStore::open(&config.staging_root).await?;
        Ok(Self::from_parts(
            config,
            Arc::new(MemorySessionRegistry::new()),
            Arc::new(chunks),
            gateway,
            catalog,
        ))
    }

    /// Create a coordinator from shared components
    pub fn from_parts(
        config: UploadConfig,
        registry: Arc<dyn SessionRegistry>,
        chunks: Arc<dyn ChunkStore>,
        gateway: Arc<dyn ObjectStoreGateway>,
        catalog: Arc<dyn CatalogNotifier>,
    ) -> Self {
        Self {
            assembler: Assembler::new(Arc::clone(&chunks)),
            registry,
            chunks,
            gateway,
            catalog,
            keys: Arc::new(DefaultKeyStrategy),
            config,
        }
    }

    /// Use a custom session registry
    pub fn with_registry<R: SessionRegistry + 'static>(mut self, registry: R) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Use a custom object key strategy
    pub fn with_key_strategy<K: ObjectKeyStrategy + 'static>(mut self, keys: K) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    /// Get configuration
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Open a new upload session
    pub async fn initialize(&self, upload: NewUpload) -> UploadResult<UploadSession> {
        if upload.filename.trim().is_empty() {
            return Err(UploadError::invalid("Filename is required"));
        }
        if let Some(size) = upload.declared_size {
            if size > self.config.max_upload_bytes {
                return Err(UploadError::invalid(format!(
                    "Upload size {} exceeds maximum {}",
                    size, self.config.max_upload_bytes
                )));
            }
        }
        if let Some(total) = upload.total_chunks {
            if total == 0 || total > self.config.max_chunks {
                return Err(UploadError::invalid(format!(
                    "Invalid total chunks: {} (must be 1-{})",
                    total, self.config.max_chunks
                )));
            }
        }

        let id = SessionId::new();
        let now = Utc::now();
        let mime_type = upload
            .mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_content_type.clone());

        let session = UploadSession {
            object_key: self.keys.object_key(&id, &upload.filename, now),
            id,
            filename: upload.filename,
            mime_type,
            declared_size: upload.declared_size,
            catalog: upload.catalog,
            chunks: Default::default(),
            expected_chunks: upload.total_chunks,
            state: SessionState::Initialized,
            stored: None,
            last_error: None,
            registering: false,
            started_at: now,
            updated_at: now,
        };

        self.registry.create(session.clone()).await?;
        info!(
            session_id = %session.id,
            object_key = %session.object_key,
            filename = %session.filename,
            "upload session initialized"
        );
        Ok(session)
    }

    /// Stage and record one chunk
    ///
    /// The chunk is either staged and recorded, or neither: a staged file whose
    /// registration fails is discarded, and a recorded chunk that supersedes an
    /// earlier submission of the same index discards the earlier file.
    pub async fn submit_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        total_hint: Option<u32>,
        body: ByteStream,
    ) -> UploadResult<ChunkAck> {
        if index >= self.config.max_chunks {
            return Err(UploadError::invalid_index(
                session_id,
                format!("index {} exceeds maximum of {} chunks", index, self.config.max_chunks),
            ));
        }
        if let Some(total) = total_hint {
            if total == 0 || total > self.config.max_chunks {
                return Err(UploadError::invalid_index(
                    session_id,
                    format!("total chunks {} must be 1-{}", total, self.config.max_chunks),
                ));
            }
        }

        // Cheap rejection before any bytes touch the disk
        let session = self.registry.get(session_id).await?;
        if !session.state.accepts_chunks() {
            return Err(match session.state {
                SessionState::Finalizing => UploadError::AlreadyFinalizing {
                    session_id: session_id.clone(),
                },
                state => UploadError::AlreadyFinalized {
                    session_id: session_id.clone(),
                    state,
                },
            });
        }
        if let Some(expected) = total_hint.or(session.expected_chunks) {
            if index >= expected {
                return Err(UploadError::invalid_index(
                    session_id,
                    format!("index {} outside 0..{}", index, expected),
                ));
            }
        }

        let chunk = self
            .chunks
            .stage(session_id, index, body, self.config.max_chunk_bytes)
            .await?;
        let size_bytes = chunk.size_bytes;

        let recorded = match self
            .registry
            .record_chunk(chunk.clone(), total_hint, self.config.max_upload_bytes)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                self.discard_chunk(&chunk).await;
                return Err(e);
            }
        };

        if let Some(replaced) = recorded.replaced {
            debug!(session_id = %session_id, index, "chunk resubmitted, discarding previous copy");
            self.discard_chunk(&replaced).await;
        }

        debug!(
            session_id = %session_id,
            index,
            size_bytes,
            received = recorded.received,
            "chunk accepted"
        );

        Ok(ChunkAck {
            session_id: session_id.clone(),
            accepted: true,
            index,
            size_bytes,
            received: recorded.received,
            expected: recorded.expected,
        })
    }

    /// Stage and record one chunk held in memory
    pub async fn submit_chunk_bytes(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        total_hint: Option<u32>,
        data: Bytes,
    ) -> UploadResult<ChunkAck> {
        let body: ByteStream = Box::pin(futures_util::stream::once(async move { Ok(data) }));
        self.submit_chunk(session_id, index, total_hint, body).await
    }

    /// Assemble, store and register a session
    ///
    /// Staged chunks are kept until the object is stored, so `AssemblyFailed`
    /// and `StoreFailed` can be retried with another `finalize` call. Once the
    /// object is stored, finalize is never repeated; a catalog failure is
    /// reported as `RegistrationFailed` and retried with
    /// [`UploadCoordinator::retry_registration`].
    pub async fn finalize(&self, session_id: &SessionId) -> UploadResult<FinalizeReceipt> {
        let session = self.registry.begin_finalize(session_id).await?;
        info!(
            session_id = %session_id,
            chunks = session.received_chunks(),
            bytes = session.received_bytes(),
            "finalizing upload"
        );

        let assembly = match self.assembler.assemble(&session) {
            Ok(assembly) => assembly,
            Err(e) => {
                self.record_failure(session_id, SessionState::FailedAssembly, &e).await;
                return Err(e);
            }
        };

        let total_bytes = assembly.total_bytes;
        let chunk_count = assembly.chunk_count;
        let fault = assembly.fault.clone();

        let stored = match self
            .gateway
            .put(&session.object_key, assembly.stream, &session.mime_type)
            .await
        {
            Ok(stored) => stored,
            Err(store_err) => {
                let err = match fault.reason() {
                    Some(reason) => UploadError::AssemblyFailed {
                        session_id: session_id.clone(),
                        reason,
                    },
                    None => UploadError::StoreFailed {
                        session_id: session_id.clone(),
                        source: Box::new(store_err),
                    },
                };
                let state = err.state().unwrap_or(SessionState::FailedStore);
                self.record_failure(session_id, state, &err).await;
                warn!(session_id = %session_id, state = %state, error = %err, "finalize failed, chunks kept for retry");
                return Err(err);
            }
        };

        if stored.size_bytes != total_bytes {
            warn!(
                session_id = %session_id,
                stored = stored.size_bytes,
                expected = total_bytes,
                "object store reported a different size than assembled"
            );
        }

        info!(session_id = %session_id, url = %stored.url, size_bytes = stored.size_bytes, "object stored");

        let stored_session = match self.registry.mark_stored(session_id, stored.clone()).await {
            Ok(session) => session,
            Err(e) => {
                // The object exists; its URL must reach the caller
                warn!(
                    session_id = %session_id,
                    url = %stored.url,
                    object_key = %stored.key,
                    error = %e,
                    "object stored but session could not be updated"
                );
                return Err(UploadError::RegistrationFailed {
                    session_id: session_id.clone(),
                    object_key: stored.key,
                    stored_url: stored.url,
                    reason: e.to_string(),
                });
            }
        };
        self.discard_chunks(session_id, session.chunks.values()).await;

        self.register(stored_session, stored, chunk_count).await
    }

    /// Re-attempt catalog registration for a session whose object is already stored
    pub async fn retry_registration(&self, session_id: &SessionId) -> UploadResult<FinalizeReceipt> {
        let session = self.registry.begin_registration(session_id).await?;
        let stored = session
            .stored
            .clone()
            .ok_or_else(|| UploadError::invalid(format!("Session {} has no stored object", session_id)))?;
        let chunk_count = session.expected_chunks.unwrap_or(0);
        self.register(session, stored, chunk_count).await
    }

    async fn register(
        &self,
        session: UploadSession,
        stored: StoredObject,
        chunk_count: u32,
    ) -> UploadResult<FinalizeReceipt> {
        let asset = CatalogAsset {
            session_id: session.id.clone(),
            url: stored.url.clone(),
            object_key: stored.key.clone(),
            filename: session.filename.clone(),
            mime_type: session.mime_type.clone(),
            size_bytes: stored.size_bytes,
            catalog: session.catalog.clone(),
        };

        match self.catalog.register(&asset).await {
            Ok(record) => {
                if let Err(e) = self.registry.complete(&session.id).await {
                    warn!(session_id = %session.id, record_id = %record.id, error = %e, "registered but failed to close session");
                }
                info!(session_id = %session.id, record_id = %record.id, "upload registered");
                Ok(FinalizeReceipt {
                    session_id: session.id,
                    url: stored.url,
                    object_key: stored.key,
                    size_bytes: stored.size_bytes,
                    chunk_count,
                    catalog_record: record,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(release) = self.registry.registration_failed(&session.id, reason.clone()).await {
                    warn!(session_id = %session.id, error = %release, "failed to release registration claim");
                }
                warn!(session_id = %session.id, url = %stored.url, error = %reason, "catalog registration failed");
                Err(UploadError::RegistrationFailed {
                    session_id: session.id,
                    object_key: stored.key,
                    stored_url: stored.url,
                    reason,
                })
            }
        }
    }

    /// Drop a session and everything staged for it; unknown ids are a no-op
    pub async fn abandon(&self, session_id: &SessionId) -> UploadResult<()> {
        if let Some(session) = self.registry.remove(session_id).await? {
            self.discard_chunks(session_id, session.chunks.values()).await;
            info!(session_id = %session_id, state = %session.state, "upload session abandoned");
        }
        Ok(())
    }

    /// Current state of a session
    pub async fn status(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        self.registry.get(session_id).await
    }

    /// Number of live sessions
    pub async fn active_sessions(&self) -> usize {
        self.registry.len().await
    }

    /// Evict sessions idle longer than the staleness window
    pub async fn sweep_stale(&self) -> UploadResult<usize> {
        let window = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| UploadError::invalid(format!("Invalid staleness window: {}", e)))?;
        let cutoff = Utc::now() - window;

        let evicted = self.registry.evict_stale(cutoff).await?;
        for session in &evicted {
            self.discard_chunks(&session.id, session.chunks.values()).await;
            info!(session_id = %session.id, state = %session.state, "evicted stale upload session");
        }
        Ok(evicted.len())
    }

    async fn record_failure(&self, session_id: &SessionId, state: SessionState, err: &UploadError) {
        if let Err(e) = self
            .registry
            .finalize_failed(session_id, state, err.to_string())
            .await
        {
            warn!(session_id = %session_id, error = %e, "failed to record finalize failure");
        }
    }

    async fn discard_chunk(&self, chunk: &ChunkRef) {
        if let Err(e) = self.chunks.discard(chunk).await {
            warn!(session_id = %chunk.session_id, index = chunk.index, error = %e, "failed to discard staged chunk");
        }
    }

    /// Best-effort cleanup; failures are logged and never surfaced
    async fn discard_chunks<'a, I>(&self, session_id: &SessionId, chunks: I)
    where
        I: IntoIterator<Item = &'a ChunkRef>,
    {
        for chunk in chunks {
            self.discard_chunk(chunk).await;
        }
        if let Err(e) = self.chunks.discard_session(session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to remove staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryCatalog, MemoryObjectStore};

    async fn coordinator(dir: &tempfile::TempDir) -> UploadCoordinator {
        let config = UploadConfig::new().with_staging_root(dir.path());
        let chunks = FsChunkStore::open(dir.path()).await.unwrap();
        UploadCoordinator::new(config, chunks, MemoryObjectStore::new(), MemoryCatalog::new())
    }

    #[tokio::test]
    async fn initialize_rejects_oversized_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let too_big = coordinator.config().max_upload_bytes + 1;

        let result = coordinator
            .initialize(NewUpload::new("lecture.mp4").with_declared_size(too_big))
            .await;
        assert!(matches!(result, Err(UploadError::Invalid { .. })));

        let result = coordinator.initialize(NewUpload::new("  ")).await;
        assert!(matches!(result, Err(UploadError::Invalid { .. })));
    }

    #[tokio::test]
    async fn initialize_derives_key_from_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;

        let session = coordinator
            .initialize(NewUpload::new("lecture.mp4").with_mime_type("video/mp4"))
            .await
            .unwrap();

        assert!(session.object_key.contains(session.id.as_str()));
        assert!(session.object_key.ends_with("/lecture.mp4"));
        assert_eq!(session.state, SessionState::Initialized);
        assert_eq!(coordinator.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn chunk_for_unknown_session_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let ghost = SessionId::new();

        let result = coordinator
            .submit_chunk_bytes(&ghost, 0, None, Bytes::from_static(b"data"))
            .await;
        assert!(matches!(result, Err(UploadError::SessionNotFound { .. })));
        assert!(!dir.path().join(ghost.as_str()).exists());
    }

    #[tokio::test]
    async fn index_beyond_limit_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let session = coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();
        let max = coordinator.config().max_chunks;

        let result = coordinator
            .submit_chunk_bytes(&session.id, max, None, Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::InvalidIndex { .. })));
    }

    #[tokio::test]
    async fn total_hint_is_capped_by_max_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let session = coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();
        let max = coordinator.config().max_chunks;

        for total in [0, max + 1, u32::MAX] {
            let result = coordinator
                .submit_chunk_bytes(&session.id, 0, Some(total), Bytes::from_static(b"x"))
                .await;
            assert!(matches!(result, Err(UploadError::InvalidIndex { .. })));
        }
        assert!(!dir.path().join(session.id.as_str()).exists());

        let ack = coordinator
            .submit_chunk_bytes(&session.id, 0, Some(max), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(ack.expected, Some(max));
    }

    #[tokio::test]
    async fn open_stages_under_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("staging");
        let coordinator = UploadCoordinator::open(
            UploadConfig::new().with_staging_root(&root),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryCatalog::new()),
        )
        .await
        .unwrap();

        let session = coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();
        coordinator
            .submit_chunk_bytes(&session.id, 0, None, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(root.join(session.id.as_str()).exists());
    }

    #[tokio::test]
    async fn abandon_removes_staged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(&dir).await;
        let session = coordinator.initialize(NewUpload::new("a.bin")).await.unwrap();
        coordinator
            .submit_chunk_bytes(&session.id, 0, None, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(dir.path().join(session.id.as_str()).exists());

        coordinator.abandon(&session.id).await.unwrap();
        coordinator.abandon(&session.id).await.unwrap();

        assert!(!dir.path().join(session.id.as_str()).exists());
        assert!(matches!(
            coordinator.status(&session.id).await,
            Err(UploadError::SessionNotFound { .. })
        ));
    }
}
