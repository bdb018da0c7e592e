use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    ChunkRecorded, ChunkRef, SessionId, SessionState, StoredObject, UploadError, UploadResult,
    UploadSession,
};

/// Source of truth for which upload sessions exist and what they hold
///
/// Every method is a single atomic step on one session; implementations must
/// serialize mutations of the same session while letting different sessions
/// proceed independently.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Store a freshly initialized session
    async fn create(&self, session: UploadSession) -> UploadResult<SessionId>;

    /// Get a snapshot of a session
    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession>;

    /// Record a staged chunk, replacing any earlier chunk at the same index
    ///
    /// Fails if the session's received bytes would exceed `max_bytes`.
    async fn record_chunk(
        &self,
        chunk: ChunkRef,
        total_hint: Option<u32>,
        max_bytes: u64,
    ) -> UploadResult<ChunkRecorded>;

    /// Check contiguity and move the session to `Finalizing`
    async fn begin_finalize(&self, id: &SessionId) -> UploadResult<UploadSession>;

    /// Leave `Finalizing` for a failure state, keeping the chunks
    async fn finalize_failed(
        &self,
        id: &SessionId,
        state: SessionState,
        reason: String,
    ) -> UploadResult<()>;

    /// Record the stored object; the session keeps no chunks after this
    async fn mark_stored(&self, id: &SessionId, stored: StoredObject) -> UploadResult<UploadSession>;

    /// Claim a stored session for a registration attempt
    async fn begin_registration(&self, id: &SessionId) -> UploadResult<UploadSession>;

    /// Release a failed registration claim
    async fn registration_failed(&self, id: &SessionId, reason: String) -> UploadResult<()>;

    /// Remove a registered session, remembering it as finalized
    async fn complete(&self, id: &SessionId) -> UploadResult<()>;

    /// Remove a session; unknown ids are a no-op
    async fn remove(&self, id: &SessionId) -> UploadResult<Option<UploadSession>>;

    /// Remove every evictable session idle since before `cutoff`
    ///
    /// Sessions holding a stored object are kept so its registration can
    /// still be retried.
    async fn evict_stale(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<UploadSession>>;

    /// Number of live sessions
    async fn len(&self) -> usize;
}

struct Slot {
    session: UploadSession,
    live: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

/// In-memory session registry for single-instance deployments
///
/// The table lock is only held to look up or remove a slot; chunk bookkeeping
/// happens under the per-session slot mutex. A removed slot is flagged dead so
/// a writer that looked it up just before removal sees `SessionNotFound`
/// instead of recording into a detached session.
#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: RwLock<HashMap<SessionId, SlotRef>>,
    finalized: Mutex<HashMap<SessionId, DateTime<Utc>>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &SessionId) -> Option<SlotRef> {
        self.sessions.read().get(id).cloned()
    }

    /// Helper method to execute operations on a live session
    fn with_session_mut<F, R>(&self, id: &SessionId, f: F) -> UploadResult<R>
    where
        F: FnOnce(&mut UploadSession) -> UploadResult<R>,
    {
        let slot = self.slot(id).ok_or_else(|| self.missing(id))?;
        let mut slot = slot.lock();
        if !slot.live {
            return Err(self.missing(id));
        }
        f(&mut slot.session)
    }

    fn was_finalized(&self, id: &SessionId) -> bool {
        self.finalized.lock().contains_key(id)
    }

    /// Error for an id with no live slot
    fn missing(&self, id: &SessionId) -> UploadError {
        if self.was_finalized(id) {
            UploadError::AlreadyFinalized {
                session_id: id.clone(),
                state: SessionState::Registered,
            }
        } else {
            UploadError::session_not_found(id)
        }
    }

    fn detach(slot: &SlotRef) -> UploadSession {
        let mut slot = slot.lock();
        slot.live = false;
        slot.session.clone()
    }
}

fn reject_busy(session: &UploadSession) -> UploadError {
    match session.state {
        SessionState::Finalizing => UploadError::AlreadyFinalizing {
            session_id: session.id.clone(),
        },
        state => UploadError::AlreadyFinalized {
            session_id: session.id.clone(),
            state,
        },
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn create(&self, session: UploadSession) -> UploadResult<SessionId> {
        let id = session.id.clone();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(UploadError::invalid(format!("Session {} already exists", id)));
        }
        sessions.insert(id.clone(), Arc::new(Mutex::new(Slot { session, live: true })));
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.with_session_mut(id, |session| Ok(session.clone()))
    }

    async fn record_chunk(
        &self,
        chunk: ChunkRef,
        total_hint: Option<u32>,
        max_bytes: u64,
    ) -> UploadResult<ChunkRecorded> {
        let id = chunk.session_id.clone();
        self.with_session_mut(&id, |session| {
            if !session.state.accepts_chunks() {
                return Err(reject_busy(session));
            }

            if let Some(total) = total_hint {
                if total == 0 {
                    return Err(UploadError::invalid_index(&id, "total chunk count must be positive"));
                }
                match session.expected_chunks {
                    Some(expected) if expected != total => {
                        return Err(UploadError::invalid_index(
                            &id,
                            format!("total chunk count {} conflicts with declared {}", total, expected),
                        ));
                    }
                    _ => {}
                }
                if let Some(max) = session.chunks.keys().next_back() {
                    if *max >= total {
                        return Err(UploadError::invalid_index(
                            &id,
                            format!("chunk {} already recorded beyond total {}", max, total),
                        ));
                    }
                }
            }

            let expected = total_hint.or(session.expected_chunks);
            if let Some(expected) = expected {
                if chunk.index >= expected {
                    return Err(UploadError::invalid_index(
                        &id,
                        format!("index {} outside 0..{}", chunk.index, expected),
                    ));
                }
            }

            let previous = session.chunks.get(&chunk.index).map_or(0, |c| c.size_bytes);
            let received = (session.received_bytes() - previous).saturating_add(chunk.size_bytes);
            if received > max_bytes {
                return Err(UploadError::invalid(format!(
                    "Session {} would hold {} bytes, exceeding maximum {}",
                    id, received, max_bytes
                )));
            }

            session.expected_chunks = expected;
            let replaced = session.chunks.insert(chunk.index, chunk);
            session.state = SessionState::Receiving;
            session.updated_at = Utc::now();

            Ok(ChunkRecorded {
                replaced,
                received: session.received_chunks(),
                expected: session.expected_chunks,
            })
        })
    }

    async fn begin_finalize(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.with_session_mut(id, |session| {
            if !session.state.can_finalize() {
                return Err(reject_busy(session));
            }

            let missing = session.missing_chunks();
            if !missing.is_empty() {
                return Err(UploadError::IncompleteUpload {
                    session_id: id.clone(),
                    state: session.state,
                    missing,
                });
            }

            session.state = SessionState::Finalizing;
            session.updated_at = Utc::now();
            Ok(session.clone())
        })
    }

    async fn finalize_failed(
        &self,
        id: &SessionId,
        state: SessionState,
        reason: String,
    ) -> UploadResult<()> {
        self.with_session_mut(id, |session| {
            session.state = state;
            session.last_error = Some(reason);
            session.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn mark_stored(&self, id: &SessionId, stored: StoredObject) -> UploadResult<UploadSession> {
        self.with_session_mut(id, |session| {
            session.state = SessionState::Stored;
            session.stored = Some(stored);
            // The chunk count is fixed once stored
            session.expected_chunks = Some(session.received_chunks());
            session.chunks.clear();
            session.registering = true;
            session.last_error = None;
            session.updated_at = Utc::now();
            Ok(session.clone())
        })
    }

    async fn begin_registration(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.with_session_mut(id, |session| {
            if session.state != SessionState::Stored || session.stored.is_none() {
                return Err(UploadError::invalid(format!(
                    "Session {} has no stored object to register ({})",
                    id, session.state
                )));
            }
            if session.registering {
                return Err(UploadError::AlreadyFinalizing {
                    session_id: id.clone(),
                });
            }
            session.registering = true;
            session.updated_at = Utc::now();
            Ok(session.clone())
        })
    }

    async fn registration_failed(&self, id: &SessionId, reason: String) -> UploadResult<()> {
        self.with_session_mut(id, |session| {
            session.registering = false;
            session.last_error = Some(reason);
            session.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn complete(&self, id: &SessionId) -> UploadResult<()> {
        // Tombstone first so a concurrent lookup never sees neither
        self.finalized.lock().insert(id.clone(), Utc::now());
        let slot = self.sessions.write().remove(id);
        if let Some(slot) = slot {
            let mut slot = slot.lock();
            slot.live = false;
            slot.session.state = SessionState::Registered;
        }
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> UploadResult<Option<UploadSession>> {
        let mut sessions = self.sessions.write();
        let Some(slot) = sessions.get(id).cloned() else {
            return Ok(None);
        };

        {
            let slot = slot.lock();
            if !slot.session.is_evictable() {
                return Err(UploadError::AlreadyFinalizing {
                    session_id: id.clone(),
                });
            }
        }

        sessions.remove(id);
        Ok(Some(Self::detach(&slot)))
    }

    async fn evict_stale(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<UploadSession>> {
        let mut sessions = self.sessions.write();

        let stale: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, slot)| {
                let slot = slot.lock();
                let session = &slot.session;
                session.is_evictable() && session.stored.is_none() && session.updated_at < cutoff
            })
            .map(|(id, _)| id.clone())
            .collect();

        let evicted = stale
            .iter()
            .filter_map(|id| sessions.remove(id))
            .map(|slot| Self::detach(&slot))
            .collect();

        drop(sessions);
        self.finalized.lock().retain(|_, at| *at >= cutoff);

        Ok(evicted)
    }

    async fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CatalogRefs;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn new_session() -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: SessionId::new(),
            object_key: "uploads/test".to_string(),
            filename: "lecture.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            declared_size: None,
            catalog: CatalogRefs::default(),
            chunks: BTreeMap::new(),
            expected_chunks: None,
            state: SessionState::Initialized,
            stored: None,
            last_error: None,
            registering: false,
            started_at: now,
            updated_at: now,
        }
    }

    fn chunk(id: &SessionId, index: u32) -> ChunkRef {
        ChunkRef {
            session_id: id.clone(),
            index,
            path: PathBuf::from(format!("/staging/{}/{}-x.chunk", id, index)),
            size_bytes: 8,
            staged_at: Utc::now(),
        }
    }

    fn stored() -> StoredObject {
        StoredObject {
            key: "uploads/test".to_string(),
            url: "memory://uploads/test".to_string(),
            size_bytes: 8,
            etag: None,
        }
    }

    #[tokio::test]
    async fn record_chunk_requires_existing_session() {
        let registry = MemorySessionRegistry::new();
        let missing = SessionId::new();
        let result = registry.record_chunk(chunk(&missing, 0), None, u64::MAX).await;
        assert!(matches!(result, Err(UploadError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn resubmission_replaces_previous_chunk() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();

        let first = registry.record_chunk(chunk(&id, 0), None, u64::MAX).await.unwrap();
        assert!(first.replaced.is_none());

        let second = registry.record_chunk(chunk(&id, 0), None, u64::MAX).await.unwrap();
        assert!(second.replaced.is_some());
        assert_eq!(second.received, 1);

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Receiving);
    }

    #[tokio::test]
    async fn total_hint_bounds_indices() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();

        registry.record_chunk(chunk(&id, 1), Some(3), u64::MAX).await.unwrap();
        let out_of_range = registry.record_chunk(chunk(&id, 3), None, u64::MAX).await;
        assert!(matches!(out_of_range, Err(UploadError::InvalidIndex { .. })));

        let conflicting = registry.record_chunk(chunk(&id, 0), Some(5), u64::MAX).await;
        assert!(matches!(conflicting, Err(UploadError::InvalidIndex { .. })));
    }

    #[tokio::test]
    async fn begin_finalize_rejects_gaps_and_second_caller() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();
        registry.record_chunk(chunk(&id, 0), None, u64::MAX).await.unwrap();
        registry.record_chunk(chunk(&id, 2), None, u64::MAX).await.unwrap();

        match registry.begin_finalize(&id).await {
            Err(UploadError::IncompleteUpload { missing, state, .. }) => {
                assert_eq!(missing, vec![1]);
                assert_eq!(state, SessionState::Receiving);
            }
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }

        registry.record_chunk(chunk(&id, 1), None, u64::MAX).await.unwrap();
        let session = registry.begin_finalize(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Finalizing);

        let again = registry.begin_finalize(&id).await;
        assert!(matches!(again, Err(UploadError::AlreadyFinalizing { .. })));

        let late_chunk = registry.record_chunk(chunk(&id, 3), None, u64::MAX).await;
        assert!(matches!(late_chunk, Err(UploadError::AlreadyFinalizing { .. })));
    }

    #[tokio::test]
    async fn completed_sessions_report_already_finalized() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();
        registry.record_chunk(chunk(&id, 0), None, u64::MAX).await.unwrap();
        registry.begin_finalize(&id).await.unwrap();
        registry.mark_stored(&id, stored()).await.unwrap();
        registry.complete(&id).await.unwrap();

        assert!(matches!(
            registry.get(&id).await,
            Err(UploadError::AlreadyFinalized { .. })
        ));
        assert!(matches!(
            registry.begin_finalize(&id).await,
            Err(UploadError::AlreadyFinalized {
                state: SessionState::Registered,
                ..
            })
        ));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();
        assert!(registry.remove(&id).await.unwrap().is_some());
        assert!(registry.remove(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_skips_finalizing_sessions() {
        let registry = MemorySessionRegistry::new();
        let idle = registry.create(new_session()).await.unwrap();
        let busy = registry.create(new_session()).await.unwrap();
        registry.record_chunk(chunk(&busy, 0), None, u64::MAX).await.unwrap();
        registry.begin_finalize(&busy).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let evicted = registry.evict_stale(cutoff).await.unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, idle);
        assert!(registry.get(&busy).await.is_ok());
        assert!(matches!(
            registry.remove(&busy).await,
            Err(UploadError::AlreadyFinalizing { .. })
        ));
    }

    #[tokio::test]
    async fn received_bytes_are_bounded() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();

        registry.record_chunk(chunk(&id, 0), None, 16).await.unwrap();
        // Replacing an index only counts the new copy
        registry.record_chunk(chunk(&id, 0), None, 16).await.unwrap();
        registry.record_chunk(chunk(&id, 1), None, 16).await.unwrap();

        let over = registry.record_chunk(chunk(&id, 2), None, 16).await;
        assert!(matches!(over, Err(UploadError::Invalid { .. })));
        assert_eq!(registry.get(&id).await.unwrap().received_bytes(), 16);
    }

    #[tokio::test]
    async fn eviction_keeps_stored_unregistered_sessions() {
        let registry = MemorySessionRegistry::new();
        let id = registry.create(new_session()).await.unwrap();
        registry.record_chunk(chunk(&id, 0), None, u64::MAX).await.unwrap();
        registry.begin_finalize(&id).await.unwrap();
        registry.mark_stored(&id, stored()).await.unwrap();
        registry.registration_failed(&id, "catalog down".into()).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert!(registry.evict_stale(cutoff).await.unwrap().is_empty());

        let session = registry.begin_registration(&id).await.unwrap();
        assert_eq!(session.stored.unwrap().url, "memory://uploads/test");
    }

    #[tokio::test]
    async fn concurrent_records_on_one_session_are_not_lost() {
        let registry = Arc::new(MemorySessionRegistry::new());
        let id = registry.create(new_session()).await.unwrap();

        let mut handles = Vec::new();
        for index in 0..64u32 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                registry.record_chunk(chunk(&id, index), None, u64::MAX).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.received_chunks(), 64);
        assert!(session.missing_chunks().is_empty());
    }
}
