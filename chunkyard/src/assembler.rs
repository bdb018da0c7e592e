use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::{ByteStream, ChunkRef, ChunkStore, UploadError, UploadResult, UploadSession};

/// Records why an assembly stream stopped early.
///
/// The stream itself can only surface `std::io::Error` to its consumer; the
/// fault cell lets the caller tell a local read failure apart from a failure
/// inside the object store that consumed the stream.
#[derive(Debug, Clone, Default)]
pub struct AssemblyFault(Arc<Mutex<Option<String>>>);

impl AssemblyFault {
    fn record(&self, reason: String) {
        self.0.lock().get_or_insert(reason);
    }

    /// The read failure, if one happened
    pub fn reason(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

/// Ordered byte stream of a session's chunks
pub struct Assembly {
    pub stream: ByteStream,
    pub total_bytes: u64,
    pub chunk_count: u32,
    pub fault: AssemblyFault,
}

/// Rebuilds a session's byte stream from its staged chunks
#[derive(Clone)]
pub struct Assembler {
    chunks: Arc<dyn ChunkStore>,
}

impl Assembler {
    pub fn new(chunks: Arc<dyn ChunkStore>) -> Self {
        Self { chunks }
    }

    /// Build the lazy concatenation of every chunk in ascending index order.
    ///
    /// Nothing is read until the stream is polled. The stream is finite and
    /// cannot be restarted; each chunk is read incrementally, so at most one
    /// read buffer is resident at a time.
    pub fn assemble(&self, session: &UploadSession) -> UploadResult<Assembly> {
        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload {
                session_id: session.id.clone(),
                state: session.state,
                missing,
            });
        }

        // BTreeMap iteration is ascending by index
        let ordered: Vec<ChunkRef> = session.chunks.values().cloned().collect();
        let total_bytes = ordered.iter().map(|c| c.size_bytes).sum();
        let chunk_count = ordered.len() as u32;
        let fault = AssemblyFault::default();

        let stream = Self::concat_chunk_streams(Arc::clone(&self.chunks), ordered, fault.clone());

        Ok(Assembly {
            stream,
            total_bytes,
            chunk_count,
            fault,
        })
    }

    /// Concatenate staged chunks into a single stream
    fn concat_chunk_streams(
        store: Arc<dyn ChunkStore>,
        ordered: Vec<ChunkRef>,
        fault: AssemblyFault,
    ) -> ByteStream {
        let stream = async_stream::stream! {
            for chunk in ordered {
                let mut chunk_stream = match store.read(&chunk).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let reason = format!("failed to open chunk {}: {}", chunk.index, e);
                        fault.record(reason.clone());
                        yield Err(std::io::Error::other(reason));
                        return;
                    }
                };

                let mut read: u64 = 0;
                while let Some(piece) = chunk_stream.next().await {
                    match piece {
                        Ok(bytes) => {
                            read += bytes.len() as u64;
                            yield Ok(bytes);
                        }
                        Err(e) => {
                            let reason = format!("failed to read chunk {}: {}", chunk.index, e);
                            fault.record(reason.clone());
                            yield Err(std::io::Error::new(e.kind(), reason));
                            return;
                        }
                    }
                }

                if read != chunk.size_bytes {
                    let reason = format!(
                        "chunk {} has {} bytes on disk, {} recorded",
                        chunk.index, read, chunk.size_bytes
                    );
                    fault.record(reason.clone());
                    yield Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, reason));
                    return;
                }
            }
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CatalogRefs, FsChunkStore, SessionId, SessionState};
    use bytes::Bytes;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn body(data: &[u8]) -> ByteStream {
        let data = Bytes::copy_from_slice(data);
        Box::pin(futures_util::stream::iter(vec![Ok(data)]))
    }

    fn session(id: SessionId, chunks: BTreeMap<u32, ChunkRef>) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id,
            object_key: "k".to_string(),
            filename: "lecture.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            declared_size: None,
            catalog: CatalogRefs::default(),
            chunks,
            expected_chunks: None,
            state: SessionState::Finalizing,
            stored: None,
            last_error: None,
            registering: false,
            started_at: now,
            updated_at: now,
        }
    }

    async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, std::io::Error> {
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn assembles_in_index_order_regardless_of_staging_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsChunkStore::open(dir.path()).await.unwrap());
        let id = SessionId::new();

        let mut chunks = BTreeMap::new();
        for (index, data) in [(2u32, &b"ccc"[..]), (0, &b"a"[..]), (1, &b"bb"[..])] {
            let chunk = store.stage(&id, index, body(data), 1024).await.unwrap();
            chunks.insert(index, chunk);
        }

        let assembler = Assembler::new(store);
        let assembly = assembler.assemble(&session(id, chunks)).unwrap();
        assert_eq!(assembly.total_bytes, 6);
        assert_eq!(assembly.chunk_count, 3);

        let fault = assembly.fault.clone();
        assert_eq!(collect(assembly.stream).await.unwrap(), b"abbccc");
        assert!(fault.reason().is_none());
    }

    #[tokio::test]
    async fn gaps_fail_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsChunkStore::open(dir.path()).await.unwrap());
        let id = SessionId::new();

        let mut chunks = BTreeMap::new();
        chunks.insert(1, store.stage(&id, 1, body(b"x"), 1024).await.unwrap());

        let result = Assembler::new(store).assemble(&session(id, chunks));
        assert!(matches!(
            result,
            Err(UploadError::IncompleteUpload { ref missing, .. }) if missing == &vec![0]
        ));
    }

    #[tokio::test]
    async fn missing_chunk_file_records_fault_and_keeps_other_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsChunkStore::open(dir.path()).await.unwrap());
        let id = SessionId::new();

        let mut chunks = BTreeMap::new();
        let first = store.stage(&id, 0, body(b"first"), 1024).await.unwrap();
        let second = store.stage(&id, 1, body(b"second"), 1024).await.unwrap();
        tokio::fs::remove_file(&second.path).await.unwrap();
        chunks.insert(0, first.clone());
        chunks.insert(1, second);

        let assembly = Assembler::new(store).assemble(&session(id, chunks)).unwrap();
        let fault = assembly.fault.clone();
        assert!(collect(assembly.stream).await.is_err());
        assert!(fault.reason().unwrap().contains("chunk 1"));
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn truncated_chunk_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsChunkStore::open(dir.path()).await.unwrap());
        let id = SessionId::new();

        let mut chunk = store.stage(&id, 0, body(b"short"), 1024).await.unwrap();
        chunk.size_bytes = 10;
        let mut chunks = BTreeMap::new();
        chunks.insert(0, chunk);

        let assembly = Assembler::new(store).assemble(&session(id, chunks)).unwrap();
        let fault = assembly.fault.clone();
        assert!(collect(assembly.stream).await.is_err());
        assert!(fault.reason().is_some());
    }
}
