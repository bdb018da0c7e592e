use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::{ByteStream, ChunkIndex, ChunkRef, SessionId, UploadError, UploadResult};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Durable staging area for chunks, namespaced by (session id, index)
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persist a chunk body; fails without leaving anything staged
    async fn stage(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        body: ByteStream,
        max_bytes: u64,
    ) -> UploadResult<ChunkRef>;

    /// Stream a staged chunk back
    async fn read(&self, chunk: &ChunkRef) -> UploadResult<ByteStream>;

    /// Delete one staged chunk; a missing chunk is not an error
    async fn discard(&self, chunk: &ChunkRef) -> UploadResult<()>;

    /// Delete everything staged for a session; a missing session is not an error
    async fn discard_session(&self, session_id: &SessionId) -> UploadResult<()>;
}

/// Filesystem chunk store
///
/// Layout: `{root}/{session_id}/{index}-{generation}.chunk`. Every stage call
/// writes a new generation file, so resubmitting an index never rewrites bytes
/// that the registry may still reference; the superseded generation is
/// discarded once the registry has switched to the new one.
///
/// This deliberately departs from a plain `{root}/{session_id}/{index}`
/// layout: overwriting one file per index in place could tear a chunk that a
/// concurrent finalize is already reading.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create the staging root if needed and return the store
    pub async fn open<P: Into<PathBuf>>(root: P) -> UploadResult<Self> {
        let store = Self::new(root);
        tokio::fs::create_dir_all(&store.root).await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &SessionId) -> UploadResult<PathBuf> {
        if !session_id.is_path_safe() {
            return Err(UploadError::invalid(format!(
                "Session id is not a valid staging name: {:?}",
                session_id.as_str()
            )));
        }
        Ok(self.root.join(session_id.as_str()))
    }

    fn owns(&self, chunk: &ChunkRef) -> bool {
        chunk.path.starts_with(&self.root)
    }

    async fn write_body(
        path: &Path,
        mut body: ByteStream,
        max_bytes: u64,
    ) -> UploadResult<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written: u64 = 0;

        while let Some(piece) = body.next().await {
            let piece = piece?;
            written += piece.len() as u64;
            if written > max_bytes {
                return Err(UploadError::invalid(format!(
                    "Chunk exceeds maximum size of {} bytes",
                    max_bytes
                )));
            }
            file.write_all(&piece).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn stage(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        body: ByteStream,
        max_bytes: u64,
    ) -> UploadResult<ChunkRef> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}-{}.chunk", index, Uuid::new_v4().simple()));

        match Self::write_body(&path, body, max_bytes).await {
            Ok(size_bytes) => {
                debug!(session_id = %session_id, index, size_bytes, path = %path.display(), "staged chunk");
                Ok(ChunkRef {
                    session_id: session_id.clone(),
                    index,
                    path,
                    size_bytes,
                    staged_at: Utc::now(),
                })
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    async fn read(&self, chunk: &ChunkRef) -> UploadResult<ByteStream> {
        if !self.owns(chunk) {
            return Err(UploadError::invalid(format!(
                "Chunk {} of session {} is outside the staging root",
                chunk.index, chunk.session_id
            )));
        }
        let file = tokio::fs::File::open(&chunk.path).await?;
        Ok(Box::pin(ReaderStream::with_capacity(file, READ_BUFFER_BYTES)))
    }

    async fn discard(&self, chunk: &ChunkRef) -> UploadResult<()> {
        if !self.owns(chunk) {
            return Ok(());
        }
        match tokio::fs::remove_file(&chunk.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard_session(&self, session_id: &SessionId) -> UploadResult<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
