use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ByteStream, StoredObject, UploadError, UploadResult};

/// Durable object storage consumed by the upload engine
///
/// `put` must either make the complete object visible under `key` or fail
/// without leaving anything readable there. If `stream` yields an error the
/// put must fail.
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    /// Store an object from a stream and return where it can be read
    async fn put(
        &self,
        key: &str,
        stream: ByteStream,
        content_type: &str,
    ) -> UploadResult<StoredObject>;
}

/// Object held by [`MemoryObjectStore`]
#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Bytes,
    pub content_type: String,
}

/// In-process object store for tests and single-node development
///
/// Objects become visible only after the whole stream has been consumed.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    puts: AtomicUsize,
    base_url: String,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_base_url("memory://")
    }

    pub fn with_base_url<S: Into<String>>(base_url: S) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            base_url: base_url.into(),
        }
    }

    pub fn object(&self, key: &str) -> Option<MemoryObject> {
        self.objects.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of put calls received, successful or not
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.base_url, key)
    }
}

#[async_trait]
impl ObjectStoreGateway for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        mut stream: ByteStream,
        content_type: &str,
    ) -> UploadResult<StoredObject> {
        self.puts.fetch_add(1, Ordering::SeqCst);

        let mut data = BytesMut::new();
        while let Some(piece) = stream.next().await {
            data.extend_from_slice(&piece.map_err(UploadError::backend)?);
        }

        let data = data.freeze();
        let stored = StoredObject {
            key: key.to_string(),
            url: self.url_for(key),
            size_bytes: data.len() as u64,
            etag: None,
        };

        self.objects.write().insert(
            key.to_string(),
            MemoryObject {
                data,
                content_type: content_type.to_string(),
            },
        );

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_complete_stream() {
        let store = MemoryObjectStore::new();
        let stream: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]));

        let stored = store.put("a/b.mp4", stream, "video/mp4").await.unwrap();
        assert_eq!(stored.url, "memory://a/b.mp4");
        assert_eq!(stored.size_bytes, 4);

        let object = store.object("a/b.mp4").unwrap();
        assert_eq!(&object.data[..], b"abcd");
        assert_eq!(object.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let store = MemoryObjectStore::new();
        let stream: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(std::io::Error::other("disk gone")),
        ]));

        assert!(store.put("a/b.mp4", stream, "video/mp4").await.is_err());
        assert!(store.object("a/b.mp4").is_none());
        assert_eq!(store.put_count(), 1);
    }
}
