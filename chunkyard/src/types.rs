use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes for chunk and object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Sequence index of a chunk within a session
pub type ChunkIndex = u32;

/// Chunk indices are zero-based: a file split into `n` chunks uses `0..n`.
pub const FIRST_CHUNK_INDEX: ChunkIndex = 0;

/// Opaque identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id can be used as a single path component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initialized,
    Receiving,
    Finalizing,
    Stored,
    Registered,
    FailedAssembly,
    FailedStore,
}

impl SessionState {
    /// States in which chunks may be submitted (failed finalizes keep their chunks).
    pub fn accepts_chunks(&self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Receiving | Self::FailedAssembly | Self::FailedStore
        )
    }

    /// States from which finalize may start.
    pub fn can_finalize(&self) -> bool {
        self.accepts_chunks()
    }

    /// True once the object has been durably written.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored | Self::Registered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Receiving => "receiving",
            Self::Finalizing => "finalizing",
            Self::Stored => "stored",
            Self::Registered => "registered",
            Self::FailedAssembly => "failed_assembly",
            Self::FailedStore => "failed_store",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog fields carried from initialize through to the catalog notifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRefs {
    pub module_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Request to open a new upload session
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub declared_size: Option<u64>,
    pub total_chunks: Option<u32>,
    pub catalog: CatalogRefs,
}

impl NewUpload {
    pub fn new<S: Into<String>>(filename: S) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            declared_size: None,
            total_chunks: None,
            catalog: CatalogRefs::default(),
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_total_chunks(mut self, total: u32) -> Self {
        self.total_chunks = Some(total);
        self
    }

    pub fn with_module<S: Into<String>>(mut self, module_id: S) -> Self {
        self.catalog.module_id = Some(module_id.into());
        self
    }

    pub fn with_title<S: Into<String>>(mut self, title: S) -> Self {
        self.catalog.title = Some(title.into());
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.catalog.description = Some(description.into());
        self
    }
}

/// Reference to a staged chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub session_id: SessionId,
    pub index: ChunkIndex,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub staged_at: DateTime<Utc>,
}

/// Object written by the object store gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub object_key: String,

    pub filename: String,
    pub mime_type: String,
    pub declared_size: Option<u64>,
    pub catalog: CatalogRefs,

    pub chunks: BTreeMap<ChunkIndex, ChunkRef>,
    pub expected_chunks: Option<u32>,

    pub state: SessionState,
    pub stored: Option<StoredObject>,
    pub last_error: Option<String>,

    /// Set while a catalog registration is in flight for a stored session.
    #[serde(skip)]
    pub registering: bool,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Number of chunks the session must hold before it can be assembled.
    ///
    /// Uses the declared total when known, otherwise `max_index + 1`.
    pub fn required_chunks(&self) -> u32 {
        let observed = self
            .chunks
            .keys()
            .next_back()
            .map(|max| max + 1 - FIRST_CHUNK_INDEX)
            .unwrap_or(0);
        self.expected_chunks.unwrap_or(0).max(observed)
    }

    /// Indices that must still arrive before the recorded set is contiguous.
    ///
    /// An empty session with no declared total is missing its first chunk.
    pub fn missing_chunks(&self) -> Vec<ChunkIndex> {
        let required = self.required_chunks();
        if required == 0 {
            return vec![FIRST_CHUNK_INDEX];
        }
        (FIRST_CHUNK_INDEX..FIRST_CHUNK_INDEX + required)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.size_bytes).sum()
    }

    pub fn is_evictable(&self) -> bool {
        self.state != SessionState::Finalizing && !self.registering
    }
}

/// Acknowledgement for an accepted chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub session_id: SessionId,
    pub accepted: bool,
    pub index: ChunkIndex,
    pub size_bytes: u64,
    pub received: u32,
    pub expected: Option<u32>,
}

/// Outcome of recording a chunk in the registry
#[derive(Debug, Clone)]
pub struct ChunkRecorded {
    /// Earlier generation of the same index, now superseded.
    pub replaced: Option<ChunkRef>,
    pub received: u32,
    pub expected: Option<u32>,
}

/// Asset handed to the catalog notifier once the object is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAsset {
    pub session_id: SessionId,
    pub url: String,
    pub object_key: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(flatten)]
    pub catalog: CatalogRefs,
}

/// Record created by the catalog for a registered asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: String,
}

/// Result of a successful finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReceipt {
    pub session_id: SessionId,
    pub url: String,
    pub object_key: String,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub catalog_record: CatalogRecord,
}
