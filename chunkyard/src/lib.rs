//! # chunkyard: chunked upload sessions with atomic handoff to object storage
//!
//! `chunkyard` accepts a large file as independently submitted chunks, stages
//! them on local disk, and on finalize streams them in index order into an
//! object store before registering the result with a content catalog.
//!
//! ## Key Features
//!
//! - **Any order, any retry**: chunks may arrive out of order, concurrently, or
//!   more than once; the last submission of an index wins
//! - **Streaming reassembly**: finalize never buffers the whole file in memory
//! - **All-or-nothing storage**: a failed store leaves no partial object and keeps
//!   the staged chunks so finalize can simply be called again
//! - **Exactly one object**: a stored object is never re-uploaded, even when the
//!   catalog registration has to be retried
//! - **Pluggable edges**: session registry, chunk staging, object store and
//!   catalog are all traits
//!
//! ## Quick Start
//!
//! ```rust
//! use chunkyard::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let staging = std::env::temp_dir().join(format!("chunkyard-doc-{}", std::process::id()));
//! let chunks = FsChunkStore::open(&staging).await?;
//! let coordinator = UploadCoordinator::new(
//!     UploadConfig::new().with_staging_root(&staging),
//!     chunks,
//!     MemoryObjectStore::new(),
//!     MemoryCatalog::new(),
//! );
//!
//! let session = coordinator
//!     .initialize(NewUpload::new("lecture.mp4").with_mime_type("video/mp4"))
//!     .await?;
//!
//! // Chunks can arrive in any order
//! coordinator.submit_chunk_bytes(&session.id, 1, Some(2), Bytes::from_static(b"world")).await?;
//! coordinator.submit_chunk_bytes(&session.id, 0, Some(2), Bytes::from_static(b"hello ")).await?;
//!
//! let receipt = coordinator.finalize(&session.id).await?;
//! assert_eq!(receipt.size_bytes, 11);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  HTTP / CLI / jobs   │  ← transport only
//! ├──────────────────────┤
//! │  UploadCoordinator   │  ← session lifecycle and finalize
//! ├──────────┬───────────┤
//! │ Registry │ ChunkStore│  ← local bookkeeping and staging
//! ├──────────┴───────────┤
//! │ ObjectStore, Catalog │  ← external systems
//! └──────────────────────┘
//! ```

mod assembler;
mod catalog;
mod chunk_store;
mod config;
mod coordinator;
mod error;
mod gateway;
mod keys;
mod registry;
mod s3_store;
mod sweeper;
mod types;

pub use assembler::{Assembler, Assembly, AssemblyFault};
pub use catalog::{CatalogNotifier, MemoryCatalog, WebhookCatalog};
pub use chunk_store::{ChunkStore, FsChunkStore};
pub use config::UploadConfig;
pub use coordinator::UploadCoordinator;
pub use error::{UploadError, UploadResult};
pub use gateway::{MemoryObject, MemoryObjectStore, ObjectStoreGateway};
pub use keys::{sanitize_filename, DefaultKeyStrategy, ObjectKeyStrategy};
pub use registry::{MemorySessionRegistry, SessionRegistry};
pub use s3_store::{S3Config, S3ObjectStore};
pub use sweeper::SessionSweeper;
pub use types::{
    ByteStream, CatalogAsset, CatalogRecord, CatalogRefs, ChunkAck, ChunkIndex, ChunkRecorded,
    ChunkRef, FinalizeReceipt, NewUpload, SessionId, SessionState, StoredObject, UploadSession,
    FIRST_CHUNK_INDEX,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteStream, ChunkAck, FinalizeReceipt, FsChunkStore, MemoryCatalog, MemoryObjectStore,
        NewUpload, SessionId, SessionState, UploadConfig, UploadCoordinator, UploadError,
        UploadResult, UploadSession,
    };
}
