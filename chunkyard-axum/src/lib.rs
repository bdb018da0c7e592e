//! chunkyard-axum: HTTP binding for the chunkyard upload engine.
//!
//! Exposes `/uploads/*` routes over an [`chunkyard::UploadCoordinator`]. Chunk
//! requests accept both plain field names (`sessionId`, `index`, `totalChunks`)
//! and the Dropzone ones (`dzuuid`, `dzchunkindex`, `dztotalchunkcount`).

pub mod app;
pub mod routes;
pub mod state;
mod error;
pub use error::UploadApiError;
pub use state::UploadState;

pub use app::{router, UploadApp};
