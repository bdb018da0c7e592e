use thiserror::Error;

use crate::{ChunkIndex, SessionId, SessionState};

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while driving an upload session
///
/// Session-scoped variants always carry the session id, and [`UploadError::state`]
/// reports the furthest state the session reached so a client can decide whether
/// to resubmit chunks, retry finalize, retry registration, or start over.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Invalid chunk index for session {session_id}: {reason}")]
    InvalidIndex { session_id: SessionId, reason: String },

    #[error("Upload {session_id} is incomplete ({state}): missing chunks {missing:?}")]
    IncompleteUpload {
        session_id: SessionId,
        state: SessionState,
        missing: Vec<ChunkIndex>,
    },

    #[error("Assembly failed for session {session_id}: {reason}")]
    AssemblyFailed { session_id: SessionId, reason: String },

    #[error("Storing session {session_id} failed: {source}")]
    StoreFailed {
        session_id: SessionId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Session {session_id} stored at {stored_url} but catalog registration failed: {reason}")]
    RegistrationFailed {
        session_id: SessionId,
        object_key: String,
        stored_url: String,
        reason: String,
    },

    #[error("Session {session_id} is already finalizing")]
    AlreadyFinalizing { session_id: SessionId },

    #[error("Session {session_id} is already finalized ({state})")]
    AlreadyFinalized {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn session_not_found(session_id: &SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.clone(),
        }
    }

    pub fn invalid_index<S: Into<String>>(session_id: &SessionId, reason: S) -> Self {
        Self::InvalidIndex {
            session_id: session_id.clone(),
            reason: reason.into(),
        }
    }

    /// Session this error refers to, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionNotFound { session_id }
            | Self::InvalidIndex { session_id, .. }
            | Self::IncompleteUpload { session_id, .. }
            | Self::AssemblyFailed { session_id, .. }
            | Self::StoreFailed { session_id, .. }
            | Self::RegistrationFailed { session_id, .. }
            | Self::AlreadyFinalizing { session_id }
            | Self::AlreadyFinalized { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Furthest state the session reached when this error was produced
    pub fn state(&self) -> Option<SessionState> {
        match self {
            Self::IncompleteUpload { state, .. } | Self::AlreadyFinalized { state, .. } => {
                Some(*state)
            }
            Self::AssemblyFailed { .. } => Some(SessionState::FailedAssembly),
            Self::StoreFailed { .. } => Some(SessionState::FailedStore),
            Self::RegistrationFailed { .. } => Some(SessionState::Stored),
            Self::AlreadyFinalizing { .. } => Some(SessionState::Finalizing),
            _ => None,
        }
    }

    /// Whether the caller can retry the same operation without re-uploading
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IncompleteUpload { .. }
                | Self::AssemblyFailed { .. }
                | Self::StoreFailed { .. }
                | Self::RegistrationFailed { .. }
                | Self::Io { .. }
        )
    }

    /// Storage URL of an object that was written even though the operation failed
    pub fn stored_url(&self) -> Option<&str> {
        match self {
            Self::RegistrationFailed { stored_url, .. } => Some(stored_url),
            _ => None,
        }
    }
}
