use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use chunkyard::{ChunkAck, ChunkIndex, FinalizeReceipt, NewUpload, SessionId, SessionState, UploadSession};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{UploadApiError, UploadState};

type ApiResult<T> = Result<T, UploadApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<InitRequest> for NewUpload {
    fn from(req: InitRequest) -> Self {
        let mut upload = NewUpload::new(req.filename);
        upload.mime_type = req.mime_type;
        upload.declared_size = req.size;
        upload.total_chunks = req.total_chunks;
        upload.catalog.module_id = req.module_id;
        upload.catalog.title = req.title;
        upload.catalog.description = req.description;
        upload
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub session_id: SessionId,
    pub object_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: String,
}

/// Client-facing view of a session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub object_key: String,
    pub filename: String,
    pub mime_type: String,
    pub received_chunks: u32,
    pub received_bytes: u64,
    pub expected_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<ChunkIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<UploadSession> for SessionStatus {
    fn from(session: UploadSession) -> Self {
        // Stored sessions no longer hold chunks, so gaps only mean something before that
        let missing = if session.state.accepts_chunks() && !session.chunks.is_empty() {
            session.missing_chunks()
        } else {
            Vec::new()
        };
        Self {
            received_chunks: session.received_chunks(),
            received_bytes: session.received_bytes(),
            url: session.stored.as_ref().map(|s| s.url.clone()),
            session_id: session.id,
            state: session.state,
            object_key: session.object_key,
            filename: session.filename,
            mime_type: session.mime_type,
            expected_chunks: session.expected_chunks,
            missing,
            last_error: session.last_error,
        }
    }
}

fn session_id(raw: &str) -> ApiResult<SessionId> {
    let id = SessionId::from(raw.trim());
    if id.as_str().is_empty() || !id.is_path_safe() {
        return Err(UploadApiError::bad_request(format!("Invalid session id: {:?}", raw)));
    }
    Ok(id)
}

pub async fn init(
    State(state): State<UploadState>,
    body: Result<Json<InitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<InitResponse>)> {
    let Json(req) = body?;
    let session = state.coordinator.initialize(req.into()).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitResponse {
            session_id: session.id,
            object_key: session.object_key,
        }),
    ))
}

/// Fields of one chunk request, in whatever order the client sent them
#[derive(Default)]
struct ChunkForm {
    session_id: Option<String>,
    index: Option<String>,
    total_chunks: Option<String>,
    body: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "sessionId" | "dzuuid" => form.session_id = Some(field.text().await?),
                "index" | "dzchunkindex" => form.index = Some(field.text().await?),
                "totalChunks" | "dztotalchunkcount" => form.total_chunks = Some(field.text().await?),
                "file" | "chunk" => form.body = Some(field.bytes().await?),
                other => debug!(field = other, "ignoring multipart field"),
            }
        }
        Ok(form)
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, raw: &str) -> ApiResult<T> {
    raw.trim().parse().map_err(|_| {
        UploadApiError::bad_request(format!("Invalid {}", field))
            .with_errors(serde_json::json!({ (field): [format!("not a non-negative integer: {:?}", raw)] }))
    })
}

pub async fn chunk(State(state): State<UploadState>, multipart: Multipart) -> ApiResult<Json<ChunkAck>> {
    let form = ChunkForm::read(multipart).await?;

    let id = form
        .session_id
        .as_deref()
        .ok_or_else(|| UploadApiError::bad_request("sessionId is required"))
        .and_then(session_id)?;
    let index: ChunkIndex = form
        .index
        .as_deref()
        .ok_or_else(|| UploadApiError::bad_request("index is required"))
        .and_then(|raw| parse_number("index", raw))?;
    let total_chunks = form
        .total_chunks
        .as_deref()
        .map(|raw| parse_number::<u32>("totalChunks", raw))
        .transpose()?;
    let body = form
        .body
        .ok_or_else(|| UploadApiError::bad_request("file is required"))?;

    let ack = state
        .coordinator
        .submit_chunk_bytes(&id, index, total_chunks, body)
        .await?;
    Ok(Json(ack))
}

pub async fn complete(
    State(state): State<UploadState>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<Json<FinalizeReceipt>> {
    let Json(req) = body?;
    let id = session_id(&req.session_id)?;
    Ok(Json(state.coordinator.finalize(&id).await?))
}

pub async fn register(
    State(state): State<UploadState>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<Json<FinalizeReceipt>> {
    let Json(req) = body?;
    let id = session_id(&req.session_id)?;
    Ok(Json(state.coordinator.retry_registration(&id).await?))
}

pub async fn status(
    State(state): State<UploadState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let id = session_id(&raw)?;
    let session = state.coordinator.status(&id).await?;
    Ok(Json(session.into()))
}

pub async fn abandon(State(state): State<UploadState>, Path(raw): Path<String>) -> ApiResult<StatusCode> {
    let id = session_id(&raw)?;
    state.coordinator.abandon(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
