use axum::{
    extract::multipart::MultipartError,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chunkyard::UploadError;
use serde_json::{json, Value};

/// Feathers-style error body: `{ name, message, code, className, data?, errors? }`
#[derive(Debug)]
pub struct UploadApiError {
    pub status: StatusCode,
    pub message: String,
    pub data: Option<Value>,
    pub errors: Option<Value>,
}

impl UploadApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            errors: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_errors(mut self, errors: Value) -> Self {
        self.errors = Some(errors);
        self
    }

    fn name(&self) -> &'static str {
        match self.status {
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::CONFLICT => "Conflict",
            StatusCode::PAYLOAD_TOO_LARGE => "PayloadTooLarge",
            StatusCode::UNPROCESSABLE_ENTITY => "Unprocessable",
            StatusCode::BAD_GATEWAY => "BadGateway",
            StatusCode::SERVICE_UNAVAILABLE => "Unavailable",
            _ => "GeneralError",
        }
    }

    fn class_name(&self) -> &'static str {
        match self.status {
            StatusCode::BAD_REQUEST => "bad-request",
            StatusCode::NOT_FOUND => "not-found",
            StatusCode::CONFLICT => "conflict",
            StatusCode::PAYLOAD_TOO_LARGE => "payload-too-large",
            StatusCode::UNPROCESSABLE_ENTITY => "unprocessable",
            StatusCode::BAD_GATEWAY => "bad-gateway",
            StatusCode::SERVICE_UNAVAILABLE => "unavailable",
            _ => "general-error",
        }
    }

    pub fn to_json(&self) -> Value {
        let mut base = json!({
            "name": self.name(),
            "message": self.message,
            "code": self.status.as_u16(),
            "className": self.class_name(),
        });

        if let Some(d) = &self.data {
            base["data"] = d.clone();
        }
        if let Some(e) = &self.errors {
            base["errors"] = e.clone();
        }
        base
    }
}

impl From<UploadError> for UploadApiError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::InvalidIndex { .. } | UploadError::Invalid { .. } => StatusCode::BAD_REQUEST,
            UploadError::IncompleteUpload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::AlreadyFinalizing { .. } | UploadError::AlreadyFinalized { .. } => {
                StatusCode::CONFLICT
            }
            UploadError::StoreFailed { .. } | UploadError::RegistrationFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Infrastructure details stay in the logs
        let message = match &err {
            UploadError::Backend { .. } | UploadError::Io { .. } | UploadError::Serialization { .. } => {
                tracing::error!(error = %err, "upload request failed");
                "Internal server error".to_string()
            }
            UploadError::StoreFailed { session_id, .. } => {
                tracing::warn!(error = %err, "object store rejected upload");
                format!("Object store failed for session {}", session_id)
            }
            _ => err.to_string(),
        };

        let mut data = serde_json::Map::new();
        if let Some(id) = err.session_id() {
            data.insert("sessionId".into(), json!(id));
        }
        if let Some(state) = err.state() {
            data.insert("state".into(), json!(state));
        }
        if let UploadError::IncompleteUpload { missing, .. } = &err {
            data.insert("missing".into(), json!(missing));
        }
        if let UploadError::RegistrationFailed { object_key, stored_url, .. } = &err {
            data.insert("storedUrl".into(), json!(stored_url));
            data.insert("objectKey".into(), json!(object_key));
        }
        if !data.is_empty() {
            data.insert("retryable".into(), json!(err.is_retryable()));
        }

        let api = Self::new(status, message);
        if data.is_empty() {
            api
        } else {
            api.with_data(Value::Object(data))
        }
    }
}

impl From<JsonRejection> for UploadApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Failed to parse the request body as JSON")
            .with_errors(json!({"_schema": [rejection.body_text()]}))
    }
}

impl From<MultipartError> for UploadApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), "Failed to read multipart body")
            .with_errors(json!({"_schema": [err.body_text()]}))
    }
}

impl IntoResponse for UploadApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.to_json())).into_response()
    }
}
