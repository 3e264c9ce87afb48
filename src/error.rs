//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::config::TOO_MANY_UPLOADS_RETRY_SECS;
use crate::session::UploadError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge(String),
    /// 携带已接收字节数，以 `bytes */<n>` 返回。
    RangeNotSatisfiable(u64),
    PreconditionFailed(String),
    TooManyRequests(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::RangeNotSatisfiable(received) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{received}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "chunk offset does not match received bytes",
                )
                    .into_response()
            }
            ApiError::PreconditionFailed(msg) => {
                (StatusCode::PRECONDITION_FAILED, msg).into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "too many requests").into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::Forbidden("invalid path".into()),
            StorageError::NotFound(path) => ApiError::NotFound(format!("not found: {path}")),
            StorageError::Io(err) => {
                error!(error = %err, "storage failure");
                ApiError::Internal("storage failure".into())
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            UploadError::NotFound => ApiError::NotFound("upload not found".into()),
            err @ UploadError::Overflow { .. } => ApiError::PayloadTooLarge(err.to_string()),
            UploadError::OffsetMismatch { expected, .. } => ApiError::RangeNotSatisfiable(expected),
            err @ UploadError::Conflict => ApiError::Conflict(err.to_string()),
            err @ UploadError::Incomplete { .. } => ApiError::PreconditionFailed(err.to_string()),
            UploadError::InvalidPath => ApiError::Forbidden("invalid path".into()),
            UploadError::TooManySessions => ApiError::TooManyRequests(TOO_MANY_UPLOADS_RETRY_SECS),
            UploadError::StorageFault(err) => {
                error!(error = %err, "upload storage fault");
                ApiError::Internal("storage failure".into())
            }
        }
    }
}
