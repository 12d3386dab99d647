//! 统一的 API 错误类型与状态码映射。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::storage::StoreError;

#[derive(Debug)]
pub enum ApiError {
    InvalidPath(String),
    InvalidName(String),
    NotFound(String),
    AlreadyExists(String),
    Unauthenticated(String),
    Unauthorized(String),
    BadRequest(String),
    Conflict(String),
    TooManyRequests(u64),
    Internal(String),
}

impl ApiError {
    /// 稳定的机器可读错误种类。
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidPath(_) => "invalid_path",
            ApiError::InvalidName(_) => "invalid_name",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooManyRequests(_) => "too_many_requests",
            ApiError::Internal(_) => "io_failure",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidPath(_) | ApiError::InvalidName(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let mut headers = HeaderMap::new();

        let message = match self {
            ApiError::TooManyRequests(retry_after) => {
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                "too many requests".to_string()
            }
            // 内部错误细节只进日志，不回给调用方。
            ApiError::Internal(detail) => {
                error!(detail, "internal error");
                "internal error".to_string()
            }
            ApiError::InvalidPath(msg)
            | ApiError::InvalidName(msg)
            | ApiError::NotFound(msg)
            | ApiError::AlreadyExists(msg)
            | ApiError::Unauthenticated(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg) => msg,
        };

        let body = Json(json!({ "error": kind, "message": message }));
        (status, headers, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidPath => ApiError::InvalidPath("invalid path".into()),
            StoreError::InvalidName => ApiError::InvalidName("invalid name".into()),
            StoreError::NotFound => ApiError::NotFound("not found".into()),
            StoreError::AlreadyExists => ApiError::AlreadyExists("already exists".into()),
            StoreError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}
