use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type LimiterResult<T> = Result<T, LimiterError>;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
    #[error("counter backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire shape shared by rejections and internal failures.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: bool,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl LimiterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidConfig(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorBody {
                error: true,
                message: self.to_string(),
                retry_after: None,
            }),
        )
            .into_response();

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}
