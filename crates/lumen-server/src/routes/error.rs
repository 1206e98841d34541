use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    CompileError,
    ScriptError,
    Timeout,
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: HttpError,
}

#[derive(Debug, Serialize)]
struct HttpError {
    code: ErrorCode,
    message: String,
}

#[derive(Debug)]
pub struct HttpApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl HttpApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub const fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::CompileError | ErrorCode::ScriptError | ErrorCode::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: HttpError {
                code: self.code,
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<lumen::Error> for HttpApiError {
    fn from(err: lumen::Error) -> Self {
        if err.is_not_found() {
            return Self::not_found("Script not found");
        }
        match err {
            lumen::Error::Compile { .. } => {
                tracing::error!(%err, "Script failed to compile");
                Self::new(ErrorCode::CompileError, err.to_string())
            }
            lumen::Error::Runtime { message, traceback } => {
                tracing::warn!(%message, traceback = traceback.as_deref().unwrap_or_default(), "Script failed");
                Self::new(ErrorCode::ScriptError, message)
            }
            lumen::Error::DeadlineExceeded => {
                Self::new(ErrorCode::Timeout, "Script execution timed out")
            }
            other => {
                tracing::error!(err = %other, "Request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl std::fmt::Display for HttpApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for HttpApiError {}
