use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    // 便利方法
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;

        let status = match &error {
            AppErr::InvalidScope(_) | AppErr::MalformedFrame(_) | AppErr::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            AppErr::ScopeConflict { .. }
            | AppErr::SessionAlreadyBound(_)
            | AppErr::UnknownSession(_) => StatusCode::CONFLICT,
            AppErr::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppErr::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppErr::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppErr::PersistenceFailure(_) | AppErr::Store(_) | AppErr::Directory(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppErr::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %error, "request failed");
        }
        ApiError::new(status, error.code(), error.to_string())
    }
}

impl From<domain::DomainError> for ApiError {
    fn from(error: domain::DomainError) -> Self {
        ApplicationError::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
