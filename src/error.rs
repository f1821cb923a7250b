use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("price mismatch: quoted {quoted:.2}, computed {computed:.2}")]
    PriceMismatch { quoted: f64, computed: f64 },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("order no longer available")]
    OrderNoLongerAvailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code so clients can react without parsing
    /// messages; a lost accept race must be recognizable as such.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::LimitExceeded(_) => "limit_exceeded",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::PriceMismatch { .. } => "price_mismatch",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::OrderNoLongerAvailable => "order_no_longer_available",
            AppError::NotFound(_) => "not_found",
            AppError::DependencyUnavailable(_) => "dependency_unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PriceMismatch { .. } => StatusCode::CONFLICT,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::OrderNoLongerAvailable => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::DependencyUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (self.status(), body).into_response()
    }
}
