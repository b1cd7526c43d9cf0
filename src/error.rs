use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Typed error taxonomy for the credit subsystem.
///
/// Variants map to HTTP status codes at the gateway boundary (see
/// `IntoResponse` below); internal callers should match on variants rather
/// than inspect the message.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("{message}")]
    InsufficientCredit { message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl CreditError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::InputInvalid(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }
}

impl IntoResponse for CreditError {
    fn into_response(self) -> Response {
        let status = match &self {
            CreditError::InputInvalid(_) => StatusCode::BAD_REQUEST,
            CreditError::AuthRequired => StatusCode::UNAUTHORIZED,
            CreditError::InsufficientCredit { .. } => StatusCode::FORBIDDEN,
            CreditError::NotFound(_) => StatusCode::NOT_FOUND,
            CreditError::SignatureInvalid => StatusCode::FORBIDDEN,
            CreditError::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
            CreditError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type CreditResult<T> = Result<T, CreditError>;
