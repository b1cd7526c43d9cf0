use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;

use super::AppState;
use crate::error::CreditError;

/// The authenticated caller's user id.
///
/// User authentication itself (sessions, OAuth, JWTs) belongs to the host
/// platform's auth middleware and is out of scope here (see SPEC_FULL.md
/// §1 Non-goals) — this extractor only reads the id that middleware is
/// assumed to have already verified and attached as `x-user-id`.
pub struct UserId(pub String);

impl FromRequestParts<std::sync::Arc<AppState>> for UserId {
    type Rejection = CreditError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &std::sync::Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| UserId(s.to_string()))
            .ok_or_else(|| CreditError::input("missing x-user-id header"))
    }
}

/// Marker extractor gating operator-only endpoints. Compares a bearer
/// token against `gateway.admin_token`; an unconfigured token refuses
/// every admin request rather than leaving the endpoints open.
pub struct AdminAuth;

impl FromRequestParts<std::sync::Arc<AppState>> for AdminAuth {
    type Rejection = CreditError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &std::sync::Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(configured) = state.config.gateway.admin_token.as_deref() else {
            return Err(CreditError::AuthRequired);
        };

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let token = header.strip_prefix("Bearer ").unwrap_or("");
        if token.is_empty() || token.len() != configured.len() || !bool::from(token.as_bytes().ct_eq(configured.as_bytes())) {
            return Err(CreditError::AuthRequired);
        }

        Ok(AdminAuth)
    }
}
