use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::auth::{AdminAuth, UserId};
use super::AppState;
use crate::error::CreditResult;
use crate::redemption::RedemptionCode;

/// `GET /credit/redemption_codes` — operator listing, newest first.
pub async fn list_codes(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
) -> CreditResult<Json<Vec<RedemptionCode>>> {
    let codes = state.redemption.list(0, 100).await?;
    Ok(Json(codes))
}

#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    purpose: String,
    count: u32,
    amount: Decimal,
    expired_at: Option<DateTime<Utc>>,
}

/// `POST /credit/redemption_codes` — bulk issuance.
pub async fn issue_codes(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Json(body): Json<IssueRequest>,
) -> CreditResult<Json<Vec<RedemptionCode>>> {
    let codes = state
        .redemption
        .issue(&body.purpose, body.count, body.amount, body.expired_at)
        .await?;
    Ok(Json(codes))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    keyword: Option<String>,
}

/// `GET /credit/redemption_codes/export?keyword` — CSV-ready listing
/// filtered by a keyword against `code`/`purpose`.
pub async fn export_codes(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Query(query): Query<ExportQuery>,
) -> CreditResult<Json<Vec<RedemptionCode>>> {
    let codes = state.redemption.search(query.keyword.as_deref().unwrap_or("")).await?;
    Ok(Json(codes))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    purpose: Option<String>,
    amount: Option<Decimal>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    expired_at: Option<Option<DateTime<Utc>>>,
}

/// Distinguish "field omitted" (`None`) from "field present and null"
/// (`Some(None)`, clear the expiry) the way a PATCH-shaped form needs to.
fn deserialize_double_option<'de, D>(
    deserializer: D,
) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// `PUT /credit/redemption_codes/{code}` — operator edit of an unreceived
/// code.
pub async fn update_code(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(code): Path<String>,
    Json(body): Json<UpdateRequest>,
) -> CreditResult<Json<RedemptionCode>> {
    let updated = state
        .redemption
        .update(&code, body.purpose.as_deref(), body.amount, body.expired_at)
        .await?;
    Ok(Json(updated))
}

/// `DELETE /credit/redemption_codes/{code}` — operator delete of an
/// unreceived code.
pub async fn delete_code(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(code): Path<String>,
) -> CreditResult<Json<serde_json::Value>> {
    state.redemption.delete(&code).await?;
    Ok(Json(serde_json::json!({"deleted": code})))
}

/// `GET /credit/redemption_codes/{code}/receive` — a user redeems a code
/// for themself.
pub async fn receive_code(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(code): Path<String>,
) -> CreditResult<Json<serde_json::Value>> {
    let balance = state
        .redemption
        .redeem(&state.ledger, state.config.credit.exchange_ratio, &code, &user_id)
        .await?;
    Ok(Json(serde_json::json!({"credit": balance})))
}
