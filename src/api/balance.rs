use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::auth::{AdminAuth, UserId};
use super::AppState;
use crate::error::{CreditError, CreditResult};
use crate::ledger::LedgerEntry;

const PAGE_SIZE: i64 = 100;

/// `GET /credit/config` — public information a client needs to render a
/// top-up UI: the configured exchange ratio and which payment method to
/// default to.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "exchange_ratio": state.config.credit.exchange_ratio,
        "pay_priority": state.config.ezfp.pay_priority,
        "pay_enabled": state.config.ezfp.endpoint.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    page: Option<i64>,
}

fn offset_for(page: Option<i64>) -> i64 {
    page.filter(|p| *p > 0).map(|p| (p - 1) * PAGE_SIZE).unwrap_or(0)
}

/// `GET /credit/logs?page=` — the caller's own ledger, newest first.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Query(query): Query<PageQuery>,
) -> CreditResult<Json<Vec<LedgerEntry>>> {
    let entries = state
        .ledger
        .list(&user_id, offset_for(query.page), PAGE_SIZE)
        .await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct AllLogsQuery {
    query: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

/// `GET /credit/all_logs?query&page&limit` — operator view across every
/// user. `query`, when present, filters by user id.
pub async fn list_all_logs(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Query(query): Query<AllLogsQuery>,
) -> CreditResult<Json<Vec<LedgerEntry>>> {
    let limit = query.limit.unwrap_or(PAGE_SIZE);
    let offset = offset_for(query.page);

    let entries = match query.query.as_deref() {
        Some(user_id) if !user_id.is_empty() => state.ledger.list(user_id, offset, limit).await?,
        _ => state.ledger.list_all(offset, limit).await?,
    };
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    timestamp: DateTime<Utc>,
}

/// `DELETE /credit/logs {timestamp}` — operator bulk-prune of entries
/// older than `timestamp`.
pub async fn prune_logs(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Json(body): Json<PruneRequest>,
) -> CreditResult<Json<serde_json::Value>> {
    if body.timestamp > Utc::now() {
        return Err(CreditError::input("timestamp must not be in the future"));
    }
    let affected = state.ledger.prune(body.timestamp).await?;
    Ok(Json(serde_json::json!({"affected_rows": affected})))
}
