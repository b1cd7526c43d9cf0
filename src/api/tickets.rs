use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::auth::UserId;
use super::AppState;
use crate::error::{CreditError, CreditResult};
use crate::payment::{generate_trade_no, webhook, PaymentTicket};

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub pay_type: String,
    pub amount: Decimal,
}

/// `POST /credit/tickets` — start a checkout. Builds and signs the
/// gateway request, persists the ticket, and returns it (the gateway's
/// raw JSON response lives in `detail`, for the client to extract a QR
/// code or redirect URL from).
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateTicketRequest>,
) -> CreditResult<Json<PaymentTicket>> {
    if body.amount <= Decimal::ZERO {
        return Err(CreditError::input("amount must be > 0"));
    }

    let out_trade_no = generate_trade_no(chrono::Utc::now());
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("");

    let response = state
        .ezfp
        .create_trade(
            &body.pay_type,
            &out_trade_no,
            body.amount,
            &addr.ip().to_string(),
            user_agent,
            "Credit",
        )
        .await;

    // Stored verbatim, success or not (`code: -1` for a rejected amount or
    // an upstream failure) — the client inspects `code`/`msg` itself,
    // mirroring the source system's checkout endpoint.
    let mut detail = response.extra.clone();
    detail.insert("code".to_string(), serde_json::json!(response.code));
    detail.insert("msg".to_string(), serde_json::json!(response.msg));
    let detail = serde_json::Value::Object(detail);

    let ticket = state
        .tickets
        .insert(&out_trade_no, &user_id, body.amount, detail)
        .await?;
    Ok(Json(ticket))
}

/// `GET /credit/callback` — the payment gateway's webhook. Always
/// returns a plain-text 200; the response body, not the status code, is
/// the provider's signal (see `payment::webhook`).
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> String {
    let callback = serde_json::to_value(&params).unwrap_or(serde_json::Value::Null);
    match webhook::process_callback(
        &state.config.ezfp,
        &state.tickets,
        &state.ledger,
        state.config.credit.exchange_ratio,
        &callback,
    )
    .await
    {
        Ok(body) => body.to_string(),
        Err(e) => {
            tracing::error!("payment callback failed: {e}");
            webhook::SUCCESS.to_string()
        }
    }
}

/// `GET /credit/callback/redirect` — 302 to the configured host after a
/// hosted checkout page finishes.
pub async fn callback_redirect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let host = state.config.ezfp.callback_host.clone().unwrap_or_default();
    (StatusCode::FOUND, [(axum::http::header::LOCATION, host)])
}
