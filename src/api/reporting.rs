use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::auth::AdminAuth;
use super::AppState;
use crate::error::CreditResult;
use crate::reporting::Statistics;

#[derive(Debug, Deserialize)]
pub struct StatisticsRequest {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

/// `POST /credit/statistics {start_time, end_time}` — operator reporting
/// over a time range.
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Json(body): Json<StatisticsRequest>,
) -> CreditResult<Json<Statistics>> {
    let stats =
        crate::reporting::statistics(&state.ledger, &state.tickets, body.start_time, body.end_time)
            .await?;
    Ok(Json(stats))
}
