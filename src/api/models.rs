use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use super::auth::AdminAuth;
use super::AppState;
use crate::error::CreditResult;
use crate::pricing::ModelPrice;

/// `GET /credit/models/price` — every model's price override, keyed by
/// model id. An entry with no override at all is an empty object.
pub async fn get_model_price(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
) -> Json<HashMap<String, ModelPrice>> {
    let catalog = state.models.read().expect("model catalog lock poisoned");
    let prices = catalog
        .all()
        .into_iter()
        .map(|m| (m.id.clone(), m.price.unwrap_or_default()))
        .collect();
    Json(prices)
}

/// `PUT /credit/models/price` — bulk price update. Unknown model ids are
/// silently skipped, matching the source system's "best effort" admin
/// endpoint.
pub async fn update_model_price(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Json(body): Json<HashMap<String, Option<ModelPrice>>>,
) -> CreditResult<Json<String>> {
    let count = body.len();
    let mut catalog = state.models.write().expect("model catalog lock poisoned");
    for (model_id, price) in body {
        catalog.set_price(&model_id, price);
    }
    Ok(Json(format!("success update price for {count} models")))
}
