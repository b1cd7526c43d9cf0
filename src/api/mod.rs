pub mod auth;
mod balance;
mod models;
mod redemption;
mod reporting;
mod tickets;

use std::sync::{Arc, RwLock};

use axum::routing::{delete, get, post, put};
use axum::Router;
use sqlx::SqlitePool;
use tiktoken_rs::CoreBPE;

use crate::config::CreditConfig;
use crate::ledger::CreditLedger;
use crate::payment::{EzfpClient, TicketStore};
use crate::pricing::ModelCatalog;
use crate::redemption::RedemptionCodes as RedemptionStore;
use crate::usage::estimator;

/// Shared state handed to every handler. Constructed once at startup from
/// a pool and config, then cloned (as an `Arc`) into each request.
pub struct AppState {
    pub config: CreditConfig,
    pub ledger: CreditLedger,
    pub tickets: TicketStore,
    pub redemption: RedemptionStore,
    pub ezfp: EzfpClient,
    pub http: reqwest::Client,
    pub default_encoder: Arc<CoreBPE>,
    /// In-memory stand-in for the host platform's real model catalogue
    /// (see SPEC_FULL.md §1 Non-goals) — just enough for the pricing
    /// resolver and the admin price-editing endpoints to operate on.
    pub models: RwLock<ModelCatalog>,
}

impl AppState {
    pub fn new(config: CreditConfig, pool: SqlitePool) -> Arc<Self> {
        let default_encoder = estimator::encoder_for(
            &config.usage.default_encoding_model,
            &config.usage.default_encoding_model,
        );
        let http = reqwest::Client::new();
        let ezfp = EzfpClient::new(http.clone(), config.ezfp.clone());
        Arc::new(Self {
            ledger: CreditLedger::new(pool.clone()),
            tickets: TicketStore::new(pool.clone()),
            redemption: RedemptionStore::new(pool),
            ezfp,
            http,
            default_encoder,
            models: RwLock::new(ModelCatalog::new()),
            config,
        })
    }
}

/// Build the full `/credit` router. `prefix` mirrors the host platform
/// mounting this under its own API versioning (elided in the spec's HTTP
/// surface table).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/credit/config", get(balance::get_config))
        .route("/credit/logs", get(balance::list_logs))
        .route("/credit/all_logs", get(balance::list_all_logs))
        .route("/credit/logs", delete(balance::prune_logs))
        .route("/credit/tickets", post(tickets::create_ticket))
        .route("/credit/callback", get(tickets::callback))
        .route("/credit/callback/redirect", get(tickets::callback_redirect))
        .route("/credit/models/price", get(models::get_model_price))
        .route("/credit/models/price", put(models::update_model_price))
        .route("/credit/redemption_codes", get(redemption::list_codes))
        .route("/credit/redemption_codes", post(redemption::issue_codes))
        .route("/credit/redemption_codes/export", get(redemption::export_codes))
        .route("/credit/redemption_codes/{code}", put(redemption::update_code))
        .route("/credit/redemption_codes/{code}", delete(redemption::delete_code))
        .route("/credit/redemption_codes/{code}/receive", get(redemption::receive_code))
        .route("/credit/statistics", post(reporting::statistics))
        .with_state(state)
}
