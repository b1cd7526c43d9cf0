use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::CreditConfig;
use crate::money::decimal_from_json;

/// Per-model price overrides, as stored on the model catalogue entry.
/// Missing keys fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub prompt_price: Option<Decimal>,
    #[serde(default)]
    pub completion_price: Option<Decimal>,
    #[serde(default)]
    pub request_price: Option<Decimal>,
    #[serde(default)]
    pub minimum_credit: Option<Decimal>,
}

/// The subset of a model catalogue entry the pricing resolver needs.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub base_model_id: Option<String>,
    pub price: Option<ModelPrice>,
}

/// Resolved `(prompt, completion, request, minimum)` unit prices, all
/// per-million-tokens (or flat, for request/minimum).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitPrices {
    pub prompt: Decimal,
    pub completion: Decimal,
    pub request: Decimal,
    pub minimum_credit: Decimal,
}

impl UnitPrices {
    /// A model is "free" when every per-token/per-request price is zero —
    /// the admission controller treats such a model as always allowed.
    pub fn is_free(&self) -> bool {
        self.prompt <= Decimal::ZERO && self.completion <= Decimal::ZERO && self.request <= Decimal::ZERO
    }
}

const MAX_INHERITANCE_DEPTH: u32 = 8;

/// Resolve unit prices for a model id, following `base_model_id`
/// inheritance up to a bounded depth. A cycle or missing base model falls
/// back to the configured defaults rather than looping or erroring —
/// pricing must never block a request from completing.
pub fn resolve<F>(config: &CreditConfig, model_id: &str, lookup: F) -> UnitPrices
where
    F: Fn(&str) -> Option<ModelInfo>,
{
    resolve_depth(config, model_id, &lookup, 0)
}

fn resolve_depth<F>(config: &CreditConfig, model_id: &str, lookup: &F, depth: u32) -> UnitPrices
where
    F: Fn(&str) -> Option<ModelInfo>,
{
    let defaults = UnitPrices {
        prompt: config.usage.default_token_price,
        completion: config.usage.default_token_price,
        request: config.usage.default_request_price,
        minimum_credit: Decimal::ZERO,
    };

    if depth >= MAX_INHERITANCE_DEPTH {
        return defaults;
    }

    let model = match lookup(model_id) {
        Some(m) => m,
        None => return defaults,
    };

    if let Some(base_id) = model.base_model_id.as_deref() {
        if !base_id.is_empty() && base_id != model_id {
            return resolve_depth(config, base_id, lookup, depth + 1);
        }
    }

    let price = model.price.unwrap_or_default();
    UnitPrices {
        prompt: price.prompt_price.unwrap_or(defaults.prompt),
        completion: price.completion_price.unwrap_or(defaults.completion),
        request: price.request_price.unwrap_or(defaults.request),
        minimum_credit: price.minimum_credit.unwrap_or_default(),
    }
}

/// Feature surcharge lookup. Unknown features contribute nothing — a
/// client enabling a feature this crate does not yet know how to price
/// should not be billed for it, only for the tokens it spends.
pub fn feature_price(config: &CreditConfig, features: &[String]) -> Decimal {
    features
        .iter()
        .map(|f| match f.as_str() {
            "image_generation" => config.usage.feature_image_generation_price,
            "code_interpreter" => config.usage.feature_code_execute_price,
            "web_search" => config.usage.feature_web_search_price,
            "direct_tool_servers" => config.usage.feature_tool_server_price,
            _ => Decimal::ZERO,
        })
        .sum()
}

/// Extract a `Vec<ModelInfo>`-friendly price map from a JSON `price` field
/// shaped like `{"prompt_price": .., "completion_price": .., ...}`.
pub fn model_price_from_json(value: &serde_json::Value) -> ModelPrice {
    ModelPrice {
        prompt_price: Some(decimal_from_json(value.get("prompt_price"))),
        completion_price: Some(decimal_from_json(value.get("completion_price"))),
        request_price: Some(decimal_from_json(value.get("request_price"))),
        minimum_credit: Some(decimal_from_json(value.get("minimum_credit"))),
    }
}

/// In-memory model catalogue used by tests and by the admin price-editing
/// endpoints before they are persisted. The gateway's real model catalogue
/// is out of scope (see SPEC_FULL.md §1 Non-goals); this is the minimal
/// shape the resolver needs from it.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: ModelInfo) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<ModelInfo> {
        self.models.get(id).cloned()
    }

    pub fn all(&self) -> Vec<ModelInfo> {
        self.models.values().cloned().collect()
    }

    /// Update a known model's price, leaving everything else about the
    /// entry untouched. A `None` price clears any override back to the
    /// configured defaults. Silently does nothing for an unknown model id
    /// — admin price edits only ever touch models the catalogue already
    /// knows about.
    pub fn set_price(&mut self, id: &str, price: Option<ModelPrice>) {
        if let Some(model) = self.models.get_mut(id) {
            model.price = price;
        }
    }
}
