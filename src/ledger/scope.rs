use rust_decimal::Decimal;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::{error, info};

use super::CreditLedger;
use crate::error::CreditResult;
use crate::money;
use crate::pricing::UnitPrices;
use crate::usage::estimator;
use crate::usage::{CompletionUsage, MessageItem};

/// A raw chunk as it arrives from the provider call site, before
/// normalisation. Mirrors the three shapes `CreditDeduct.feed` accepts in
/// the source system: an already-structured object, a raw byte frame
/// (typically an SSE line), or a owned string.
pub enum RawChunk {
    Value(serde_json::Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl From<serde_json::Value> for RawChunk {
    fn from(v: serde_json::Value) -> Self {
        RawChunk::Value(v)
    }
}

impl From<String> for RawChunk {
    fn from(s: String) -> Self {
        RawChunk::Text(s)
    }
}

/// Normalise a chunk to a JSON object. Never fails: unparsable text
/// degrades to a minimal envelope carrying the raw text as message
/// content, so token estimation still has something to count.
fn clean_response(chunk: RawChunk, is_stream: bool) -> serde_json::Value {
    let text = match chunk {
        RawChunk::Value(v) => return v,
        RawChunk::Bytes(b) => String::from_utf8_lossy(&b).trim().to_string(),
        RawChunk::Text(t) => t.trim().to_string(),
    };

    let stripped = text.strip_prefix("data: ").unwrap_or(&text).trim();

    if stripped.is_empty() || stripped.starts_with("[DONE]") {
        return serde_json::json!({});
    }

    serde_json::from_str::<serde_json::Value>(stripped).unwrap_or_else(|_| {
        if is_stream {
            serde_json::json!({"choices": [{"delta": {"content": stripped}}]})
        } else {
            serde_json::json!({"choices": [{"message": {"content": stripped}}]})
        }
    })
}

/// A scoped accumulator bound to one LLM request. Opened before the call,
/// fed every chunk of the response, and closed exactly once — by explicit
/// [`close`](DeductionScope::close) on the happy path, or by `Drop` as a
/// backstop when the request future is dropped (error, cancellation) before
/// `close` runs.
pub struct DeductionScope {
    user_id: String,
    model_id: String,
    is_stream: bool,
    prices: UnitPrices,
    feature_ids: Vec<String>,
    feature_surcharge_flat: Decimal,
    minimum_cost: Decimal,
    usage: CompletionUsage,
    is_authoritative: bool,
    remote_id: String,
    cached_prompt_tokens: u64,
    messages: Vec<MessageItem>,
    closed: bool,
    ledger: CreditLedger,
    http: reqwest::Client,
    encoder: Arc<CoreBPE>,
}

impl DeductionScope {
    /// Opens a scope for one request, resolving the token encoder from
    /// `model_id` rather than accepting a pre-built one — so
    /// `model_prefix_to_remove` and per-model encoding selection
    /// (`USAGE_CALCULATE_MODEL_PREFIX_TO_REMOVE`) actually take effect on
    /// every request instead of only in the estimator's own unit tests.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        ledger: CreditLedger,
        http: reqwest::Client,
        model_prefix_to_remove: &str,
        default_encoding_model: &str,
        user_id: impl Into<String>,
        model_id: impl Into<String>,
        is_stream: bool,
        prices: UnitPrices,
        feature_ids: Vec<String>,
        feature_price_flat: Decimal,
        minimum_cost: Decimal,
        messages: Vec<MessageItem>,
    ) -> Self {
        let model_id = model_id.into();
        let stripped = estimator::strip_model_prefix(&model_id, model_prefix_to_remove);
        let encoder = estimator::encoder_for(&stripped, default_encoding_model);

        Self {
            user_id: user_id.into(),
            model_id,
            is_stream,
            prices,
            feature_ids,
            feature_surcharge_flat: feature_price_flat,
            minimum_cost,
            usage: CompletionUsage::default(),
            is_authoritative: false,
            remote_id: String::new(),
            cached_prompt_tokens: 0,
            messages,
            closed: false,
            ledger,
            http,
            encoder,
        }
    }

    /// Ingest one response chunk. Safe to call only from a single task at
    /// a time for a given scope — it takes `&mut self`, so the borrow
    /// checker already rules out concurrent feeds.
    pub async fn feed(&mut self, chunk: impl Into<RawChunk>) {
        let value = clean_response(chunk.into(), self.is_stream);
        if value.as_object().map(|o| o.is_empty()).unwrap_or(false) {
            return; // [DONE] / empty line — nothing to record
        }

        if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
            self.remote_id = id.to_string();
        }

        let (authoritative, usage) = estimator::estimate(
            &self.encoder,
            &self.model_id,
            &self.http,
            &self.messages,
            self.cached_prompt_tokens,
            &value,
            self.is_stream,
        )
        .await;

        if authoritative {
            self.is_authoritative = true;
            self.usage = usage;
            return;
        }

        if self.is_authoritative {
            return; // authoritative usage already latched; ignore estimates
        }

        if self.is_stream {
            self.cached_prompt_tokens = usage.prompt_tokens;
            self.usage.prompt_tokens = usage.prompt_tokens;
            self.usage.completion_tokens += usage.completion_tokens;
            self.usage.total_tokens = self.usage.prompt_tokens + self.usage.completion_tokens;
        } else {
            self.usage = usage;
        }
    }

    fn prompt_price(&self) -> Decimal {
        money::price_for_tokens(self.usage.prompt_tokens, self.prices.prompt)
    }

    fn completion_price(&self) -> Decimal {
        money::price_for_tokens(self.usage.completion_tokens, self.prices.completion)
    }

    fn request_price(&self) -> Decimal {
        money::price_flat(self.prices.request)
    }

    fn feature_price(&self) -> Decimal {
        money::price_flat(self.feature_surcharge_flat)
    }

    /// Total cost for the request so far, with the configured minimum
    /// cost floor applied. Per-request pricing (when configured) replaces
    /// token pricing entirely; it does not stack with it.
    pub fn total_price(&self) -> Decimal {
        let subtotal = if self.prices.request > Decimal::ZERO {
            self.request_price() + self.feature_price()
        } else {
            self.prompt_price() + self.completion_price() + self.feature_price()
        };
        subtotal.max(self.minimum_cost)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "usage": {
                "total_price": self.total_price(),
                "prompt_unit_price": self.prices.prompt,
                "completion_unit_price": self.prices.completion,
                "request_unit_price": self.prices.request,
                "feature_price": self.feature_price(),
                "features": self.feature_ids,
                "prompt_tokens": self.usage.prompt_tokens,
                "completion_tokens": self.usage.completion_tokens,
                "total_tokens": self.usage.total_tokens,
                "is_calculate": !self.is_authoritative,
            },
            "api_params": {
                "model": self.model_id,
                "is_stream": self.is_stream,
                "remote_id": self.remote_id,
            },
            "desc": "updated by DeductionScope",
        })
    }

    /// A server-sent-events-shaped usage frame for injection into the
    /// response stream sent back to the client.
    pub fn usage_message(&self, request_id: &str) -> String {
        let frame = serde_json::json!({
            "id": request_id,
            "object": "chat.completion.chunk",
            "model": self.model_id,
            "choices": [],
            "usage": self.usage,
        });
        format!("data: {}\n\n", frame)
    }

    /// Close the scope, recording exactly one ledger debit. Safe to call
    /// at most once; subsequent drops are no-ops.
    pub async fn close(mut self) -> CreditResult<super::Balance> {
        self.closed = true;
        let delta = -self.total_price();
        let detail = self.detail();
        self.ledger.add_delta(&self.user_id, delta, detail).await
    }
}

impl Drop for DeductionScope {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let ledger = self.ledger.clone();
        let user_id = self.user_id.clone();
        let delta = -self.total_price();
        let detail = self.detail();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.add_delta(&user_id, delta, detail).await {
                        error!(%user_id, "failed to record debit on scope drop: {e}");
                    } else {
                        info!(%user_id, "debit recorded by scope drop backstop");
                    }
                });
            }
            Err(_) => {
                error!(%user_id, "deduction scope dropped outside a tokio runtime; debit lost");
            }
        }
    }
}
