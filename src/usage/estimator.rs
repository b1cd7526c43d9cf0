use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tiktoken_rs::{CoreBPE, get_bpe_from_model};
use tracing::warn;

use super::image::calculate_image_token;
use super::{CompletionUsage, MessageBody, MessageContent, MessageItem};

/// Process-wide encoder cache, keyed by the model id the encoder was
/// resolved for. Concurrent misses may each build and insert their own
/// `CoreBPE`; both are equivalent for the same model id, so last-writer-wins
/// is fine — mirrors the global counter in the agent metering module.
static ENCODER_CACHE: OnceLock<RwLock<HashMap<String, Arc<CoreBPE>>>> = OnceLock::new();

fn cache() -> &'static RwLock<HashMap<String, Arc<CoreBPE>>> {
    ENCODER_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Strip a configured literal prefix from a model id before resolving its
/// encoder (e.g. `"azure/gpt-4o"` with prefix `"azure/"` resolves as
/// `"gpt-4o"`). Unlike the source system's character-set `lstrip`, this is a
/// true prefix strip — it removes the prefix once if present, rather than
/// stripping every leading character that happens to appear in the prefix
/// string. See DESIGN.md for the reasoning.
pub fn strip_model_prefix(model_id: &str, prefix: &str) -> String {
    if !prefix.is_empty() {
        if let Some(stripped) = model_id.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    model_id.to_string()
}

/// Resolve (and cache) the encoder for a model id, falling back to the
/// configured default model's encoding on any lookup failure.
pub fn encoder_for(model_id: &str, default_model: &str) -> Arc<CoreBPE> {
    if let Some(enc) = cache().read().expect("encoder cache poisoned").get(model_id) {
        return Arc::clone(enc);
    }

    let built = get_bpe_from_model(model_id)
        .or_else(|_| get_bpe_from_model(default_model))
        .map(Arc::new)
        .unwrap_or_else(|e| {
            warn!(model = %model_id, default = %default_model, "falling back to cl100k_base: {e}");
            Arc::new(tiktoken_rs::cl100k_base().expect("cl100k_base is always constructible"))
        });

    cache()
        .write()
        .expect("encoder cache poisoned")
        .insert(model_id.to_string(), Arc::clone(&built));
    built
}

fn count_text(encoder: &CoreBPE, text: &str) -> u64 {
    encoder.encode_ordinary(text).len() as u64
}

/// Sum prompt tokens across every message, dispatching by content part:
/// text is encoded directly, images go through the geometric estimator,
/// everything else (audio, file, unknown) contributes zero.
pub async fn count_prompt_tokens(
    encoder: &CoreBPE,
    model_id: &str,
    http: &reqwest::Client,
    messages: &[MessageItem],
) -> u64 {
    let mut total = 0u64;
    for message in messages {
        match &message.content {
            MessageBody::Text(text) => total += count_text(encoder, text),
            MessageBody::Parts(parts) => {
                for part in parts {
                    total += match part {
                        MessageContent::Text { text } => count_text(encoder, text),
                        MessageContent::ImageUrl { image_url } => {
                            calculate_image_token(model_id, http, image_url)
                                .await
                                .unwrap_or_else(|e| {
                                    warn!("image token estimate failed, counting as zero: {e}");
                                    0
                                })
                        }
                        MessageContent::InputAudio { .. }
                        | MessageContent::File { .. }
                        | MessageContent::Unknown => 0,
                    };
                }
            }
        }
    }
    total
}

/// `estimate(model_id, messages, response_piece, cached_prompt_tokens)` from
/// the spec. `response_piece` is the already-normalised chunk (see
/// `crate::ledger::scope`); `is_stream` selects delta vs. full message
/// content. Returns `(is_authoritative, usage)`.
pub async fn estimate(
    encoder: &CoreBPE,
    model_id: &str,
    http: &reqwest::Client,
    messages: &[MessageItem],
    cached_prompt_tokens: u64,
    response_piece: &serde_json::Value,
    is_stream: bool,
) -> (bool, CompletionUsage) {
    if let Some(usage_value) = response_piece.get("usage") {
        if let Some(usage) = CompletionUsage::from_vendor_json(usage_value) {
            return (true, usage);
        }
    }

    let prompt_tokens = if cached_prompt_tokens > 0 {
        cached_prompt_tokens
    } else {
        count_prompt_tokens(encoder, model_id, http, messages).await
    };

    let content = response_piece
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| {
            if is_stream {
                choice.get("delta").and_then(|d| d.get("content"))
            } else {
                choice.get("message").and_then(|m| m.get("content"))
            }
        })
        .and_then(|c| c.as_str())
        .unwrap_or("");

    let completion_tokens = count_text(encoder, content);
    (false, CompletionUsage::new(prompt_tokens, completion_tokens))
}
