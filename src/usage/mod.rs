pub mod estimator;
pub mod image;

use serde::{Deserialize, Serialize};

/// Normalized token usage for one LLM call.
///
/// Field names follow the OpenAI convention; `from_vendor_json` collapses
/// the Anthropic / Gemini aliases onto these before anything else looks at
/// the object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<serde_json::Value>,
}

impl CompletionUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
            completion_tokens_details: None,
        }
    }

    /// Parse a vendor `usage` object, collapsing known aliases. Returns
    /// `None` when the value has none of the recognised fields at all
    /// (as opposed to a usage block that is present but all-zero).
    pub fn from_vendor_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;

        let prompt_tokens = first_nonzero_u64(
            obj,
            &["prompt_tokens", "promptTokenCount", "input_tokens"],
        );
        let completion_tokens = first_nonzero_u64(
            obj,
            &["completion_tokens", "candidatesTokenCount", "output_tokens"],
        );
        let total_tokens = first_nonzero_u64(obj, &["total_tokens", "totalTokenCount"])
            .filter(|t| *t > 0)
            .unwrap_or(prompt_tokens + completion_tokens);

        if prompt_tokens == 0 && completion_tokens == 0 && total_tokens == 0 {
            return None;
        }

        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            prompt_tokens_details: obj.get("prompt_tokens_details").cloned(),
            completion_tokens_details: obj.get("completion_tokens_details").cloned(),
        })
    }
}

fn first_nonzero_u64(obj: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> u64 {
    for key in keys {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_u64()) {
            if v > 0 {
                return v;
            }
        }
    }
    0
}

/// One image referenced from a message, with an optional vendor `detail`
/// hint (`"low" | "high" | "auto"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// One part of a polymorphic message content list. Unknown `type` tags are
/// preserved but contribute zero tokens — new vendor content types appear
/// faster than this crate can be updated to price them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    InputAudio {
        #[serde(default)]
        input_audio: serde_json::Value,
    },
    File {
        #[serde(default)]
        file: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

/// A chat message whose content is either a plain string or an ordered
/// list of typed parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageItem {
    pub role: String,
    pub content: MessageBody,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<MessageContent>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_openai_aliases() {
        let v = serde_json::json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15});
        let usage = CompletionUsage::from_vendor_json(&v).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn collapses_gemini_aliases() {
        let v = serde_json::json!({"promptTokenCount": 7, "candidatesTokenCount": 3});
        let usage = CompletionUsage::from_vendor_json(&v).unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn collapses_anthropic_aliases() {
        let v = serde_json::json!({"input_tokens": 4, "output_tokens": 2});
        let usage = CompletionUsage::from_vendor_json(&v).unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 6);
    }

    #[test]
    fn missing_usage_block_returns_none() {
        let v = serde_json::json!({"model": "gpt-4o"});
        assert!(CompletionUsage::from_vendor_json(&v).is_none());
    }

    #[test]
    fn message_content_parses_string_or_parts() {
        let text: MessageItem =
            serde_json::from_value(serde_json::json!({"role": "user", "content": "hi"})).unwrap();
        assert!(matches!(text.content, MessageBody::Text(_)));

        let parts: MessageItem = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [{"type": "text", "text": "hi"}, {"type": "made_up"}]
        }))
        .unwrap();
        match parts.content {
            MessageBody::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected parts"),
        }
    }
}
