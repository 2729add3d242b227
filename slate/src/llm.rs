//! LLM client abstraction for agent turns.
//!
//! Agents depend on a single call shape: messages in, structured JSON object
//! out, constrained by a closed schema. This module defines the trait, the
//! message/content types (including image blocks for vision agents), helpers
//! for parsing fenced JSON, quota-exhaustion detection, and a mock
//! implementation for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Per-agent LLM parameters, as configured in `config.yaml` `llm_params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-call timeout; expiry surfaces as an error the caller records.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_engine() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f64 {
    0.1
}

fn default_timeout() -> u64 {
    120
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            engine: default_engine(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// One content block inside a chat message. Plain text in the common case;
/// image blocks feed vision agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { url: String },
    ImagePath { path: String },
    ImageBase64 { data: String, mime_type: String },
}

/// One chat message sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl LlmMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// LLM client: given messages and an optional closed response schema, return
/// a structured JSON object.
///
/// Implementations must honor `params.timeout_seconds` and surface timeouts
/// and transport failures as [`RuntimeError::ExecutionFailed`]; callers record
/// those in state rather than crashing. Quota exhaustion must be detected via
/// [`check_for_quota_error`] on both response text and error text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn structured_output(
        &self,
        messages: &[LlmMessage],
        schema: Option<&Value>,
        params: &LlmParams,
    ) -> Result<Value, RuntimeError>;
}

/// Substrings that mark quota exhaustion in a response or error text. Matching
/// any of them is fatal for the whole process.
pub const QUOTA_KEYWORDS: &[&str] = &[
    "llm quota",
    "quota exceeded",
    "rate limit exceeded",
    "insufficient quota",
    "quota exhausted",
    "billing quota",
    "usage quota",
];

/// Scans `text` for quota keywords; returns the fatal error when one matches.
pub fn check_for_quota_error(agent: &str, text: &str) -> Result<(), RuntimeError> {
    let lower = text.to_lowercase();
    for keyword in QUOTA_KEYWORDS {
        if lower.contains(keyword) {
            tracing::error!(agent, keyword, "LLM quota exhaustion detected");
            let preview: String = text.chars().take(500).collect();
            return Err(RuntimeError::QuotaExhausted {
                keyword: keyword.to_string(),
                preview,
            });
        }
    }
    Ok(())
}

/// Strips leading/trailing markdown code fences and parses the first JSON
/// value in the remainder. Providers routinely wrap JSON in ```json fences.
pub fn parse_structured_text(text: &str) -> Result<Value, RuntimeError> {
    let trimmed = text.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop an optional language tag on the fence line.
        let rest = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or(rest);
        rest.strip_suffix("```").unwrap_or(rest)
    } else {
        trimmed
    };
    let mut deserializer = serde_json::Deserializer::from_str(body.trim());
    let value = Value::deserialize(&mut deserializer)?;
    Ok(value)
}

/// One captured request to [`MockLlm`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<LlmMessage>,
    pub schema: Option<Value>,
}

/// Scripted mock: pops one queued response per call. Runs out ⇒ error, which
/// mirrors a provider failure and exercises the caller's error path.
pub struct MockLlm {
    responses: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlm {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Text of the last user message sent, for prompt assertions.
    pub fn last_user_prompt(&self) -> Option<String> {
        self.calls.lock().unwrap().last().and_then(|call| {
            call.messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(LlmMessage::text)
        })
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn structured_output(
        &self,
        messages: &[LlmMessage],
        schema: Option<&Value>,
        _params: &LlmParams,
    ) -> Result<Value, RuntimeError> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            schema: schema.cloned(),
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RuntimeError::ExecutionFailed("mock LLM: no scripted response".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_keywords_match_case_insensitively() {
        let err = check_for_quota_error("planner", "Error: Quota Exceeded for org").unwrap_err();
        assert!(matches!(err, RuntimeError::QuotaExhausted { .. }));
        assert!(check_for_quota_error("planner", "all good").is_ok());
    }

    #[test]
    fn fenced_json_is_parsed() {
        let value = parse_structured_text("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value, json!({"a": 1}));
        let bare = parse_structured_text("  {\"b\": 2} ").unwrap();
        assert_eq!(bare, json!({"b": 2}));
    }

    #[test]
    fn first_json_value_wins_over_trailing_prose() {
        let value = parse_structured_text("{\"a\": 1} trailing commentary").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn mock_llm_pops_scripted_responses_in_order() {
        let llm = MockLlm::new(vec![json!({"n": 1}), json!({"n": 2})]);
        let params = LlmParams::default();
        let first = llm
            .structured_output(&[LlmMessage::user("hi")], None, &params)
            .await
            .unwrap();
        assert_eq!(first, json!({"n": 1}));
        let second = llm
            .structured_output(&[], Some(&json!({})), &params)
            .await
            .unwrap();
        assert_eq!(second, json!({"n": 2}));
        assert!(llm.structured_output(&[], None, &params).await.is_err());
        assert_eq!(llm.call_count(), 3);
        assert!(llm.calls()[1].schema.is_some());
        assert_eq!(llm.last_user_prompt(), None);
    }

    #[test]
    fn llm_message_text_joins_blocks() {
        let msg = LlmMessage {
            role: "user".into(),
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ImagePath { path: "/x.png".into() },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(msg.text(), "a\nb");
    }
}
