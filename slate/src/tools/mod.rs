//! Tool trait and the canonical result envelope.
//!
//! Every tool or agent call in the runtime resolves to a [`ToolResult`]:
//! a short `content` string for history plus an arbitrary structured `data`
//! payload. Local tools implement [`Tool`]; MCP-backed tools are executed by
//! the MCP session layer and wrapped into the same envelope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a [`ToolResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    ToolResult,
    Error,
    LlmResult,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::ToolResult => "tool_result",
            ResultType::Error => "error",
            ResultType::LlmResult => "llm_result",
        }
    }
}

/// Canonical return envelope for any tool or agent call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub result_type: ResultType,
    /// Short text for the message log.
    pub content: String,
    /// Full structured payload; may include MCP `attachments` and the
    /// sanitized call response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            result_type: ResultType::ToolResult,
            content: content.into(),
            data,
        }
    }

    pub fn error(content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            result_type: ResultType::Error,
            content: content.into(),
            data,
        }
    }

    pub fn llm(content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            result_type: ResultType::LlmResult,
            content: content.into(),
            data,
        }
    }

    pub fn is_error(&self) -> bool {
        self.result_type == ResultType::Error
    }
}

/// Per-call input for a local tool.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    /// Arguments as produced by the argument-generation step.
    pub arguments: serde_json::Map<String, Value>,
    /// Scoped sandbox hints forwarded from blackboard state.
    pub allowed_read_files: Option<Value>,
    pub allowed_write_files: Option<Value>,
}

impl ToolInvocation {
    pub fn new(arguments: serde_json::Map<String, Value>) -> Self {
        Self {
            arguments,
            allowed_read_files: None,
            allowed_write_files: None,
        }
    }
}

/// A locally implemented tool. Execution failures must be caught by the
/// implementation and surfaced as a `ToolResult` of kind `error` where
/// possible; panics and transport errors are converted by the caller.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name; must match the registry entry it is paired with.
    fn name(&self) -> &str;

    async fn execute(&self, invocation: ToolInvocation) -> ToolResult;
}

/// Constructor for a local tool, paired with an on-disk registry entry by name.
pub type ToolFactory = std::sync::Arc<dyn Fn() -> Box<dyn Tool> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, invocation: ToolInvocation) -> ToolResult {
            let text = invocation
                .arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            ToolResult::ok(text, None)
        }
    }

    /// **Scenario**: a tool echoes its argument through the envelope.
    #[tokio::test]
    async fn echo_tool_roundtrip() {
        let tool = Echo;
        let mut args = serde_json::Map::new();
        args.insert("text".into(), Value::String("hi".into()));
        let result = tool.execute(ToolInvocation::new(args)).await;
        assert_eq!(result.content, "hi");
        assert!(!result.is_error());
    }

    #[test]
    fn result_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResultType::ToolResult).unwrap(),
            "\"tool_result\""
        );
        assert_eq!(ResultType::Error.as_str(), "error");
    }
}
