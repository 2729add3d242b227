//! Blackboard message types.
//!
//! A [`Message`] is an immutable record appended to a blackboard's log. The
//! blackboard stamps each message with the scope active at append time; after
//! that, the record is never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of record a message is. Drives history compaction and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Task,
    AgentRequest,
    AgentResponse,
    AgentResult,
    AgentMsg,
    ToolRequest,
    ToolResult,
    ToolResultSummary,
    PlannerResult,
}

/// Input handed to a called agent: either a free-form string or a structured
/// map that gets unpacked into the callee's scope state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentInput {
    Text(String),
    Map(serde_json::Map<String, Value>),
}

/// One record in the blackboard log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Optional tags, e.g. `result` on exit responses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_data_type: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_input: Option<AgentInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Stamped by the blackboard on append; `None` until then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data_type: None,
            sub_data_type: Vec::new(),
            sender: None,
            receiver: None,
            content: String::new(),
            data: None,
            agent_input: None,
            metadata: None,
            scope_id: None,
            role: None,
            event_topic: None,
            request_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn with_sub_data_type(mut self, tag: impl Into<String>) -> Self {
        self.sub_data_type.push(tag.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_agent_input(mut self, input: AgentInput) -> Self {
        self.agent_input = Some(input);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_event_topic(mut self, topic: impl Into<String>) -> Self {
        self.event_topic = Some(topic.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
