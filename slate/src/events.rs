//! Event hub: topic pub/sub for progress facts and scheduler events.
//!
//! The runtime publishes `agent_progress_fact` events on every tool invoke
//! and return so observers (UI relays, logs) can follow execution without
//! touching the blackboard. Registration is idempotent; delivery is
//! fire-and-forget.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::message::Message;

/// Topic every tool invoke/return progress fact is published on.
pub const PROGRESS_FACT_TOPIC: &str = "agent_progress_fact";

pub trait EventHub: Send + Sync {
    /// Publishes a message on its `event_topic`. Messages without a topic are
    /// dropped.
    fn publish(&self, message: Message);

    /// Registers a named subscriber for a topic. Re-registering the same
    /// subscriber is a no-op.
    fn register(&self, topic: &str, subscriber: &str);

    /// Subscribers currently registered for a topic.
    fn subscribers(&self, topic: &str) -> Vec<String>;

    /// Messages published on a topic so far (newest last).
    fn published(&self, topic: &str) -> Vec<Message>;
}

/// In-process hub backed by simple maps. Suitable for a single process;
/// cross-process relays implement [`EventHub`] over their own transport.
#[derive(Default)]
pub struct InMemoryEventHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    subscribers: HashMap<String, Vec<String>>,
    log: HashMap<String, Vec<Message>>,
}

impl InMemoryEventHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventHub for InMemoryEventHub {
    fn publish(&self, message: Message) {
        let Some(topic) = message.event_topic.clone() else {
            tracing::debug!("dropping event without topic");
            return;
        };
        self.inner
            .lock()
            .unwrap()
            .log
            .entry(topic)
            .or_default()
            .push(message);
    }

    fn register(&self, topic: &str, subscriber: &str) {
        let mut inner = self.inner.lock().unwrap();
        let subs = inner.subscribers.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s == subscriber) {
            subs.push(subscriber.to_string());
        }
    }

    fn subscribers(&self, topic: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn published(&self, topic: &str) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .log
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

/// Builds an `agent_progress_fact` message for a tool invoke or return.
pub fn progress_fact(sender: &str, data: Value) -> Message {
    Message::new()
        .with_sender(sender)
        .with_event_topic(PROGRESS_FACT_TOPIC)
        .with_data(data)
}

/// Progress payload for "about to call" facts.
pub fn tool_call_fact(agent: Option<&str>, manager: &str, tool: &str) -> Value {
    json!({
        "kind": "tool_call",
        "agent": agent,
        "manager": manager,
        "tool": tool,
        "next_action": tool,
    })
}

/// Progress payload for "result arrived" facts.
pub fn tool_result_fact(
    agent: Option<&str>,
    tool: Option<&str>,
    result_type: &str,
    tool_result_id: Option<&str>,
    preview: &str,
) -> Value {
    json!({
        "kind": "tool_result",
        "agent": agent,
        "tool": tool,
        "result_type": result_type,
        "tool_result_id": tool_result_id,
        "preview": preview,
    })
}
