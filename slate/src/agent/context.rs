//! Prompt context assembly for agent turns.
//!
//! Agent configs declare `system_context_items` / `user_context_items`; each
//! key resolves to a context value through a fixed lookup order: built-in
//! keys, `resource_*` globals (with on-demand template rendering),
//! `tool_descriptions`, `allowed_nodes`, `recent_history`,
//! `history_to_summarize`, then plain blackboard state. Keys configured under
//! `rag_fields` additionally query the retrieval store and accumulate into
//! the `rag` key. `entity_*` keys run a second phase: the assembled context
//! is serialized, entities are detected over it, and `entity_info` is filled
//! from the card store.

use serde_json::{Map, Value};

use crate::error::RuntimeError;
use crate::message::{AgentInput, DataType, Message};
use crate::node::NodeContext;
use crate::prompt;
use crate::registry::AgentConfig;

const RESOURCE_PREFIX: &str = "resource_";
const ENTITY_PREFIX: &str = "entity_";

/// Builds the context map for one prompt (system or user side).
pub async fn build_context(
    ctx: &NodeContext,
    config: &AgentConfig,
    items: &[String],
    message: Option<&Message>,
) -> Result<Map<String, Value>, RuntimeError> {
    let bb = &ctx.blackboard;
    let mut context = Map::new();

    context.insert(
        "date_time".into(),
        Value::String(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
    );
    let action_count_key = format!("{}_action_count", config.name);
    context.insert(
        "action_count".into(),
        bb.get_state_value(&action_count_key).unwrap_or(Value::from(0)),
    );
    context.insert("rag".into(), Value::String(String::new()));

    if let Some(msg) = message {
        if !msg.content.trim().is_empty() {
            context.insert(
                "incoming_message".into(),
                Value::String(msg.content.trim().to_string()),
            );
        }
        if let Some(AgentInput::Text(text)) = &msg.agent_input {
            context.insert("agent_input".into(), Value::String(text.clone()));
        }
    }

    let (entity_keys, plain_keys): (Vec<&String>, Vec<&String>) =
        items.iter().partition(|k| k.starts_with(ENTITY_PREFIX));

    for key in plain_keys {
        if context.contains_key(key.as_str()) {
            continue;
        }

        if key.starts_with(RESOURCE_PREFIX) {
            context.insert(key.clone(), resolve_resource(ctx, key));
            continue;
        }

        match key.as_str() {
            "tool_descriptions" => {
                let allowed = config
                    .allowed_tools
                    .resolve(&ctx.tools.list(), &config.except_tools);
                let descriptions = ctx.tools.descriptions(&allowed);
                context.insert(
                    key.clone(),
                    Value::Object(
                        descriptions
                            .into_iter()
                            .map(|(name, desc)| (name, Value::String(desc)))
                            .collect(),
                    ),
                );
            }
            "allowed_nodes" => {
                let allowed = config
                    .allowed_nodes
                    .resolve(&ctx.agents.list(), &config.except_nodes);
                let nodes: Vec<Value> = allowed
                    .iter()
                    .map(|name| {
                        serde_json::json!({
                            "name": name,
                            "description": ctx.agents.rendered_description(name).unwrap_or_default(),
                        })
                    })
                    .collect();
                context.insert(key.clone(), Value::Array(nodes));
            }
            "recent_history" => {
                let scope_id = bb.get_current_scope_id();
                let messages = bb.get_messages_for_scope(&scope_id);
                context.insert(
                    key.clone(),
                    Value::String(build_recent_history(&messages)),
                );
            }
            "history_to_summarize" => {
                let text = bb
                    .messages_before_last_plan()
                    .iter()
                    .map(|m| m.content.trim())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                context.insert(key.clone(), Value::String(text));
            }
            _ => {
                let value = bb.get_state_value(key).unwrap_or(Value::Null);
                if let Some(scopes) = config.rag_fields.get(key.as_str()) {
                    if let Some(query) = value.as_str().filter(|q| !q.is_empty() && *q != "[MISSING]") {
                        let hits = ctx.rag.query(query, scopes, 2, 0.55).await;
                        if let Some(formatted) = crate::external::format_rag_hits(&hits) {
                            let existing = context
                                .get("rag")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            context.insert(
                                "rag".into(),
                                Value::String(format!("{existing}{formatted}\n")),
                            );
                        }
                    }
                }
                context.insert(key.clone(), value);
            }
        }
    }

    if entity_keys.is_empty() {
        return Ok(context);
    }

    // Second phase: one detection pass over the serialized phase-1 context.
    let serialized = serde_json::to_string(&context).unwrap_or_else(|_| {
        context
            .values()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    });

    let field_names: Vec<String> = entity_keys
        .iter()
        .map(|k| k[ENTITY_PREFIX.len()..].to_string())
        .collect();

    let raw_detected = if serialized.trim().is_empty() {
        Vec::new()
    } else {
        ctx.entities.detect_entities(&serialized).await
    };
    // Deduplicate while preserving detection order.
    let mut seen = std::collections::HashSet::new();
    let detected: Vec<String> = raw_detected
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect();

    for key in &entity_keys {
        context.insert((*key).clone(), Value::String(String::new()));
    }

    if detected.is_empty() {
        context.insert("entity_info".into(), Value::String(String::new()));
        return Ok(context);
    }
    tracing::info!(agent = %config.name, entities = ?detected, "detected entities in composed context");

    let mut blocks: Vec<String> = Vec::new();
    for entity in &detected {
        let mut parts = vec![format!("{entity}:")];
        for field in &field_names {
            let value = ctx.entities.entity_field(entity, field).await;
            if !value.is_empty() {
                parts.push(format!("  {}: {}", display_field_name(field), value));
            }
        }
        if parts.len() > 1 {
            blocks.push(parts.join("\n"));
        }
    }
    context.insert("entity_info".into(), Value::String(blocks.join("\n\n")));

    Ok(context)
}

/// `key_facts` → `Key Facts`.
fn display_field_name(field: &str) -> String {
    field
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves a `resource_*` key from global state. String values that look
/// like templates render on demand against the other `resource_*` globals.
fn resolve_resource(ctx: &NodeContext, resource_id: &str) -> Value {
    let bb = &ctx.blackboard;
    let Some(value) = bb
        .get_global_state_value(resource_id)
        .or_else(|| bb.get_state_value(resource_id))
    else {
        tracing::info!(resource = resource_id, "resource not found in global or local state");
        return Value::String(String::new());
    };

    let Some(text) = value.as_str() else {
        return value;
    };
    if !prompt::looks_like_template(text) {
        return value;
    }

    let mut render_ctx = Map::new();
    for key in bb.global_keys() {
        if key.starts_with(RESOURCE_PREFIX) && key != resource_id {
            if let Some(v) = bb.get_global_state_value(&key) {
                render_ctx.insert(key, v);
            }
        }
    }
    match prompt::render(resource_id, text, &Value::Object(render_ctx)) {
        Ok(rendered) => Value::String(rendered),
        Err(e) => {
            tracing::warn!(resource = resource_id, error = %e, "resource template render failed; using raw value");
            value
        }
    }
}

const HISTORY_TYPES: &[DataType] = &[
    DataType::ToolRequest,
    DataType::AgentRequest,
    DataType::ToolResult,
    DataType::AgentResult,
    DataType::ToolResultSummary,
];

fn is_result(msg: &Message) -> bool {
    matches!(
        msg.data_type,
        Some(DataType::ToolResult) | Some(DataType::AgentResult)
    )
}

/// Builds one chronological history string from an agent's scope messages.
///
/// Only request/result/summary types are considered. Without summaries the
/// contents are simply concatenated. With summaries present, each raw result
/// is replaced by the summary immediately following it, except the most
/// recent result which stays raw.
pub fn build_recent_history(messages: &[Message]) -> String {
    let msgs: Vec<&Message> = messages
        .iter()
        .filter(|m| m.data_type.map(|dt| HISTORY_TYPES.contains(&dt)).unwrap_or(false))
        .collect();

    let content_of = |m: &Message| m.content.trim().to_string();

    let has_summary = msgs
        .iter()
        .any(|m| m.data_type == Some(DataType::ToolResultSummary));
    if !has_summary {
        return msgs
            .iter()
            .map(|m| content_of(m))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut i = 0;
    while i < msgs.len() {
        let msg = msgs[i];
        match msg.data_type {
            Some(DataType::ToolRequest) | Some(DataType::AgentRequest) => {
                let content = content_of(msg);
                if !content.is_empty() {
                    pieces.push(content);
                }
                i += 1;
            }
            _ if is_result(msg) => {
                // Last message stays raw regardless of summaries.
                if i == msgs.len() - 1 {
                    let content = content_of(msg);
                    if !content.is_empty() {
                        pieces.push(content);
                    }
                    i += 1;
                    continue;
                }
                let next = msgs[i + 1];
                if next.data_type == Some(DataType::ToolResultSummary) {
                    let content = content_of(next);
                    if !content.is_empty() {
                        pieces.push(format!("SUMMARY CREATED: {content}"));
                    }
                    i += 2;
                } else {
                    let content = content_of(msg);
                    if !content.is_empty() {
                        pieces.push(content);
                    }
                    i += 1;
                }
            }
            Some(DataType::ToolResultSummary) => {
                // Emitted via the raw-result branch above; skip standalone.
                i += 1;
            }
            _ => {
                let content = content_of(msg);
                if !content.is_empty() {
                    pieces.push(content);
                }
                i += 1;
            }
        }
    }
    pieces.join("\n\n")
}

/// Message types a result-tagged final decision may arrive as. Raw tool
/// traffic is never eligible.
const RESULT_HISTORY_TYPES: &[DataType] = &[
    DataType::AgentResult,
    DataType::AgentResponse,
    DataType::AgentMsg,
    DataType::PlannerResult,
    DataType::ToolResultSummary,
];

/// When no explicit results exist, only this many trailing agent messages
/// are included, each capped this hard.
const FALLBACK_TAIL_LEN: usize = 12;
const FALLBACK_CHAR_CAP: usize = 2_000;

fn truncate_history(content: &str, cap: usize) -> String {
    let content = content.trim();
    if content.chars().count() > cap {
        let capped: String = content.chars().take(cap).collect();
        format!("{capped}...[truncated]")
    } else {
        content.to_string()
    }
}

/// High-signal history for final-answer agents.
///
/// Dumping the full tool trace makes the final-answer turn slow and
/// expensive, so raw `tool_result`/`tool_request` messages are stripped
/// outright. What remains is the set of messages tagged `result` among
/// agent/planner responses and summaries, each capped at `char_cap`
/// characters. When no explicit result messages exist, a small agent-only
/// tail (last 12 `agent_response`/`agent_msg`, 2000-char cap) stands in so
/// the model still has context without prompt bloat.
pub fn build_result_history(messages: &[Message], char_cap: usize) -> String {
    let agent_messages: Vec<&Message> = messages
        .iter()
        .filter(|m| {
            !matches!(
                m.data_type,
                Some(DataType::ToolResult) | Some(DataType::ToolRequest)
            )
        })
        .collect();

    let result_messages: Vec<&&Message> = agent_messages
        .iter()
        .filter(|m| {
            m.sub_data_type.iter().any(|t| t == "result")
                && m.data_type
                    .map(|dt| RESULT_HISTORY_TYPES.contains(&dt))
                    .unwrap_or(false)
        })
        .collect();

    if !result_messages.is_empty() {
        return result_messages
            .iter()
            .filter_map(|m| {
                let content = truncate_history(&m.content, char_cap);
                (!content.is_empty()).then(|| {
                    let sender = m.sender.as_deref().unwrap_or("agent").to_uppercase();
                    format!("=== {sender} FINAL RESULT ===\n{content}")
                })
            })
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    let agent_only: Vec<&&Message> = agent_messages
        .iter()
        .filter(|m| {
            matches!(
                m.data_type,
                Some(DataType::AgentResponse) | Some(DataType::AgentMsg)
            )
        })
        .collect();
    let start = agent_only.len().saturating_sub(FALLBACK_TAIL_LEN);
    agent_only[start..]
        .iter()
        .filter_map(|m| {
            let content = truncate_history(&m.content, FALLBACK_CHAR_CAP);
            (!content.is_empty())
                .then(|| format!("[{}] {content}", m.sender.as_deref().unwrap_or("agent")))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data_type: DataType, content: &str) -> Message {
        Message::new().with_data_type(data_type).with_content(content)
    }

    /// **Scenario**: with no summaries, contents concatenate in order and
    /// empty contents are skipped outright.
    #[test]
    fn history_without_summaries_concatenates() {
        let messages = vec![
            msg(DataType::ToolRequest, "calling search"),
            msg(DataType::ToolResult, "found 3 items"),
            msg(DataType::AgentResponse, "not a history type"),
            msg(DataType::ToolRequest, ""),
            msg(DataType::AgentResult, "sub-agent said hi"),
        ];
        let history = build_recent_history(&messages);
        assert_eq!(history, "calling search\n\nfound 3 items\n\nsub-agent said hi");
    }

    /// **Scenario**: summaries replace their raw results, except the most
    /// recent result which stays raw.
    #[test]
    fn summaries_replace_all_but_last_raw_result() {
        let messages = vec![
            msg(DataType::ToolRequest, "req1"),
            msg(DataType::ToolResult, "raw result 1"),
            msg(DataType::ToolResultSummary, "sum1"),
            msg(DataType::ToolRequest, "req2"),
            msg(DataType::ToolResult, "raw result 2"),
        ];
        let history = build_recent_history(&messages);
        assert_eq!(
            history,
            "req1\n\nSUMMARY CREATED: sum1\n\nreq2\n\nraw result 2"
        );
    }

    /// **Scenario**: a summary-only tail keeps the most recent result raw.
    #[test]
    fn last_result_stays_raw_even_with_following_summary() {
        let messages = vec![
            msg(DataType::ToolResult, "raw"),
            msg(DataType::ToolResultSummary, "sum"),
        ];
        // The raw result is not last (the summary is), so it is summarized;
        // the trailing summary alone is skipped.
        let history = build_recent_history(&messages);
        assert_eq!(history, "SUMMARY CREATED: sum");
    }

    /// **Scenario**: only result-tagged agent/planner messages survive, each
    /// capped; raw tool traffic never reaches the prompt even when tagged.
    #[test]
    fn result_history_keeps_tagged_results_and_strips_tool_traffic() {
        let mut tagged = msg(DataType::AgentResult, &"x".repeat(50));
        tagged.sub_data_type.push("result".into());
        tagged.sender = Some("planner".into());
        let mut tagged_tool_dump = msg(DataType::ToolResult, "giant tool dump");
        tagged_tool_dump.sub_data_type.push("result".into());
        let untagged = msg(DataType::AgentResponse, "chatter");

        let history = build_result_history(&[tagged, tagged_tool_dump, untagged], 10);
        assert_eq!(
            history,
            "=== PLANNER FINAL RESULT ===\nxxxxxxxxxx...[truncated]"
        );
        assert!(!history.contains("giant tool dump"));
        assert!(!history.contains("chatter"));
    }

    /// **Scenario**: with no result-tagged messages, the last 12 agent
    /// responses stand in, each hard-capped, with tool traffic excluded.
    #[test]
    fn result_history_falls_back_to_agent_tail() {
        let mut messages: Vec<Message> = (0..15)
            .map(|i| {
                let mut m = msg(DataType::AgentResponse, &format!("turn {i}"));
                m.sender = Some("planner".into());
                m
            })
            .collect();
        messages.push(msg(DataType::ToolResult, "tool dump"));
        let mut long = msg(DataType::AgentMsg, &"y".repeat(FALLBACK_CHAR_CAP + 5));
        long.sender = Some("critic".into());
        messages.push(long);

        let history = build_result_history(&messages, 10);
        // 15 responses + 1 agent_msg, tail of 12: turns 0-3 fall off.
        assert!(!history.contains("[planner] turn 3"));
        assert!(history.contains("[planner] turn 4"));
        assert!(history.contains("[planner] turn 14"));
        assert!(!history.contains("tool dump"));
        assert!(history.contains("[critic] "));
        assert!(history.ends_with("...[truncated]"));
    }

    #[test]
    fn field_names_are_title_cased() {
        assert_eq!(display_field_name("key_facts"), "Key Facts");
        assert_eq!(display_field_name("summary"), "Summary");
    }
}
