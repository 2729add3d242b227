//! ToolResultHandler: posts tool and agent results back to their callers.
//!
//! Tool results stay in the scope they ran in: the full payload is persisted
//! as an artifact, a compact summary message is appended, pipeline state is
//! updated, the after-tool pipeline gets a chance to divert control, and
//! otherwise the calling agent gets control back. Agent results pop the call
//! context and post an `agent_result` into the parent scope.

use async_trait::async_trait;
use serde_json::Value;

use crate::blackboard::pipeline_state::{self, PendingKind, PendingTool, ToolResultMeta};
use crate::error::RuntimeError;
use crate::events::{progress_fact, tool_result_fact};
use crate::message::{DataType, Message};
use crate::node::{ActionNode, NodeContext};
use crate::pipeline::{self, FiredAction, PipelineRule};
use crate::tools::ToolResult;

pub const TOOL_RESULT_HANDLER: &str = "tool_result_handler";

pub struct ToolResultHandler;

impl ToolResultHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ToolResultHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Processes a finished tool call. Called directly by ToolCaller; also
/// reachable via the node when a manager routes results through the flow map.
pub fn process_tool_result(ctx: &NodeContext, tool_result: &ToolResult) {
    let bb = &ctx.blackboard;
    let pending = pipeline_state::pending_tool(bb);
    let calling_agent = pending.as_ref().map(|p| p.calling_agent.clone());
    let selected_tool = pending.as_ref().map(|p| p.name.clone());

    tracing::debug!(
        result_type = tool_result.result_type.as_str(),
        tool = ?selected_tool,
        content_preview = %tool_result.content.chars().take(300).collect::<String>(),
        "processing tool result"
    );

    // Compact form for the message log; the full payload goes to disk.
    let summary = ctx.summarizer.summarize(tool_result);
    let content_str =
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| summary.to_string());

    let scope_id = bb.get_current_scope_id();
    let artifact = match ctx.artifacts.persist(
        tool_result,
        calling_agent.as_deref(),
        Some(&scope_id),
    ) {
        Ok(reference) => Some(reference),
        Err(e) => {
            tracing::warn!(error = %e, "failed to persist tool result artifact");
            None
        }
    };

    let attachments: Vec<Value> = tool_result
        .data
        .as_ref()
        .and_then(|d| d.get("attachments"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter(|a| a.is_object()).cloned().collect())
        .unwrap_or_default();

    let mut metadata = serde_json::Map::new();
    if !attachments.is_empty() {
        metadata.insert("attachments".into(), Value::Array(attachments));
    }
    if let Some(reference) = &artifact {
        metadata.insert(
            "tool_result_id".into(),
            Value::String(reference.tool_result_id.clone()),
        );
        metadata.insert("path".into(), Value::String(reference.path.clone()));
    }

    let mut msg = Message::new()
        .with_data_type(DataType::ToolResult)
        .with_sub_data_type(tool_result.result_type.as_str())
        .with_sender("tool")
        .with_content(content_str)
        .with_data(summary.clone());
    if let Some(agent) = &calling_agent {
        msg = msg.with_receiver(agent);
    }
    if !metadata.is_empty() {
        msg = msg.with_metadata(metadata);
    }
    bb.add_msg(msg);

    let preview: String = summary
        .get("tool_result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .take(400)
        .collect();
    ctx.hub.publish(progress_fact(
        TOOL_RESULT_HANDLER,
        tool_result_fact(
            calling_agent.as_deref(),
            selected_tool.as_deref(),
            tool_result.result_type.as_str(),
            artifact.as_ref().map(|a| a.tool_result_id.as_str()),
            &preview,
        ),
    ));

    pipeline_state::set_last_tool_result_ref(
        bb,
        artifact.as_ref(),
        &ToolResultMeta {
            tool_name: selected_tool.clone(),
            result_type: Some(tool_result.result_type.as_str().to_string()),
            calling_agent: calling_agent.clone(),
        },
    );
    pipeline_state::clear_pending_tool(bb);
    bb.update_state_value("last_agent", Value::String(TOOL_RESULT_HANDLER.into()));

    // After-tool pipeline: the first matching rule diverts control.
    let rules: Vec<PipelineRule> = bb
        .get_state_value("tool_pipeline")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if let Some(outcome) = pipeline::evaluate(
        &rules,
        selected_tool.as_deref(),
        calling_agent.as_deref(),
        &tool_result.content,
        bb,
        &ctx.handlers,
    ) {
        if let Some(guard) = &outcome.guard_key {
            pipeline_state::set_flag(bb, guard, Value::Bool(true));
        }
        for (key, value) in &outcome.set_flags {
            pipeline_state::set_flag(bb, key, value.clone());
        }
        bb.update_state_value("tool_result", Value::Null);
        match outcome.action {
            FiredAction::ControlNode { node } => {
                tracing::info!(node = %node, "after-tool pipeline diverting to control node");
                bb.update_state_value("next_agent", Value::String(node));
            }
            FiredAction::ToolCall { tool, arguments } => {
                tracing::info!(tool = %tool, "after-tool pipeline staging follow-up call");
                pipeline_state::set_pending_tool(
                    bb,
                    &PendingTool {
                        name: tool,
                        arguments: Some(arguments),
                        action_input: None,
                        calling_agent: calling_agent.unwrap_or_default(),
                        kind: PendingKind::Tool,
                    },
                );
                bb.update_state_value(
                    "next_agent",
                    Value::String(super::tool_caller::TOOL_CALLER.into()),
                );
            }
        }
        return;
    }

    // Default: return control to the calling agent. Tool calls never pop the
    // call context.
    bb.update_state_value(
        "next_agent",
        calling_agent.map(Value::String).unwrap_or(Value::Null),
    );
    bb.update_state_value("tool_result", Value::Null);
}

/// Processes a finished sub-agent call: retrieves the callee's result,
/// captures its routing choice, pops the scope, and posts the result into
/// the parent scope.
pub fn process_agent_result(ctx: &NodeContext) {
    let bb = &ctx.blackboard;
    let Some(context) = bb.get_current_call_context() else {
        tracing::warn!(node = TOOL_RESULT_HANDLER, "no call context for agent result");
        bb.update_state_value("next_agent", Value::Null);
        return;
    };

    let agent_result = bb.get_state_value(&format!("{}_result", context.called_agent));
    let scope_result = bb.get_state_value("result").filter(|v| !v.is_null());
    let agent_result = agent_result.filter(|v| !v.is_null());

    if agent_result.is_none() && scope_result.is_none() {
        // Reached via a flow map after a tool call, with nothing to return.
        // Popping here would corrupt the stack; route back without mutating
        // scopes.
        let fallback = [&context.calling_agent, &context.called_agent]
            .into_iter()
            .find(|name| ctx.agents.get(name.as_str()).is_some())
            .cloned();
        tracing::warn!(
            node = TOOL_RESULT_HANDLER,
            caller = %context.calling_agent,
            callee = %context.called_agent,
            next = ?fallback,
            "agent result missing; skipping scope pop and routing back"
        );
        bb.update_state_value("last_agent", Value::String(TOOL_RESULT_HANDLER.into()));
        bb.update_state_value(
            "next_agent",
            fallback.map(Value::String).unwrap_or(Value::Null),
        );
        return;
    }

    // Scope-level `result` wins: any agent in the sub-flow may have set it.
    let final_result = scope_result.or(agent_result).unwrap_or(Value::Null);

    // The callee's routing choice must be read before the pop.
    let callee_next_agent = bb.get_string("next_agent");

    let popped = match bb.pop_call_context() {
        Ok(popped) => popped,
        Err(e) => {
            tracing::error!(error = %e, "call stack underflow while posting agent result");
            bb.update_state_value("next_agent", Value::Null);
            return;
        }
    };

    let content = match &final_result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    bb.add_msg(
        Message::new()
            .with_data_type(DataType::AgentResult)
            .with_sender(&popped.called_agent)
            .with_receiver(&popped.calling_agent)
            .with_content(content)
            .with_data(final_result),
    );

    bb.update_state_value("last_agent", Value::String(TOOL_RESULT_HANDLER.into()));

    let next_agent = callee_next_agent
        .filter(|candidate| {
            let known = ctx.agents.get(candidate).is_some();
            if !known {
                tracing::warn!(
                    requested = %candidate,
                    caller = %popped.calling_agent,
                    "callee requested unknown next agent; falling back to caller"
                );
            }
            known
        })
        .unwrap_or_else(|| popped.calling_agent.clone());

    tracing::debug!(next_agent = %next_agent, "returning control to parent scope");
    bb.update_state_value("next_agent", Value::String(next_agent));
}

#[async_trait]
impl ActionNode for ToolResultHandler {
    fn name(&self) -> &str {
        TOOL_RESULT_HANDLER
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        // Defensive: a manager may route here via its flow map right after a
        // tool call; when a staged tool_result is present, handle it.
        if let Some(staged) = ctx
            .blackboard
            .get_state_value("tool_result")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<ToolResult>(v).ok())
        {
            process_tool_result(ctx, &staged);
            return Ok(None);
        }

        process_agent_result(ctx);
        Ok(None)
    }
}
