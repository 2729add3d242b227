//! Agent runtime: the template method for one LLM-driven agent turn.
//!
//! A turn always runs the same phases: enter (busy flag, state resets, input
//! unpacking), store the incoming message, construct the prompt from the
//! agent's configured context items, invoke the LLM against the agent's
//! closed structured-output schema, post-process the result into scoped
//! state, emit an `agent_response` message, and drive flow control from the
//! result's `action` field. Behavior variants (tool arguments, delegator,
//! final answer, summarizer) reuse these phases and override the ones they
//! change.

pub mod context;
mod delegator;
mod final_answer;
mod summarizer;
mod tool_arguments;

pub use delegator::{Delegator, FlowConfig};
pub use final_answer::FinalAnswer;
pub use summarizer::BlackboardSummarizer;
pub use tool_arguments::ToolArguments;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RuntimeError;
use crate::llm::{check_for_quota_error, LlmMessage};
use crate::message::{AgentInput, DataType, Message};
use crate::node::{ActionNode, BusyGuard, NodeContext};
use crate::registry::AgentConfig;
use crate::tools::ToolResult;
use std::sync::Arc;

/// Canonical name of the shared argument-generation agent.
pub const TOOL_ARGUMENTS_NODE: &str = "shared::tool_arguments";

/// A standard LLM agent driven entirely by its config.
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ActionNode for Agent {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let _busy = BusyGuard::acquire(Arc::clone(&ctx.blackboard), &self.config.name);
        enter_turn(ctx, &self.config, message);
        store_incoming_message(ctx, message);
        ctx.blackboard
            .update_state_value("last_agent", Value::String(self.config.name.clone()));

        let messages = construct_prompt(ctx, &self.config, Some(message)).await?;
        let result = run_llm_with_schema(
            ctx,
            &self.config,
            &messages,
            self.config.structured_output.as_ref(),
        )
        .await?;

        let result_obj = expect_object(&self.config.name, result)?;
        apply_result_to_state(ctx, &self.config, &result_obj);
        create_response_message(ctx, &self.config.name, &result_obj);
        handle_flow_control(ctx, &self.config.name, &result_obj)?;

        Ok(Some(ToolResult::llm(
            format!("{} acted.", self.config.name),
            Some(Value::Object(result_obj)),
        )))
    }
}

/// Phase 1: reset per-turn routing state, unpack the triggering input into
/// scope state, and bump the agent's action counter.
pub(crate) fn enter_turn(ctx: &NodeContext, config: &AgentConfig, message: &Message) {
    let bb = &ctx.blackboard;
    bb.update_state_value("next_agent", Value::Null);
    bb.update_state_value("tool_call", Value::Null);
    bb.update_state_value("tool_arguments", Value::Null);

    match &message.agent_input {
        Some(AgentInput::Map(map)) => {
            for (key, value) in map {
                bb.update_state_value(key, value.clone());
            }
        }
        Some(AgentInput::Text(text)) => {
            bb.update_state_value("agent_input", Value::String(text.clone()));
        }
        None => {
            bb.update_state_value("agent_input", Value::Null);
        }
    }

    let counter_key = format!("{}_action_count", config.name);
    let count = bb
        .get_state_value(&counter_key)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    bb.update_state_value(&counter_key, Value::from(count + 1));
}

pub(crate) fn store_incoming_message(ctx: &NodeContext, message: &Message) {
    if !message.content.trim().is_empty() {
        ctx.blackboard.add_msg(message.clone());
    }
}

/// Phase 3: render system and user prompts from configured context items.
pub(crate) async fn construct_prompt(
    ctx: &NodeContext,
    config: &AgentConfig,
    message: Option<&Message>,
) -> Result<Vec<LlmMessage>, RuntimeError> {
    let system_ctx =
        context::build_context(ctx, config, &config.system_context_items, message).await?;
    let system = crate::prompt::render_normalized(
        &config.name,
        &config.prompts.system,
        &Value::Object(system_ctx),
    )?;

    let user_ctx = context::build_context(ctx, config, &config.user_context_items, message).await?;
    let user = crate::prompt::render_normalized(
        &config.name,
        &config.prompts.user,
        &Value::Object(user_ctx),
    )?;

    Ok(vec![LlmMessage::system(system), LlmMessage::user(user)])
}

/// Phase 4: one structured LLM call plus quota screening of both the
/// response and any error text.
pub(crate) async fn run_llm_with_schema(
    ctx: &NodeContext,
    config: &AgentConfig,
    messages: &[LlmMessage],
    schema: Option<&Value>,
) -> Result<Value, RuntimeError> {
    match ctx
        .llm
        .structured_output(messages, schema, &config.llm_params)
        .await
    {
        Ok(result) => {
            check_for_quota_error(&config.name, &result.to_string())?;
            Ok(result)
        }
        Err(e) => {
            check_for_quota_error(&config.name, &e.to_string())?;
            tracing::error!(agent = %config.name, error = %e, "LLM call failed");
            ctx.blackboard
                .update_state_value("error_message", Value::String(e.to_string()));
            Err(e)
        }
    }
}

/// The LLM must return an object; anything else aborts the turn.
pub(crate) fn expect_object(
    agent: &str,
    result: Value,
) -> Result<Map<String, Value>, RuntimeError> {
    match result {
        Value::Object(map) => Ok(map),
        other => Err(RuntimeError::MalformedLlmOutput {
            agent: agent.to_string(),
            got: match other {
                Value::String(s) => format!("string {s:?}"),
                other => other.to_string(),
            },
        }),
    }
}

/// Phase 5: write result fields into state. `append_fields` append,
/// everything else overwrites; `global_output_keys` target global state.
pub(crate) fn apply_result_to_state(
    ctx: &NodeContext,
    config: &AgentConfig,
    result: &Map<String, Value>,
) {
    let bb = &ctx.blackboard;
    for (key, value) in result {
        let is_global = config.global_output_keys.iter().any(|k| k == key);
        let is_append = config.append_fields.iter().any(|k| k == key);
        match (is_append, is_global) {
            (true, true) => bb.append_global_state_value(key, value.clone()),
            (true, false) => bb.append_state_value(key, value.clone()),
            (false, true) => bb.update_global_state_value(key, value.clone()),
            (false, false) => bb.update_state_value(key, value.clone()),
        }
    }
}

/// Phase 6: record the structured response in the message log. Exit-flavored
/// actions are tagged `result` for history trimming.
pub(crate) fn create_response_message(
    ctx: &NodeContext,
    agent: &str,
    result: &Map<String, Value>,
) {
    let action = result
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let mut msg = Message::new()
        .with_data_type(DataType::AgentResponse)
        .with_sender(agent)
        .with_receiver("blackboard")
        .with_content(format!(
            "{agent} acted. Result: {}",
            Value::Object(result.clone())
        ));
    if action.contains("exit") {
        msg = msg.with_sub_data_type("result");
    }
    ctx.blackboard.add_msg(msg);
}

/// Phase 7: route on the result's `action` field.
pub(crate) fn handle_flow_control(
    ctx: &NodeContext,
    agent: &str,
    result: &Map<String, Value>,
) -> Result<(), RuntimeError> {
    let bb = &ctx.blackboard;
    let action = result
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    bb.update_state_value(
        "selected_tool",
        if action.is_empty() {
            Value::Null
        } else {
            Value::String(action.clone())
        },
    );

    if action == "error" {
        return Err(RuntimeError::ReservedErrorAction(agent.to_string()));
    }
    if action.is_empty() {
        return Ok(());
    }

    match action.as_str() {
        "flow_exit_node" => {
            let exit_signal = format!("{agent}_flow_exit_node");
            tracing::info!(agent, exit_signal = %exit_signal, "flow exit");
            bb.update_state_value("last_agent", Value::String(exit_signal));
            bb.update_state_value("next_agent", Value::Null);
            // ToolResultHandler retrieves this before popping the scope.
            let stored = result
                .get("result")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::Object(result.clone()));
            bb.update_state_value("result", stored);
        }
        "done" => {
            bb.update_state_value("last_agent", Value::String(agent.to_string()));
            bb.update_state_value("next_agent", Value::Null);
            if let Some(value) = result.get("result").filter(|v| !v.is_null()) {
                bb.update_state_value("result", value.clone());
            }
        }
        _ => {
            bb.update_state_value(
                "original_calling_agent",
                Value::String(agent.to_string()),
            );
            bb.update_state_value(
                "next_agent",
                Value::String(TOOL_ARGUMENTS_NODE.to_string()),
            );
        }
    }
    Ok(())
}
