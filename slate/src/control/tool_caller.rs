//! ToolCaller: executes the staged pending call.
//!
//! Resolution order over the shared `action` namespace: tool → agent →
//! control node. Control nodes are routed to, not executed here. Agent calls
//! push a fresh scope and run the callee synchronously; tool calls (local or
//! MCP) execute in the current scope. Both paths hand their result straight
//! to the result-handling functions rather than going back through the
//! dispatcher.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::blackboard::pipeline_state::{self, PendingTool};
use crate::error::RuntimeError;
use crate::events::{progress_fact, tool_call_fact};
use crate::message::{AgentInput, DataType, Message};
use crate::node::{ActionNode, NodeContext};
use crate::registry::{NodeKind, ToolEntry};
use crate::schema::strip_null_arguments;
use crate::tools::{ToolInvocation, ToolResult};

pub struct ToolCaller;

pub const TOOL_CALLER: &str = "tool_caller";

impl ToolCaller {
    pub fn new() -> Self {
        Self
    }

    fn set_error(ctx: &NodeContext, message: String) {
        tracing::error!(node = TOOL_CALLER, error = %message, "dispatch failed");
        let bb = &ctx.blackboard;
        bb.update_state_value("last_agent", Value::String(TOOL_CALLER.into()));
        bb.update_state_value("error_message", Value::String(message));
        bb.update_state_value("error", Value::Bool(true));
    }

    /// Unwraps the `{tool_name, arguments}` envelope when present.
    fn inner_arguments(arguments: &Map<String, Value>) -> Map<String, Value> {
        match arguments.get("arguments").and_then(Value::as_object) {
            Some(inner) => inner.clone(),
            None => arguments.clone(),
        }
    }

    async fn execute_agent_call(
        &self,
        ctx: &NodeContext,
        calling_agent: &str,
        called_agent: &str,
        arguments: Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        let bb = &ctx.blackboard;
        tracing::info!(caller = calling_agent, callee = called_agent, "agent call");

        // The request is logged in the CALLER's scope, before the push.
        bb.add_msg(
            Message::new()
                .with_data_type(DataType::ToolRequest)
                .with_sender(calling_agent)
                .with_content(format!(
                    "Calling agent '{called_agent}' with arguments: {}.",
                    Value::Object(arguments.clone())
                )),
        );

        let scope_id = format!("scope_{}", uuid::Uuid::new_v4());
        bb.push_call_context(calling_agent, called_agent, &scope_id)?;

        let Some(instance) = ctx.instance(called_agent) else {
            // Undo the push so the manager is not stuck with a leaked scope.
            let _ = bb.pop_call_context();
            Self::set_error(
                ctx,
                format!(
                    "Agent '{called_agent}' is configured but not instantiated in this manager \
                     runtime. Add it to the manager's agents list, or expose it via a tool \
                     wrapper if it must be callable cross-manager."
                ),
            );
            return Ok(());
        };

        let input = Message::new().with_agent_input(AgentInput::Map(arguments));
        let outcome = instance.action_handler(ctx, &input).await;
        let callee_result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let _ = bb.pop_call_context();
                return Err(e);
            }
        };

        // Stage the result in the callee scope for the handler to find.
        let payload = callee_result
            .map(|r| match r.data {
                Some(data) => data,
                None => Value::String(r.content),
            })
            .unwrap_or(Value::Null);
        bb.update_state_value(&format!("{called_agent}_result"), payload);

        super::process_agent_result(ctx);
        Ok(())
    }

    async fn execute_local_tool(
        &self,
        ctx: &NodeContext,
        entry: &ToolEntry,
        calling_agent: &str,
        arguments: Map<String, Value>,
    ) {
        let ToolEntry::Local { name, factory, .. } = entry else {
            unreachable!("caller checked the variant");
        };
        let bb = &ctx.blackboard;
        bb.add_msg(
            Message::new()
                .with_data_type(DataType::ToolRequest)
                .with_sender(calling_agent)
                .with_content(format!(
                    "Calling tool {name} with arguments {}",
                    Value::Object(arguments.clone())
                )),
        );

        let mut invocation = ToolInvocation::new(Self::inner_arguments(&arguments));
        invocation.allowed_read_files = bb.get_state_value("allowed_read_files");
        invocation.allowed_write_files = bb.get_state_value("allowed_write_files");

        let tool = factory();
        let result = tool.execute(invocation).await;
        bb.update_state_value("last_agent", Value::String(TOOL_CALLER.into()));
        super::process_tool_result(ctx, &result);
    }

    async fn execute_mcp_tool(
        &self,
        ctx: &NodeContext,
        entry: &ToolEntry,
        calling_agent: &str,
        arguments: Map<String, Value>,
    ) {
        let ToolEntry::Mcp {
            name,
            server_id,
            mcp_tool_name,
            ..
        } = entry
        else {
            unreachable!("caller checked the variant");
        };
        let bb = &ctx.blackboard;
        bb.add_msg(
            Message::new()
                .with_data_type(DataType::ToolRequest)
                .with_sender(calling_agent)
                .with_content(format!(
                    "Calling tool {name} with arguments {}",
                    Value::Object(arguments.clone())
                )),
        );

        let result = match ctx.mcp_servers.get(server_id) {
            None => ToolResult::error(
                format!("MCP server entry not loaded: {server_id}"),
                Some(serde_json::json!({ "tool_name": name, "server_id": server_id })),
            ),
            Some(server) => {
                // Nullable-but-required synthesis means absent fields arrive
                // as nulls; the server only gets what was actually provided.
                let args = strip_null_arguments(&Self::inner_arguments(&arguments));
                let server = server.clone();
                let tool_name = mcp_tool_name.clone();
                let call = tokio::task::spawn_blocking(move || {
                    crate::mcp::call_tool(&server, &tool_name, &args)
                })
                .await;

                match call {
                    Ok(Ok(response)) => {
                        let content =
                            crate::mcp::format_call_response(&response, &ctx.paths.uploads_dir);
                        let sanitized = crate::mcp::sanitize_call_response(
                            &response,
                            &content.attachments,
                            crate::mcp::content_max_chars(),
                        );
                        let data = serde_json::json!({
                            "backend": "mcp",
                            "server_id": server_id,
                            "mcp_tool_name": mcp_tool_name,
                            "arguments_sent": Self::inner_arguments(&arguments),
                            "call_response": sanitized,
                            "attachments": content.attachments,
                        });
                        if content.is_error {
                            ToolResult::error(content.text, Some(data))
                        } else {
                            ToolResult::ok(content.text, Some(data))
                        }
                    }
                    Ok(Err(e)) => ToolResult::error(
                        format!("MCP call failed ({server_id}/{mcp_tool_name}): {e}"),
                        Some(serde_json::json!({
                            "backend": "mcp",
                            "server_id": server_id,
                            "mcp_tool_name": mcp_tool_name,
                        })),
                    ),
                    Err(join_err) => ToolResult::error(
                        format!("MCP call task failed ({server_id}/{mcp_tool_name}): {join_err}"),
                        None,
                    ),
                }
            }
        };

        bb.update_state_value("last_agent", Value::String(TOOL_CALLER.into()));
        super::process_tool_result(ctx, &result);
    }
}

impl Default for ToolCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionNode for ToolCaller {
    fn name(&self) -> &str {
        TOOL_CALLER
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let bb = &ctx.blackboard;
        bb.update_state_value("next_agent", Value::Null);

        let Some(PendingTool {
            name: selected,
            arguments,
            calling_agent,
            ..
        }) = pipeline_state::pending_tool(bb)
        else {
            tracing::error!(node = TOOL_CALLER, "no pending tool staged");
            bb.update_state_value("last_agent", Value::String(TOOL_CALLER.into()));
            return Ok(None);
        };
        let arguments = arguments.unwrap_or_default();

        tracing::info!(node = TOOL_CALLER, target = %selected, "executing");
        ctx.hub.publish(progress_fact(
            TOOL_CALLER,
            tool_call_fact(Some(&calling_agent), &ctx.manager_name, &selected),
        ));

        if let Some(entry) = ctx.tools.get(&selected) {
            let entry = entry.clone();
            if entry.is_mcp() {
                self.execute_mcp_tool(ctx, &entry, &calling_agent, arguments)
                    .await;
            } else {
                self.execute_local_tool(ctx, &entry, &calling_agent, arguments)
                    .await;
            }
            return Ok(None);
        }

        if let Some(config) = ctx.agents.get(&selected) {
            if config.kind == NodeKind::ControlNode {
                tracing::info!(node = TOOL_CALLER, target = %selected, "transitioning to control node");
                bb.update_state_value("next_agent", Value::String(selected));
                bb.update_state_value("last_agent", Value::String(TOOL_CALLER.into()));
                return Ok(None);
            }
            self.execute_agent_call(ctx, &calling_agent, &selected, arguments)
                .await?;
            return Ok(None);
        }

        Self::set_error(
            ctx,
            format!("'{selected}' not found among tools, agents, or control nodes"),
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::pipeline_state::PendingKind;
    use crate::blackboard::ROOT_SCOPE;
    use crate::events::PROGRESS_FACT_TOPIC;
    use crate::testutil::TestContextBuilder;
    use serde_json::json;

    fn stage(ctx: &NodeContext, name: &str, args: Value, kind: PendingKind) {
        pipeline_state::set_pending_tool(
            &ctx.blackboard,
            &PendingTool {
                name: name.into(),
                arguments: args.as_object().cloned(),
                action_input: None,
                calling_agent: "planner".into(),
                kind,
            },
        );
    }

    /// **Scenario**: a local tool executes in the current scope, the
    /// result lands with an artifact reference, and control returns to the
    /// caller with `pending_tool` cleared.
    #[tokio::test]
    async fn local_tool_call_roundtrip() {
        let ctx = TestContextBuilder::new()
            .with_agent("planner", "")
            .with_stub_tool("search_notes")
            .build();
        stage(
            &ctx,
            "search_notes",
            json!({"tool_name": "search_notes", "arguments": {"query": "x"}}),
            PendingKind::Tool,
        );

        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();

        let bb = &ctx.blackboard;
        assert_eq!(bb.get_current_scope_id(), ROOT_SCOPE);
        assert_eq!(bb.get_string("next_agent").as_deref(), Some("planner"));
        assert!(pipeline_state::pending_tool(bb).is_none());

        let log = bb.all_messages();
        assert_eq!(log[0].data_type, Some(DataType::ToolRequest));
        let result_msg = log.last().unwrap();
        assert_eq!(result_msg.data_type, Some(DataType::ToolResult));
        let metadata = result_msg.metadata.as_ref().unwrap();
        let artifact_path = metadata["path"].as_str().unwrap();
        assert!(std::path::Path::new(artifact_path).exists());

        // Invoke + return progress facts.
        assert_eq!(ctx.hub.published(PROGRESS_FACT_TOPIC).len(), 2);
    }

    /// **Scenario**: an agent call pushes a scope, runs the callee, pops,
    /// and records an agent_result in the parent scope.
    #[tokio::test]
    async fn agent_call_pushes_and_pops_scope() {
        let ctx = TestContextBuilder::new()
            .with_agent("planner", "")
            .with_agent("answerer", "")
            .with_llm_responses(vec![json!({"action": "done", "result": {"answer": "hello"}})])
            .build();
        stage(&ctx, "answerer", json!({"q": "hi"}), PendingKind::Agent);

        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();

        let bb = &ctx.blackboard;
        assert_eq!(bb.get_current_scope_id(), ROOT_SCOPE);
        assert_eq!(bb.call_stack_depth(), 0);
        assert_eq!(bb.get_string("next_agent").as_deref(), Some("planner"));

        let result_msg = bb
            .all_messages()
            .into_iter()
            .find(|m| m.data_type == Some(DataType::AgentResult))
            .expect("agent_result recorded");
        assert_eq!(result_msg.scope_id.as_deref(), Some(ROOT_SCOPE));
        assert_eq!(result_msg.sender.as_deref(), Some("answerer"));
        assert_eq!(result_msg.data, Some(json!({"answer": "hello"})));
    }

    /// **Scenario**: control-node targets are routed to, never executed here.
    #[tokio::test]
    async fn control_node_target_is_routed() {
        let ctx = TestContextBuilder::new().build();
        stage(&ctx, "manager_exit_node", json!({}), PendingKind::ControlNode);

        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        assert_eq!(
            ctx.blackboard.get_string("next_agent").as_deref(),
            Some("manager_exit_node")
        );
        assert!(!ctx.blackboard.get_bool("error"));
    }

    /// **Scenario**: unknown targets set error state instead of crashing
    /// the manager.
    #[tokio::test]
    async fn unknown_target_sets_error() {
        let ctx = TestContextBuilder::new().build();
        stage(&ctx, "ghost_tool", json!({}), PendingKind::Tool);

        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        let bb = &ctx.blackboard;
        assert!(bb.get_bool("error"));
        assert!(bb.get_string("error_message").unwrap().contains("ghost_tool"));
    }

    /// **Scenario**: an agent that is configured but not instantiated in
    /// this manager sets error state and leaks no scope.
    #[tokio::test]
    async fn uninstantiated_agent_sets_error_without_leaking_scope() {
        let ctx = TestContextBuilder::new()
            .with_configured_but_uninstantiated_agent("outsider")
            .build();
        stage(&ctx, "outsider", json!({}), PendingKind::Agent);

        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        let bb = &ctx.blackboard;
        assert!(bb.get_bool("error"));
        assert_eq!(bb.call_stack_depth(), 0);
        assert_eq!(bb.get_current_scope_id(), ROOT_SCOPE);
    }

    /// **Scenario**: missing pending tool is survivable.
    #[tokio::test]
    async fn missing_pending_tool_is_logged_not_fatal() {
        let ctx = TestContextBuilder::new().build();
        ToolCaller::new()
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        assert_eq!(
            ctx.blackboard.get_string("last_agent").as_deref(),
            Some(TOOL_CALLER)
        );
        assert!(!ctx.blackboard.get_bool("error"));
    }
}
