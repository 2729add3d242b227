//! Argument generation for the selected tool, agent, or control node.
//!
//! Reads `selected_tool` from scope state and resolves it in order: tool →
//! agent → control node. Control nodes and agents without an input schema
//! need no arguments — the pending call is staged immediately. Everything
//! else gets one LLM turn against the target's closed argument schema, plus
//! deterministic normalizations for argument shapes models reliably get
//! wrong (milliseconds for second-based waits, bare image filenames for
//! vision inputs).

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::blackboard::pipeline_state::{self, PendingKind, PendingTool};
use crate::error::RuntimeError;
use crate::message::{DataType, Message};
use crate::node::{ActionNode, BusyGuard, NodeContext};
use crate::registry::{AgentConfig, NodeKind};
use crate::tools::ToolResult;

pub struct ToolArguments {
    config: Arc<AgentConfig>,
}

enum Target {
    Tool { schema: Value },
    Agent { schema: Value },
    NoArguments { kind: PendingKind },
}

impl ToolArguments {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    fn resolve_target(&self, ctx: &NodeContext, selected: &str) -> Option<Target> {
        if let Some(entry) = ctx.tools.get(selected) {
            return Some(Target::Tool {
                schema: entry.arguments_schema().clone(),
            });
        }
        if let Some(config) = ctx.agents.get(selected) {
            if config.kind == NodeKind::ControlNode {
                return Some(Target::NoArguments {
                    kind: PendingKind::ControlNode,
                });
            }
            return match &config.input_schema {
                Some(schema) => Some(Target::Agent {
                    schema: schema.clone(),
                }),
                None => Some(Target::NoArguments {
                    kind: PendingKind::Agent,
                }),
            };
        }
        None
    }

    fn stage_pending(
        &self,
        ctx: &NodeContext,
        selected: &str,
        arguments: Map<String, Value>,
        kind: PendingKind,
    ) {
        let calling_agent = ctx
            .blackboard
            .get_string("original_calling_agent")
            .unwrap_or_default();
        ctx.blackboard
            .update_state_value("tool_arguments", Value::Object(arguments.clone()));
        pipeline_state::set_pending_tool(
            &ctx.blackboard,
            &PendingTool {
                name: selected.to_string(),
                arguments: Some(arguments),
                action_input: None,
                calling_agent,
                kind,
            },
        );
    }

    /// Builds the user prompt with the target's description and argument
    /// prompt merged into the agent's own context.
    async fn construct_prompt(
        &self,
        ctx: &NodeContext,
        selected: &str,
        message: &Message,
    ) -> Result<Vec<crate::llm::LlmMessage>, RuntimeError> {
        let mut system_ctx = super::context::build_context(
            ctx,
            &self.config,
            &self.config.system_context_items,
            Some(message),
        )
        .await?;
        let mut user_ctx = super::context::build_context(
            ctx,
            &self.config,
            &self.config.user_context_items,
            Some(message),
        )
        .await?;

        let (description, args_prompt) = if ctx.tools.get(selected).is_some() {
            (
                ctx.tools.description(selected).unwrap_or_default(),
                ctx.tools
                    .args_prompt(selected, &Value::Object(user_ctx.clone()))
                    .unwrap_or_default(),
            )
        } else {
            let description = ctx.agents.rendered_description(selected).unwrap_or_default();
            let schema_text = ctx
                .agents
                .get(selected)
                .and_then(|c| c.input_schema.clone())
                .map(|s| serde_json::to_string_pretty(&s).unwrap_or_default())
                .unwrap_or_default();
            (
                description.clone(),
                format!("{description}\n\nProvide arguments matching this schema:\n{schema_text}"),
            )
        };
        for target in [&mut system_ctx, &mut user_ctx] {
            target.insert("tool_description".into(), Value::String(description.clone()));
            target.insert("tool_args".into(), Value::String(args_prompt.clone()));
        }

        let system = crate::prompt::render_normalized(
            &self.config.name,
            &self.config.prompts.system,
            &Value::Object(system_ctx),
        )?;
        let user = crate::prompt::render_normalized(
            &self.config.name,
            &self.config.prompts.user,
            &Value::Object(user_ctx),
        )?;
        Ok(vec![
            crate::llm::LlmMessage::system(system),
            crate::llm::LlmMessage::user(user),
        ])
    }

    fn normalize_arguments(
        &self,
        ctx: &NodeContext,
        selected: &str,
        target: &Target,
        arguments: &mut Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        // Second-based wait tools: models often answer in milliseconds. Only
        // rewrite when the value strongly looks like milliseconds.
        if selected.ends_with("browser_wait_for") {
            if let Some(time) = arguments
                .get("time")
                .and_then(Value::as_f64)
                .filter(|t| *t >= 1000.0 && t.fract() == 0.0 && (*t as i64) % 1000 == 0)
            {
                arguments.insert("time".into(), Value::from((time as i64) / 1000));
            }
        }

        // Vision-style agents need an absolute on-disk PNG. Planners usually
        // only see the bare filename in summaries, so resolve against the
        // uploads directory and fail loudly when the file is missing.
        if let Target::Agent { schema } = target {
            let wants_image = schema
                .get("properties")
                .and_then(|p| p.get("image"))
                .is_some();
            if wants_image {
                if let Some(raw) = arguments.get("image").and_then(Value::as_str) {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        return Err(RuntimeError::ExecutionFailed(format!(
                            "[{}] target '{selected}' requires an image path, got empty value",
                            self.config.name
                        )));
                    }
                    let mut path = std::path::PathBuf::from(raw);
                    if path.is_relative() {
                        let filename = path
                            .file_name()
                            .map(|f| f.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        path = ctx.paths.uploads_dir.join(filename);
                        arguments.insert(
                            "image".into(),
                            Value::String(path.to_string_lossy().into_owned()),
                        );
                    }
                    if !path.exists() {
                        return Err(RuntimeError::ExecutionFailed(format!(
                            "[{}] image path does not exist: {}",
                            self.config.name,
                            path.display()
                        )));
                    }
                    if path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| !e.eq_ignore_ascii_case("png"))
                        .unwrap_or(true)
                    {
                        return Err(RuntimeError::ExecutionFailed(format!(
                            "[{}] target '{selected}' requires a .png image, got: {}",
                            self.config.name,
                            path.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ActionNode for ToolArguments {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let _busy = BusyGuard::acquire(Arc::clone(&ctx.blackboard), &self.config.name);
        let bb = &ctx.blackboard;
        bb.update_state_value("next_agent", Value::Null);
        bb.update_state_value("last_agent", Value::String(self.config.name.clone()));

        let Some(selected) = bb.get_string("selected_tool") else {
            tracing::error!(agent = %self.config.name, "no tool or agent selected for argument generation");
            return Ok(None);
        };

        let Some(target) = self.resolve_target(ctx, &selected) else {
            tracing::error!(agent = %self.config.name, selected = %selected, "selected target is neither a tool nor a registered agent");
            return Ok(None);
        };

        if let Target::NoArguments { kind } = &target {
            tracing::info!(agent = %self.config.name, selected = %selected, "target needs no arguments");
            self.stage_pending(ctx, &selected, Map::new(), *kind);
            return Ok(None);
        }

        let messages = self.construct_prompt(ctx, &selected, message).await?;
        let schema = match &target {
            Target::Tool { schema } | Target::Agent { schema } => schema.clone(),
            Target::NoArguments { .. } => unreachable!("handled above"),
        };
        let result =
            super::run_llm_with_schema(ctx, &self.config, &messages, Some(&schema)).await?;
        let mut arguments = super::expect_object(&self.config.name, result)?;

        self.normalize_arguments(ctx, &selected, &target, &mut arguments)?;

        let kind = match target {
            Target::Tool { .. } => PendingKind::Tool,
            Target::Agent { .. } => PendingKind::Agent,
            Target::NoArguments { .. } => unreachable!(),
        };
        self.stage_pending(ctx, &selected, arguments.clone(), kind);

        bb.add_msg(
            Message::new()
                .with_data_type(DataType::AgentResponse)
                .with_sender(&self.config.name)
                .with_receiver("blackboard")
                .with_content(format!(
                    "{} acted. Result: {}",
                    self.config.name,
                    Value::Object(arguments.clone())
                )),
        );

        Ok(Some(ToolResult::llm(
            format!("{} acted.", self.config.name),
            Some(Value::Object(arguments)),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestContextBuilder;
    use serde_json::json;

    fn select(ctx: &NodeContext, tool: &str, caller: &str) {
        ctx.blackboard
            .update_state_value("selected_tool", Value::String(tool.into()));
        ctx.blackboard
            .update_state_value("original_calling_agent", Value::String(caller.into()));
    }

    fn node(ctx: &NodeContext) -> ToolArguments {
        ToolArguments::new(ctx.agents.get("shared::tool_arguments").unwrap())
    }

    /// **Scenario**: a tool target runs the LLM against the envelope schema
    /// and stages the pending call.
    #[tokio::test]
    async fn tool_target_generates_arguments() {
        let ctx = TestContextBuilder::new()
            .with_tool_arguments_agent()
            .with_agent("planner", "")
            .with_stub_tool("search_notes")
            .with_llm_responses(vec![json!({"tool_name": "search_notes", "arguments": {"query": "x"}})])
            .build();
        select(&ctx, "search_notes", "planner");

        node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();

        let pending = pipeline_state::pending_tool(&ctx.blackboard).unwrap();
        assert_eq!(pending.name, "search_notes");
        assert_eq!(pending.kind, PendingKind::Tool);
        assert_eq!(pending.calling_agent, "planner");
        let args = pending.arguments.unwrap();
        assert_eq!(args["arguments"]["query"], json!("x"));
    }

    /// **Scenario**: an agent without an input schema yields empty arguments
    /// and no LLM call.
    #[tokio::test]
    async fn schemaless_agent_stages_empty_arguments() {
        let ctx = TestContextBuilder::new()
            .with_tool_arguments_agent()
            .with_agent("helper", "")
            .with_llm_responses(vec![])
            .build();
        select(&ctx, "helper", "planner");

        node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();

        assert_eq!(
            ctx.blackboard.get_state_value("tool_arguments"),
            Some(json!({}))
        );
        let pending = pipeline_state::pending_tool(&ctx.blackboard).unwrap();
        assert_eq!(pending.kind, PendingKind::Agent);
        assert_eq!(pending.arguments, Some(Map::new()));
    }

    /// **Scenario**: a control-node target passes straight through.
    #[tokio::test]
    async fn control_node_target_needs_no_arguments() {
        let ctx = TestContextBuilder::new()
            .with_tool_arguments_agent()
            .with_llm_responses(vec![])
            .build();
        select(&ctx, "manager_exit_node", "planner");

        node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        let pending = pipeline_state::pending_tool(&ctx.blackboard).unwrap();
        assert_eq!(pending.kind, PendingKind::ControlNode);
    }

    /// **Scenario**: millisecond-looking wait times convert to seconds.
    #[tokio::test]
    async fn wait_tool_milliseconds_become_seconds() {
        let ctx = TestContextBuilder::new()
            .with_tool_arguments_agent()
            .with_stub_tool("browser_wait_for")
            .with_llm_responses(vec![json!({"time": 2000})])
            .build();
        select(&ctx, "browser_wait_for", "planner");

        node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        let pending = pipeline_state::pending_tool(&ctx.blackboard).unwrap();
        assert_eq!(pending.arguments.unwrap()["time"], json!(2));
    }

    /// **Scenario**: a bare image filename resolves into the uploads dir and
    /// a missing file is a hard error.
    #[tokio::test]
    async fn image_arguments_resolve_against_uploads() {
        let ctx = TestContextBuilder::new()
            .with_tool_arguments_agent()
            .with_vision_agent("vision_scout")
            .with_llm_responses(vec![
                json!({"image": "shot.png", "question": "what is this"}),
                json!({"image": "missing.png", "question": "?"}),
            ])
            .build();
        std::fs::create_dir_all(&ctx.paths.uploads_dir).unwrap();
        std::fs::write(ctx.paths.uploads_dir.join("shot.png"), b"png").unwrap();

        select(&ctx, "vision_scout", "planner");
        node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap();
        let pending = pipeline_state::pending_tool(&ctx.blackboard).unwrap();
        let image = pending.arguments.unwrap()["image"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(std::path::Path::new(&image).is_absolute());
        assert!(image.ends_with("shot.png"));

        select(&ctx, "vision_scout", "planner");
        let err = node(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
