//! Final-answer agent: a standard turn over a result-focused history.
//!
//! Planner flows end by composing an answer from what actually happened, not
//! from every intermediate exchange. This behavior swaps the default
//! `recent_history` for a view restricted to result-tagged messages, each
//! capped at the configured per-message character budget.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::message::Message;
use crate::node::{ActionNode, BusyGuard, NodeContext};
use crate::registry::AgentConfig;
use crate::tools::ToolResult;

pub struct FinalAnswer {
    config: Arc<AgentConfig>,
}

impl FinalAnswer {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    async fn construct_prompt(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Vec<crate::llm::LlmMessage>, RuntimeError> {
        let scope_id = ctx.blackboard.get_current_scope_id();
        let scope_messages = ctx.blackboard.get_messages_for_scope(&scope_id);
        let result_history =
            super::context::build_result_history(&scope_messages, self.config.history_char_cap);

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
        for target in [&mut system_ctx, &mut user_ctx] {
            if target.contains_key("recent_history") {
                target.insert(
                    "recent_history".into(),
                    Value::String(result_history.clone()),
                );
            }
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
}

#[async_trait]
impl ActionNode for FinalAnswer {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let _busy = BusyGuard::acquire(Arc::clone(&ctx.blackboard), &self.config.name);
        super::enter_turn(ctx, &self.config, message);
        super::store_incoming_message(ctx, message);
        ctx.blackboard
            .update_state_value("last_agent", Value::String(self.config.name.clone()));

        let messages = self.construct_prompt(ctx, message).await?;
        let result = super::run_llm_with_schema(
            ctx,
            &self.config,
            &messages,
            self.config.structured_output.as_ref(),
        )
        .await?;
        let result_obj = super::expect_object(&self.config.name, result)?;

        super::apply_result_to_state(ctx, &self.config, &result_obj);
        super::create_response_message(ctx, &self.config.name, &result_obj);
        super::handle_flow_control(ctx, &self.config.name, &result_obj)?;

        Ok(Some(ToolResult::llm(
            format!("{} acted.", self.config.name),
            Some(Value::Object(result_obj)),
        )))
    }
}
