//! Blackboard summarizer: compacts pre-plan history when it grows too large.
//!
//! Runs as a regular node in a manager flow but acts only when the
//! blackboard reports it is time to summarize. The summary result lands in
//! state (honoring `append_fields`) and the summarized messages are pruned
//! from the log.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::message::Message;
use crate::node::{ActionNode, BusyGuard, NodeContext};
use crate::registry::AgentConfig;
use crate::tools::ToolResult;

pub struct BlackboardSummarizer {
    config: Arc<AgentConfig>,
}

impl BlackboardSummarizer {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ActionNode for BlackboardSummarizer {
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

        if !ctx.blackboard.time_to_summarize() {
            return Ok(None);
        }
        super::store_incoming_message(ctx, message);

        let messages = super::construct_prompt(ctx, &self.config, Some(message)).await?;
        let result = super::run_llm_with_schema(
            ctx,
            &self.config,
            &messages,
            self.config.structured_output.as_ref(),
        )
        .await?;
        let result_obj = super::expect_object(&self.config.name, result)?;

        ctx.blackboard
            .update_state_value("last_agent", Value::String(self.config.name.clone()));
        super::apply_result_to_state(ctx, &self.config, &result_obj);
        ctx.blackboard.remove_messages_before_last_plan();
        tracing::debug!(agent = %self.config.name, "summarized and pruned pre-plan history");

        Ok(Some(ToolResult::llm(
            format!("{} acted.", self.config.name),
            Some(Value::Object(result_obj)),
        )))
    }
}
