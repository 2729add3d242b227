//! Delegator: routes to the next agent from the manager's flow map.
//!
//! The manager's tick message carries the flow config; routing is a strict
//! `state_map[last_agent] → next` lookup. A missing mapping is a hard error
//! unless the agent config opts into `llm_fallback`, in which case one LLM
//! turn picks the successor from the agent's `allowed_nodes`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::message::Message;
use crate::node::{ActionNode, BusyGuard, NodeContext};
use crate::registry::AgentConfig;
use crate::tools::ToolResult;

/// Sentinel used when no agent has acted yet.
const NO_PREVIOUS_AGENT: &str = "NO_PREVIOUS_AGENT";

/// Declarative routing table for one manager.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub initial_agent: Option<String>,
    #[serde(default)]
    pub state_map: HashMap<String, String>,
}

impl FlowConfig {
    pub fn next_for(&self, last_agent: Option<&str>) -> Option<&str> {
        self.state_map
            .get(last_agent.unwrap_or(NO_PREVIOUS_AGENT))
            .map(String::as_str)
    }
}

pub struct Delegator {
    config: Arc<AgentConfig>,
}

impl Delegator {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }

    fn flow_config(message: &Message) -> Option<FlowConfig> {
        message
            .data
            .as_ref()
            .and_then(|d| d.get("flow_config"))
            .and_then(|f| serde_json::from_value(f.clone()).ok())
    }

    async fn llm_pick(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Option<String>, RuntimeError> {
        let messages = super::construct_prompt(ctx, &self.config, Some(message)).await?;
        let result = super::run_llm_with_schema(
            ctx,
            &self.config,
            &messages,
            self.config.structured_output.as_ref(),
        )
        .await?;
        let result = super::expect_object(&self.config.name, result)?;
        Ok(result
            .get("next_agent")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl ActionNode for Delegator {
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

        let Some(flow) = Self::flow_config(message) else {
            return Err(RuntimeError::ExecutionFailed(format!(
                "[{}] tick message carries no flow_config",
                self.config.name
            )));
        };

        if !message.content.trim().is_empty() {
            bb.add_msg(message.clone());
        }

        // Another node may have routed already.
        if let Some(next) = bb.get_string("next_agent") {
            tracing::info!(delegator = %self.config.name, next_agent = %next, "next_agent already set");
            return Ok(None);
        }

        let last_agent = bb.get_string("last_agent");
        tracing::info!(delegator = %self.config.name, last_agent = ?last_agent, "routing");

        if let Some(next) = flow.next_for(last_agent.as_deref()) {
            tracing::info!(delegator = %self.config.name, next_agent = %next, "delegating via state map");
            bb.update_state_value("next_agent", Value::String(next.to_string()));
            return Ok(None);
        }

        if self.config.llm_fallback {
            if let Some(next) = self.llm_pick(ctx, message).await? {
                tracing::info!(delegator = %self.config.name, next_agent = %next, "delegating via LLM fallback");
                bb.update_state_value("next_agent", Value::String(next));
                return Ok(None);
            }
        }

        tracing::error!(
            delegator = %self.config.name,
            last_agent = ?last_agent,
            "no state_map entry for last agent"
        );
        bb.update_state_value(
            "error_message",
            Value::String("delegator routing failed: missing state_map entry".into()),
        );
        bb.update_state_value("error", Value::Bool(true));
        bb.update_state_value("last_agent", Value::String(self.config.name.clone()));
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestContextBuilder;
    use serde_json::json;

    fn tick(state_map: Value) -> Message {
        Message::new().with_data(json!({ "flow_config": { "state_map": state_map } }))
    }

    fn delegator(ctx: &NodeContext) -> Delegator {
        Delegator::new(ctx.agents.get("delegator").unwrap())
    }

    /// **Scenario**: a strict mapping routes last_agent → next.
    #[tokio::test]
    async fn strict_mapping_routes() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        ctx.blackboard
            .update_state_value("last_agent", json!("planner"));

        delegator(&ctx)
            .action_handler(&ctx, &tick(json!({"planner": "tool_caller"})))
            .await
            .unwrap();
        assert_eq!(
            ctx.blackboard.get_string("next_agent").as_deref(),
            Some("tool_caller")
        );
        assert!(!ctx.blackboard.get_bool("error"));
    }

    /// **Scenario**: a pre-set next_agent short-circuits routing.
    #[tokio::test]
    async fn preset_next_agent_wins() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        ctx.blackboard
            .update_state_value("next_agent", json!("critic"));
        ctx.blackboard
            .update_state_value("last_agent", json!("planner"));

        delegator(&ctx)
            .action_handler(&ctx, &tick(json!({"planner": "tool_caller"})))
            .await
            .unwrap();
        assert_eq!(
            ctx.blackboard.get_string("next_agent").as_deref(),
            Some("critic")
        );
    }

    /// **Scenario**: missing mapping in strict mode sets the error state
    /// instead of routing blind.
    #[tokio::test]
    async fn missing_mapping_is_hard_error() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        ctx.blackboard
            .update_state_value("last_agent", json!("stranger"));

        delegator(&ctx)
            .action_handler(&ctx, &tick(json!({"planner": "tool_caller"})))
            .await
            .unwrap();
        let bb = &ctx.blackboard;
        assert!(bb.get_bool("error"));
        assert!(bb
            .get_string("error_message")
            .unwrap()
            .contains("missing state_map entry"));
        assert_eq!(bb.get_string("last_agent").as_deref(), Some("delegator"));
    }

    /// **Scenario**: the llm_fallback variant consults the LLM instead of
    /// erroring.
    #[tokio::test]
    async fn llm_fallback_picks_successor() {
        let ctx = TestContextBuilder::new()
            .with_delegator(true)
            .with_llm_responses(vec![json!({"next_agent": "critic"})])
            .build();
        ctx.blackboard
            .update_state_value("last_agent", json!("stranger"));

        delegator(&ctx)
            .action_handler(&ctx, &tick(json!({})))
            .await
            .unwrap();
        assert_eq!(
            ctx.blackboard.get_string("next_agent").as_deref(),
            Some("critic")
        );
        assert!(!ctx.blackboard.get_bool("error"));
    }

    /// **Scenario**: a tick without flow_config is a programming error.
    #[tokio::test]
    async fn missing_flow_config_errors() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        let err = delegator(&ctx)
            .action_handler(&ctx, &Message::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flow_config"));
    }

    #[test]
    fn flow_config_uses_sentinel_for_first_turn() {
        let flow: FlowConfig = serde_json::from_value(json!({
            "state_map": {"NO_PREVIOUS_AGENT": "planner"}
        }))
        .unwrap();
        assert_eq!(flow.next_for(None), Some("planner"));
        assert_eq!(flow.next_for(Some("planner")), None);
    }
}
