//! Manager: the cooperative per-flow scheduler.
//!
//! A manager owns its blackboard, its node instances, and a flow config. The
//! loop reads `next_agent` (falling back to the delegator), dispatches one
//! node, then hands the delegator a synthetic tick message carrying the flow
//! config. Exit and error flags, a cooperative cancel flag, and a max-loop
//! guard bound the loop. Managers fork cheaply: registries are shared
//! read-only, instances and blackboards are per-manager.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::agent::{Agent, BlackboardSummarizer, Delegator, FinalAnswer, FlowConfig, ToolArguments};
use crate::control::{ExitNode, FlowExitNode, GracefulExitNode, ManagerExitNode, ToolCaller, ToolResultHandler};
use crate::error::RuntimeError;
use crate::message::Message;
use crate::node::{ActionNode, NodeContext};
use crate::pipeline::PipelineRule;
use crate::registry::{
    AgentConfig, AgentRegistry, NodeKind, DELEGATOR_BEHAVIOR, FINAL_ANSWER_BEHAVIOR,
    STANDARD_BEHAVIOR, SUMMARIZER_BEHAVIOR, TOOL_ARGUMENTS_BEHAVIOR,
};

/// One manager's declarative configuration (from its YAML file).
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    pub name: String,
    #[serde(default)]
    pub flow: FlowConfig,
    /// Canonical names of the agents this manager instantiates.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Control nodes wired into the flow (built-ins plus custom ones).
    #[serde(default)]
    pub control_nodes: Vec<String>,
    #[serde(default = "default_delegator")]
    pub delegator: String,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    #[serde(default)]
    pub tool_pipeline: Vec<PipelineRule>,
}

fn default_delegator() -> String {
    "delegator".to_string()
}

fn default_max_loops() -> u32 {
    50
}

impl ManagerConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| RuntimeError::ExecutionFailed(format!("{}: {e}", path.display())))
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Exit,
    Error,
    Cancelled,
    MaxLoops,
}

/// Final accounting of one manager run.
#[derive(Debug, Clone)]
pub struct ManagerOutcome {
    pub reason: StopReason,
    pub loops: u32,
    pub error_message: Option<String>,
}

/// Builds the node instance for one config, by behavior for agents and by
/// name for the built-in control nodes. Explicit construction replaces the
/// original design's runtime class loading.
pub fn instantiate_node(config: Arc<AgentConfig>) -> Result<Arc<dyn ActionNode>, RuntimeError> {
    if config.kind == NodeKind::ControlNode {
        let node: Arc<dyn ActionNode> = match config.name.as_str() {
            "tool_caller" => Arc::new(ToolCaller::new()),
            "tool_result_handler" => Arc::new(ToolResultHandler::new()),
            "exit_node" => Arc::new(ExitNode),
            "flow_exit_node" => Arc::new(FlowExitNode),
            "graceful_exit_node" => Arc::new(GracefulExitNode),
            "manager_exit_node" => Arc::new(ManagerExitNode),
            other => {
                return Err(RuntimeError::NoInstance(format!(
                    "control node {other:?} has no built-in implementation; register it explicitly"
                )))
            }
        };
        return Ok(node);
    }

    let node: Arc<dyn ActionNode> = match config.behavior.as_str() {
        STANDARD_BEHAVIOR => Arc::new(Agent::new(config)),
        TOOL_ARGUMENTS_BEHAVIOR => Arc::new(ToolArguments::new(config)),
        DELEGATOR_BEHAVIOR => Arc::new(Delegator::new(config)),
        FINAL_ANSWER_BEHAVIOR => Arc::new(FinalAnswer::new(config)),
        SUMMARIZER_BEHAVIOR => Arc::new(BlackboardSummarizer::new(config)),
        other => {
            return Err(RuntimeError::NoInstance(format!(
                "agent behavior {other:?} is unknown"
            )))
        }
    };
    Ok(node)
}

/// Instantiates the manager's nodes: its agents, its control nodes, and any
/// explicitly provided extra instances (custom control nodes).
pub fn build_instances(
    registry: &AgentRegistry,
    config: &ManagerConfig,
    extra: Vec<Arc<dyn ActionNode>>,
) -> Result<BTreeMap<String, Arc<dyn ActionNode>>, RuntimeError> {
    let mut instances: BTreeMap<String, Arc<dyn ActionNode>> = BTreeMap::new();
    for name in config.agents.iter().chain(config.control_nodes.iter()) {
        let agent_config = registry
            .get(name)
            .ok_or_else(|| RuntimeError::NoInstance(name.clone()))?;
        instances.insert(name.clone(), instantiate_node(agent_config)?);
    }
    for node in extra {
        instances.insert(node.name().to_string(), node);
    }
    Ok(instances)
}

pub struct Manager {
    config: ManagerConfig,
    ctx: NodeContext,
    cancel: Arc<AtomicBool>,
}

impl Manager {
    /// Wraps an already-built context. `ctx.instances` must contain every
    /// node the flow references (see [`build_instances`]).
    pub fn new(config: ManagerConfig, ctx: NodeContext) -> Self {
        Self {
            config,
            ctx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Cooperative cancel flag, checked between iterations.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn tick_message(&self) -> Message {
        let flow = serde_json::to_value(FlowTick {
            state_map: self.config.flow.state_map.clone(),
            initial_agent: self.config.flow.initial_agent.clone(),
        })
        .unwrap_or(Value::Null);
        Message::new().with_data(serde_json::json!({ "flow_config": flow }))
    }

    /// Runs the loop to completion. Fatal errors (quota exhaustion) are
    /// returned to the caller, which funnels them into the process-wide
    /// abort; everything else ends as an outcome.
    pub async fn run(&self, initial_message: Message) -> Result<ManagerOutcome, RuntimeError> {
        let bb = &self.ctx.blackboard;

        // Make the pipeline rules visible to the result handler, register
        // configured event subscriptions, and seed the entry point.
        if !self.config.tool_pipeline.is_empty() {
            if let Ok(rules) = serde_json::to_value(&self.config.tool_pipeline) {
                bb.update_global_state_value("tool_pipeline", rules);
            }
        }
        for name in &self.config.agents {
            if let Some(agent_config) = self.ctx.agents.get(name) {
                for event in &agent_config.events {
                    self.ctx.hub.register(event, name);
                }
            }
        }
        if let Some(initial) = &self.config.flow.initial_agent {
            bb.update_state_value("next_agent", Value::String(initial.clone()));
        }

        // The delegator reads the flow config from whatever message it is
        // handed, so the initial message carries it too.
        let mut current_message = initial_message;
        let flow_value = self
            .tick_message()
            .data
            .and_then(|d| d.get("flow_config").cloned())
            .unwrap_or(Value::Null);
        match current_message.data.as_mut() {
            Some(Value::Object(data)) => {
                data.entry("flow_config".to_string()).or_insert(flow_value);
            }
            _ => {
                current_message.data =
                    Some(serde_json::json!({ "flow_config": flow_value }));
            }
        }
        let mut loops: u32 = 0;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::info!(manager = %self.config.name, "cancelled");
                bb.update_global_state_value("exit", Value::Bool(true));
                bb.update_global_state_value("cancelled", Value::Bool(true));
                return Ok(self.outcome(StopReason::Cancelled, loops));
            }
            if bb.get_bool("exit") {
                return Ok(self.outcome(StopReason::Exit, loops));
            }
            if bb.get_bool("error") {
                return Ok(self.outcome(StopReason::Error, loops));
            }

            let next_name = bb
                .get_string("next_agent")
                .unwrap_or_else(|| self.config.delegator.clone());

            let Some(node) = self.ctx.instance(&next_name) else {
                tracing::error!(manager = %self.config.name, node = %next_name, "no instance for node");
                bb.update_state_value(
                    "error_message",
                    Value::String(format!("no instance for node: {next_name}")),
                );
                bb.update_state_value("error", Value::Bool(true));
                return Ok(self.outcome(StopReason::Error, loops));
            };

            tracing::debug!(manager = %self.config.name, node = %next_name, loop_count = loops, "dispatching");
            if let Err(e) = node.action_handler(&self.ctx, &current_message).await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::error!(manager = %self.config.name, node = %next_name, error = %e, "node failed");
                bb.update_state_value("error_message", Value::String(e.to_string()));
                bb.update_state_value("error", Value::Bool(true));
                return Ok(self.outcome(StopReason::Error, loops));
            }

            current_message = self.tick_message();
            loops += 1;
            bb.update_state_value("manager_loop_count", Value::from(loops));

            if loops > self.config.max_loops {
                tracing::warn!(manager = %self.config.name, loops, "max loops exceeded; forcing graceful exit");
                if let Some(graceful) = self.ctx.instance("graceful_exit_node") {
                    graceful.action_handler(&self.ctx, &current_message).await?;
                } else {
                    bb.update_state_value("exit", Value::Bool(true));
                }
                bb.update_state_value("exit", Value::Bool(true));
                return Ok(self.outcome(StopReason::MaxLoops, loops));
            }
        }
    }

    fn outcome(&self, reason: StopReason, loops: u32) -> ManagerOutcome {
        ManagerOutcome {
            reason,
            loops,
            error_message: self.ctx.blackboard.get_string("error_message"),
        }
    }
}

#[derive(serde::Serialize)]
struct FlowTick {
    state_map: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_agent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DataType;
    use crate::testutil::TestContextBuilder;
    use serde_json::json;

    fn manager_config(state_map: Value, max_loops: u32) -> ManagerConfig {
        serde_yaml::from_str(&format!(
            concat!(
                "name: test_manager\n",
                "max_loops: {max_loops}\n",
                "flow:\n",
                "  state_map: {state_map}\n",
            ),
            max_loops = max_loops,
            state_map = state_map,
        ))
        .unwrap()
    }

    /// **Scenario**: delegator-driven flow runs an agent whose `done` turn
    /// has no successor mapping, surfacing the strict-routing error exit.
    #[tokio::test]
    async fn loop_runs_delegator_then_agent_then_errors_on_missing_mapping() {
        let ctx = TestContextBuilder::new()
            .with_delegator(false)
            .with_agent("planner", "")
            .with_llm_responses(vec![json!({"action": "done"})])
            .build();
        let config = manager_config(json!({"NO_PREVIOUS_AGENT": "planner"}), 10);
        let manager = Manager::new(config, ctx.into_node_context());

        let outcome = manager
            .run(Message::new().with_data_type(DataType::Task).with_content("go"))
            .await
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Error);
        assert!(outcome.error_message.unwrap().contains("state_map"));
    }

    /// **Scenario**: a flow that reaches manager_exit_node stops cleanly.
    #[tokio::test]
    async fn loop_exits_cleanly_via_exit_node() {
        let ctx = TestContextBuilder::new()
            .with_delegator(false)
            .with_agent("planner", "")
            .with_llm_responses(vec![json!({"action": "done"})])
            .build();
        let config = manager_config(
            json!({"NO_PREVIOUS_AGENT": "planner", "planner": "manager_exit_node"}),
            10,
        );
        let manager = Manager::new(config, ctx.into_node_context());

        let outcome = manager.run(Message::new().with_content("go")).await.unwrap();
        assert_eq!(outcome.reason, StopReason::Exit);
        assert!(outcome.loops >= 2);
    }

    /// **Scenario**: the max-loop guard forces a graceful exit when the loop budget runs out.
    #[tokio::test]
    async fn max_loops_forces_graceful_exit() {
        // planner keeps answering `done`, delegator keeps routing back to it.
        let responses = (0..20).map(|_| json!({"action": "done"})).collect();
        let ctx = TestContextBuilder::new()
            .with_delegator(false)
            .with_agent("planner", "")
            .with_llm_responses(responses)
            .build();
        let config = manager_config(
            json!({"NO_PREVIOUS_AGENT": "planner", "planner": "planner"}),
            3,
        );
        let manager = Manager::new(config, ctx.into_node_context());

        let outcome = manager.run(Message::new().with_content("go")).await.unwrap();
        assert_eq!(outcome.reason, StopReason::MaxLoops);
        assert!(manager.context().blackboard.get_bool("exit"));
        // Graceful exit recorded partial findings.
        assert!(manager
            .context()
            .blackboard
            .get_state_value("final_answer_content")
            .is_some());
    }

    /// **Scenario**: cancellation surfaces as exit + cancelled flags.
    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        let config = manager_config(json!({}), 10);
        let manager = Manager::new(config, ctx.into_node_context());
        manager.cancel_handle().store(true, Ordering::SeqCst);

        let outcome = manager.run(Message::new()).await.unwrap();
        assert_eq!(outcome.reason, StopReason::Cancelled);
        let bb = &manager.context().blackboard;
        assert_eq!(bb.get_global_state_value("exit"), Some(json!(true)));
        assert_eq!(bb.get_global_state_value("cancelled"), Some(json!(true)));
    }

    /// **Scenario**: an unknown node name ends the loop with error state.
    #[tokio::test]
    async fn unknown_instance_is_an_error_outcome() {
        let ctx = TestContextBuilder::new().with_delegator(false).build();
        let config = manager_config(json!({"NO_PREVIOUS_AGENT": "ghost"}), 10);
        let manager = Manager::new(config, ctx.into_node_context());

        let outcome = manager.run(Message::new()).await.unwrap();
        assert_eq!(outcome.reason, StopReason::Error);
        assert!(outcome.error_message.unwrap().contains("ghost"));
    }

    /// **Scenario**: initial_agent seeds the first dispatch directly.
    #[tokio::test]
    async fn initial_agent_skips_first_delegation() {
        let ctx = TestContextBuilder::new()
            .with_agent("planner", "")
            .with_llm_responses(vec![json!({"action": "done"})])
            .build();
        let config: ManagerConfig = serde_yaml::from_str(concat!(
            "name: m\n",
            "flow:\n",
            "  initial_agent: planner\n",
            "  state_map: {planner: manager_exit_node}\n",
        ))
        .unwrap();
        let manager = Manager::new(config, ctx.into_node_context());
        let outcome = manager.run(Message::new().with_content("go")).await.unwrap();
        assert_eq!(outcome.reason, StopReason::Error); // no delegator instance registered
        // The planner did run before the loop fell back to the missing delegator.
        assert!(manager
            .context()
            .blackboard
            .get_state_value("planner_action_count")
            .is_some());
    }
}
