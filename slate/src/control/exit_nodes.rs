//! Exit nodes: the four ways control leaves a flow.
//!
//! - [`ExitNode`] pops one scope and hands control back to the caller.
//! - [`FlowExitNode`] signals a finished sub-flow; the delegator is expected
//!   to route the personalized `<caller>_exit` state to the result handler,
//!   which does the actual pop.
//! - [`GracefulExitNode`] records partial findings when recovery is
//!   impossible (max loops, hard errors) and winds down.
//! - [`ManagerExitNode`] stops the manager loop outright.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RuntimeError;
use crate::message::Message;
use crate::node::{ActionNode, NodeContext};
use crate::tools::ToolResult;

pub const EXIT_NODE: &str = "exit_node";
pub const FLOW_EXIT_NODE: &str = "flow_exit_node";
pub const GRACEFUL_EXIT_NODE: &str = "graceful_exit_node";
pub const MANAGER_EXIT_NODE: &str = "manager_exit_node";

const GRACEFUL_EXIT_CONTENT: &str = "Graceful exit has been triggered. Something unexpected \
happened: max task length may have been reached, or there was a more serious error. Recovery is \
impossible at this point; exit the task and write down partial findings. Note what was found, \
what was not examined, and any errors visible in the logs.";

pub struct ExitNode;

#[async_trait]
impl ActionNode for ExitNode {
    fn name(&self) -> &str {
        EXIT_NODE
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let bb = &ctx.blackboard;
        if bb.get_current_call_context().is_some() {
            let popped = bb.pop_call_context()?;
            tracing::info!(node = EXIT_NODE, caller = %popped.calling_agent, "returning control to caller");
            bb.update_state_value("next_agent", Value::String(popped.calling_agent));
        } else {
            tracing::error!(node = EXIT_NODE, "no call stack; a top-level agent should not use exit_node");
            bb.update_state_value("exit", Value::Bool(true));
        }
        bb.update_state_value("last_agent", Value::String(EXIT_NODE.into()));
        Ok(None)
    }
}

pub struct FlowExitNode;

#[async_trait]
impl ActionNode for FlowExitNode {
    fn name(&self) -> &str {
        FLOW_EXIT_NODE
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let bb = &ctx.blackboard;
        bb.update_state_value("next_agent", Value::Null);
        match bb.get_current_call_context() {
            Some(context) => {
                // Sub-task finished: the delegator routes `<caller>_exit` to
                // the result handler, which pops the scope.
                let signal = format!("{}_exit", context.calling_agent);
                tracing::info!(node = FLOW_EXIT_NODE, signal = %signal, "sub-task finished");
                bb.update_state_value("last_agent", Value::String(signal));
            }
            None => {
                tracing::warn!(node = FLOW_EXIT_NODE, "top-level flow finished; signaling manager exit");
                bb.update_global_state_value("exit", Value::Bool(true));
            }
        }
        Ok(None)
    }
}

pub struct GracefulExitNode;

#[async_trait]
impl ActionNode for GracefulExitNode {
    fn name(&self) -> &str {
        GRACEFUL_EXIT_NODE
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        let bb = &ctx.blackboard;
        bb.append_state_value(
            "final_answer_content",
            Value::String(GRACEFUL_EXIT_CONTENT.into()),
        );
        bb.add_msg(
            Message::new()
                .with_sender(GRACEFUL_EXIT_NODE)
                .with_content(GRACEFUL_EXIT_CONTENT),
        );

        if bb.get_current_call_context().is_some() {
            let popped = bb.pop_call_context()?;
            tracing::info!(node = GRACEFUL_EXIT_NODE, caller = %popped.calling_agent, "graceful exit, returning to caller");
            bb.update_state_value("next_agent", Value::String(popped.calling_agent));
        } else {
            bb.update_state_value("exit", Value::Bool(true));
            bb.update_state_value("next_agent", Value::Null);
        }
        bb.update_state_value("last_agent", Value::String(GRACEFUL_EXIT_NODE.into()));
        Ok(None)
    }
}

pub struct ManagerExitNode;

#[async_trait]
impl ActionNode for ManagerExitNode {
    fn name(&self) -> &str {
        MANAGER_EXIT_NODE
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError> {
        tracing::info!(node = MANAGER_EXIT_NODE, "exiting manager loop");
        let bb = &ctx.blackboard;
        bb.update_state_value("exit", Value::Bool(true));
        bb.update_state_value("next_agent", Value::Null);
        bb.update_state_value("last_agent", Value::String(MANAGER_EXIT_NODE.into()));
        Ok(None)
    }
}
