//! Deterministic control nodes: dispatch, result handling, and exits.
//!
//! Control nodes run in the same calling convention as agents but never call
//! the LLM. They are registered under fixed names and wired into manager
//! flows via state maps.

mod exit_nodes;
mod tool_caller;
mod tool_result_handler;

pub use exit_nodes::{ExitNode, FlowExitNode, GracefulExitNode, ManagerExitNode};
pub use tool_caller::ToolCaller;
pub use tool_result_handler::{process_agent_result, process_tool_result, ToolResultHandler};
