//! Runnable nodes and the per-manager context they execute in.
//!
//! Agents and control nodes share one calling convention: the manager (or a
//! dispatching node) hands them the triggering message plus a [`NodeContext`]
//! bundling the blackboard, registries, collaborators, and the manager's
//! instance table. Nodes keep no references to each other; dispatch goes
//! through the instance table by canonical name, which is what breaks
//! agent → tool → agent reference cycles.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::artifacts::ArtifactStore;
use crate::blackboard::Blackboard;
use crate::error::RuntimeError;
use crate::events::EventHub;
use crate::external::{EntityStore, RagStore, ResultSummarizer};
use crate::llm::LlmClient;
use crate::message::Message;
use crate::pipeline::HandlerRegistry;
use crate::registry::{AgentRegistry, McpServerEntry, ToolRegistry};
use crate::tools::ToolResult;

/// Filesystem roots a running manager needs.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Where MCP images and other uploads are written and resolved.
    pub uploads_dir: PathBuf,
    /// Where tool-result artifacts are persisted.
    pub artifacts_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(uploads_dir: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

/// Everything a node needs to run one turn. One context per manager; nodes
/// receive it by reference on every call.
pub struct NodeContext {
    pub manager_name: String,
    pub blackboard: Arc<Blackboard>,
    pub agents: Arc<AgentRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub mcp_servers: Arc<BTreeMap<String, McpServerEntry>>,
    pub llm: Arc<dyn LlmClient>,
    pub hub: Arc<dyn EventHub>,
    pub rag: Arc<dyn RagStore>,
    pub entities: Arc<dyn EntityStore>,
    pub summarizer: Arc<dyn ResultSummarizer>,
    pub artifacts: ArtifactStore,
    pub paths: RuntimePaths,
    pub handlers: HandlerRegistry,
    /// The manager's instantiated nodes, keyed by canonical name.
    pub instances: Arc<BTreeMap<String, Arc<dyn ActionNode>>>,
}

impl NodeContext {
    pub fn instance(&self, name: &str) -> Option<Arc<dyn ActionNode>> {
        self.instances.get(name).cloned()
    }
}

/// A runnable node: an LLM agent or a deterministic control node.
///
/// `action_handler` runs one turn. Errors bubble to the manager, which
/// records them as blackboard error state; the per-agent busy flag must be
/// released on every path.
#[async_trait]
pub trait ActionNode: Send + Sync {
    fn name(&self) -> &str;

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        message: &Message,
    ) -> Result<Option<ToolResult>, RuntimeError>;
}

/// Releases an agent's busy flag on drop so a panicking or erroring turn can
/// never leave the flag stuck.
pub struct BusyGuard {
    blackboard: Arc<Blackboard>,
    agent: String,
}

impl BusyGuard {
    pub fn acquire(blackboard: Arc<Blackboard>, agent: &str) -> Self {
        blackboard.set_agent_busy(agent, true);
        Self {
            blackboard,
            agent: agent.to_string(),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.blackboard.set_agent_busy(&self.agent, false);
    }
}
