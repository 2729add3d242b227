//! # Slate
//!
//! A blackboard-driven multi-agent orchestration runtime. Managers drive
//! LLM agents and deterministic control nodes over a shared, scoped
//! blackboard; tools dispatch to local implementations, sub-agents (with
//! call-stack scoping), or external MCP stdio servers.
//!
//! ## Design
//!
//! - **Blackboard**: the sole medium of inter-agent communication — a scoped
//!   key-value store, an append-only message log, and a call stack. Sub-agent
//!   calls push a scope; tool calls stay in the current one.
//! - **Manager loop**: a cooperative single-threaded scheduler per manager.
//!   `next_agent` (or the delegator's flow map) picks the node to dispatch;
//!   exit/error flags, cancellation, and a max-loop guard bound the run.
//!   Managers run concurrently; registries are shared read-only.
//! - **Dispatch**: agents select actions by name in a single namespace.
//!   Argument generation stages a `pending_tool`; [`control::ToolCaller`]
//!   resolves tool → agent → control node and executes; the result handler
//!   persists artifacts, evaluates after-tool pipeline rules, and routes
//!   control back.
//! - **Registries**: agents, tools, and MCP servers load from disk once and
//!   are immutable afterwards. MCP tool schemas are synthesized from cached
//!   `tools/list` payloads, closed and nullable-optional.
//! - **MCP**: line-delimited JSON-RPC 2.0 over child-process stdio, per-call
//!   or stateful sessions with restart-on-failure, image persistence, and
//!   history sanitization.
//!
//! ## Main modules
//!
//! - [`blackboard`]: [`Blackboard`], scopes, [`CallContext`], pipeline state.
//! - [`manager`]: [`Manager`], [`ManagerConfig`], the control loop.
//! - [`agent`]: the agent turn template; [`ToolArguments`], [`Delegator`],
//!   [`FinalAnswer`], [`BlackboardSummarizer`].
//! - [`control`]: [`ToolCaller`], [`ToolResultHandler`], exit nodes.
//! - [`registry`]: loaders for agents, tools, MCP servers and tool caches.
//! - [`mcp`]: stdio JSON-RPC client, session supervision, content handling.
//! - [`pipeline`]: declarative after-tool rules.
//! - [`llm`], [`external`], [`events`]: collaborator traits (provider, RAG,
//!   entities, summarizer, event hub) with defaults/mocks.
//! - [`artifacts`]: the tool-result artifact store.
//! - [`tasks`]: task-file discovery (frontmatter + markdown).

pub mod agent;
pub mod artifacts;
pub mod blackboard;
pub mod control;
pub mod error;
pub mod events;
pub mod external;
pub mod llm;
pub mod manager;
pub mod mcp;
pub mod message;
pub mod node;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod schema;
pub mod tasks;
#[doc(hidden)]
pub mod testutil;
pub mod tools;

pub use agent::{Agent, BlackboardSummarizer, Delegator, FinalAnswer, FlowConfig, ToolArguments};
pub use artifacts::{ArtifactStore, ToolResultArtifact};
pub use blackboard::{pipeline_state, Blackboard, CallContext, ROOT_SCOPE};
pub use control::{ExitNode, FlowExitNode, GracefulExitNode, ManagerExitNode, ToolCaller, ToolResultHandler};
pub use error::{abort_process, RuntimeError};
pub use events::{EventHub, InMemoryEventHub, PROGRESS_FACT_TOPIC};
pub use external::{EntityStore, PassthroughSummarizer, RagHit, RagStore, ResultSummarizer};
pub use llm::{LlmClient, LlmMessage, LlmParams, MockLlm};
pub use manager::{build_instances, instantiate_node, Manager, ManagerConfig, ManagerOutcome, StopReason};
pub use message::{AgentInput, DataType, Message};
pub use node::{ActionNode, BusyGuard, NodeContext, RuntimePaths};
pub use pipeline::{ConditionHandler, HandlerRegistry, PipelineRule};
pub use registry::{
    AgentConfig, AgentRegistry, LoaderError, McpServerEntry, SessionMode, ToolEntry, ToolRegistry,
};
pub use tools::{ResultType, Tool, ToolFactory, ToolInvocation, ToolResult};
