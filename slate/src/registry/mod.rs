//! Discovery and loading of agents, control nodes, tools, and MCP servers
//! from on-disk configuration.
//!
//! Loaders run once at startup and produce immutable, shareable registries.
//! Agent problems abort process start (fail fast); malformed MCP entries are
//! skipped with a warning so one broken server never takes down the runtime.

mod agents;
mod mcp_directory;
mod mcp_tool_cache;
mod tools;

pub use agents::{
    AgentConfig, AgentPrompts, AgentRegistry, AllowList, LoaderError, NodeKind,
    DELEGATOR_BEHAVIOR, FINAL_ANSWER_BEHAVIOR, STANDARD_BEHAVIOR, SUMMARIZER_BEHAVIOR,
    TOOL_ARGUMENTS_BEHAVIOR,
};
pub use mcp_directory::{
    load_server_directory, LaunchOption, McpPolicy, McpServerEntry, SessionMode,
};
pub use mcp_tool_cache::{cache_path, load_tool_cache, sanitize_server_id, ToolCacheEntry};
pub use tools::{ToolEntry, ToolRegistry, ToolRegistryError};
