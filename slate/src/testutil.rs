//! In-memory fixtures for unit and integration tests: a [`NodeContext`]
//! builder with programmatic agent configs, stub tools, and a scripted LLM.
//!
//! Everything is built without touching the on-disk loaders so tests can
//! exercise the runtime's semantics in isolation; loader behavior has its own
//! disk-backed tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::artifacts::ArtifactStore;
use crate::blackboard::Blackboard;
use crate::events::InMemoryEventHub;
use crate::external::{NoopEntities, NoopRag, PassthroughSummarizer};
use crate::llm::MockLlm;
use crate::manager::instantiate_node;
use crate::message::Message;
use crate::node::{ActionNode, NodeContext, RuntimePaths};
use crate::pipeline::HandlerRegistry;
use crate::registry::{
    AgentConfig, AgentRegistry, McpServerEntry, NodeKind, ToolRegistry, DELEGATOR_BEHAVIOR,
    FINAL_ANSWER_BEHAVIOR, SUMMARIZER_BEHAVIOR, TOOL_ARGUMENTS_BEHAVIOR,
};
use crate::tools::{Tool, ToolInvocation, ToolResult};

/// A stub tool that echoes its arguments back as JSON.
struct EchoTool {
    name: String,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, invocation: ToolInvocation) -> ToolResult {
        ToolResult::ok(
            format!("{} executed", self.name),
            Some(Value::Object(invocation.arguments)),
        )
    }
}

/// A built test context: derefs to [`NodeContext`] and keeps the scripted
/// LLM reachable for prompt assertions.
pub struct TestContext {
    ctx: NodeContext,
    pub llm: Arc<MockLlm>,
}

impl TestContext {
    pub fn into_node_context(self) -> NodeContext {
        self.ctx
    }

    /// Text of the last user prompt the mock LLM saw.
    pub fn last_user_prompt(&self) -> String {
        self.llm.last_user_prompt().unwrap_or_default()
    }
}

impl std::ops::Deref for TestContext {
    type Target = NodeContext;

    fn deref(&self) -> &NodeContext {
        &self.ctx
    }
}

pub struct TestContextBuilder {
    agents: Vec<AgentConfig>,
    uninstantiated: Vec<AgentConfig>,
    extra_nodes: Vec<String>,
    llm_responses: Vec<Value>,
    tools: ToolRegistry,
    mcp_servers: BTreeMap<String, McpServerEntry>,
    handlers: HandlerRegistry,
    summarize_threshold: usize,
}

impl Default for TestContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn base_agent(name: &str) -> AgentConfig {
    let mut config = AgentConfig::control_node(name, "");
    config.kind = NodeKind::Agent;
    config.behavior = crate::registry::STANDARD_BEHAVIOR.to_string();
    config.prompts.system = format!("You are {name}.");
    config.prompts.user = "{{ incoming_message }}".to_string();
    config.prompts.description = Some(format!("{name} helps with tasks."));
    config
}

impl TestContextBuilder {
    pub fn new() -> Self {
        Self {
            agents: Vec::new(),
            uninstantiated: Vec::new(),
            extra_nodes: Vec::new(),
            llm_responses: Vec::new(),
            tools: ToolRegistry::new(),
            mcp_servers: BTreeMap::new(),
            handlers: HandlerRegistry::new(),
            summarize_threshold: 12,
        }
    }

    /// A standard agent; a non-empty `user_template` overrides the default.
    pub fn with_agent(mut self, name: &str, user_template: &str) -> Self {
        let mut config = base_agent(name);
        if !user_template.is_empty() {
            config.prompts.user = user_template.to_string();
        }
        self.agents.push(config);
        self
    }

    /// An agent visible in the registry but never instantiated here.
    pub fn with_configured_but_uninstantiated_agent(mut self, name: &str) -> Self {
        self.uninstantiated.push(base_agent(name));
        self
    }

    pub fn with_tool_arguments_agent(mut self) -> Self {
        let mut config = base_agent("shared::tool_arguments");
        config.behavior = TOOL_ARGUMENTS_BEHAVIOR.to_string();
        config.prompts.user = "Generate arguments.\n{{ tool_args }}".to_string();
        self.agents.push(config);
        self
    }

    pub fn with_delegator(mut self, llm_fallback: bool) -> Self {
        let mut config = base_agent("delegator");
        config.behavior = DELEGATOR_BEHAVIOR.to_string();
        config.llm_fallback = llm_fallback;
        self.agents.push(config);
        self
    }

    pub fn with_final_answer_agent(
        mut self,
        name: &str,
        history_char_cap: usize,
        user_context_items: &[&str],
    ) -> Self {
        let mut config = base_agent(name);
        config.behavior = FINAL_ANSWER_BEHAVIOR.to_string();
        config.history_char_cap = history_char_cap;
        config.user_context_items = user_context_items.iter().map(|s| s.to_string()).collect();
        config.prompts.user = "History:\n{{ recent_history }}".to_string();
        self.agents.push(config);
        self
    }

    pub fn with_summarizer_agent(mut self, threshold: usize) -> Self {
        let mut config = base_agent("summarizer");
        config.behavior = SUMMARIZER_BEHAVIOR.to_string();
        config.user_context_items = vec!["history_to_summarize".to_string()];
        config.prompts.user = "Summarize:\n{{ history_to_summarize }}".to_string();
        self.agents.push(config);
        self.summarize_threshold = threshold;
        self
    }

    /// An agent with an image-bearing input schema, as vision helpers have.
    pub fn with_vision_agent(mut self, name: &str) -> Self {
        let mut config = base_agent(name);
        config.input_schema = Some(crate::schema::close_schema(&json!({
            "type": "object",
            "properties": {
                "image": { "type": "string" },
                "question": { "type": "string" }
            },
            "required": ["image", "question"]
        })));
        self.agents.push(config);
        self
    }

    /// Registers an in-memory echo tool under the given name.
    pub fn with_stub_tool(mut self, name: &str) -> Self {
        let tool_name = name.to_string();
        self.tools.register_local(
            name,
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "time": { "type": "number" }
                },
                "required": []
            }),
            "Echoes its arguments.",
            "Produce arguments for: {{ agent_input }}",
            Arc::new(move || {
                Box::new(EchoTool {
                    name: tool_name.clone(),
                })
            }),
        );
        self
    }

    /// A custom control node registered as a no-op instance.
    pub fn with_control_node(mut self, name: &str) -> Self {
        self.extra_nodes.push(name.to_string());
        self
    }

    pub fn with_llm_responses(mut self, responses: Vec<Value>) -> Self {
        self.llm_responses = responses;
        self
    }

    pub fn with_tool_registry(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_mcp_servers(mut self, servers: BTreeMap<String, McpServerEntry>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> TestContext {
        let mut registry = AgentRegistry::new(PathBuf::from("agents"));
        registry.register_builtin_control_nodes();
        for config in self.agents.iter().chain(self.uninstantiated.iter()) {
            registry.register_config(config.clone());
        }
        for name in &self.extra_nodes {
            registry.register_control_node(name, "test control node");
        }
        let registry = Arc::new(registry);

        let mut instances: BTreeMap<String, Arc<dyn ActionNode>> = BTreeMap::new();
        for config in &self.agents {
            let arc = registry.get(&config.name).expect("just registered");
            instances.insert(
                config.name.clone(),
                instantiate_node(arc).expect("known behavior"),
            );
        }
        for builtin in [
            "tool_caller",
            "tool_result_handler",
            "exit_node",
            "flow_exit_node",
            "graceful_exit_node",
            "manager_exit_node",
        ] {
            let arc = registry.get(builtin).expect("builtin registered");
            instances.insert(builtin.to_string(), instantiate_node(arc).expect("builtin"));
        }
        for name in &self.extra_nodes {
            instances.insert(name.clone(), Arc::new(NoopNode { name: name.clone() }));
        }

        let root = std::env::temp_dir().join(format!("slate-test-{}", uuid::Uuid::new_v4()));
        let uploads_dir = root.join("uploads");
        let artifacts_dir = root.join("artifacts");

        let llm = Arc::new(MockLlm::new(self.llm_responses));
        let ctx = NodeContext {
            manager_name: "test_manager".into(),
            blackboard: Arc::new(Blackboard::with_summarize_threshold(
                self.summarize_threshold,
            )),
            agents: registry,
            tools: Arc::new(self.tools),
            mcp_servers: Arc::new(self.mcp_servers),
            llm: llm.clone(),
            hub: Arc::new(InMemoryEventHub::new()),
            rag: Arc::new(NoopRag),
            entities: Arc::new(NoopEntities),
            summarizer: Arc::new(PassthroughSummarizer::default()),
            artifacts: ArtifactStore::new(&artifacts_dir),
            paths: RuntimePaths::new(uploads_dir, artifacts_dir),
            handlers: self.handlers,
            instances: Arc::new(instances),
        };
        TestContext { ctx, llm }
    }
}

/// Records nothing, routes nowhere: a stand-in for manager-specific control
/// nodes referenced by pipeline rules.
struct NoopNode {
    name: String,
}

#[async_trait]
impl ActionNode for NoopNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn action_handler(
        &self,
        ctx: &NodeContext,
        _message: &Message,
    ) -> Result<Option<ToolResult>, crate::error::RuntimeError> {
        ctx.blackboard
            .update_state_value("last_agent", Value::String(self.name.clone()));
        ctx.blackboard
            .update_state_value("next_agent", Value::Null);
        Ok(None)
    }
}

/// Shorthand: one standard `planner` agent, nothing else.
pub fn test_context() -> TestContext {
    TestContextBuilder::new().with_agent("planner", "").build()
}
