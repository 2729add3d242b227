//! Tool registry: local tool entries from disk plus MCP tools synthesized
//! from cached `tools/list` payloads.
//!
//! A local tool pairs an on-disk entry with an explicitly registered factory:
//!
//! ```text
//! tools/
//!   search_notes/
//!     tool.yaml                      (name + inner args schema)
//!     prompts/
//!       search_notes_description.j2
//!       search_notes_args.j2
//! ```
//!
//! Rust has no runtime class loading, so implementations are registered by
//! name before `load_local_tools`; an on-disk entry without a factory is a
//! startup error. MCP tools need no factory: the session layer executes them,
//! and their schemas are synthesized here from the cached `inputSchema`
//! (closed, all-required, optionals nullable) under namespaced names
//! `mcp::<server_id>::<tool_name>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::mcp_directory::McpServerEntry;
use super::mcp_tool_cache::load_tool_cache;
use crate::schema::{close_schema, tool_argument_envelope};
use crate::tools::ToolFactory;

#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("{path}: io: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: yaml: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("[{tool}] missing required prompt template: {template}")]
    MissingTemplate { tool: String, template: String },
    #[error("[{tool}] no factory registered for on-disk tool entry")]
    MissingFactory { tool: String },
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),
}

/// One dispatchable tool.
#[derive(Clone)]
pub enum ToolEntry {
    Local {
        name: String,
        /// Outer `{tool_name, arguments}` envelope, closed.
        arguments_schema: Value,
        /// Inner argument object, closed.
        args_schema: Value,
        description_template: String,
        args_template: String,
        factory: ToolFactory,
    },
    Mcp {
        name: String,
        server_id: String,
        mcp_tool_name: String,
        description: String,
        arguments_schema: Value,
        args_schema: Value,
    },
}

impl ToolEntry {
    pub fn name(&self) -> &str {
        match self {
            ToolEntry::Local { name, .. } | ToolEntry::Mcp { name, .. } => name,
        }
    }

    pub fn arguments_schema(&self) -> &Value {
        match self {
            ToolEntry::Local {
                arguments_schema, ..
            }
            | ToolEntry::Mcp {
                arguments_schema, ..
            } => arguments_schema,
        }
    }

    pub fn is_mcp(&self) -> bool {
        matches!(self, ToolEntry::Mcp { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RawToolConfig {
    name: String,
    #[serde(default)]
    args_schema: Option<Value>,
}

/// Shared, read-only tool inventory.
#[derive(Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
    factories: BTreeMap<String, ToolFactory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the implementation for a local tool; must happen before
    /// [`ToolRegistry::load_local_tools`].
    pub fn register_factory(&mut self, name: &str, factory: ToolFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Registers a local tool entirely in memory: schemas are closed here,
    /// the envelope is synthesized, and no prompt files are involved.
    /// Embedders use this for tools that ship with the binary.
    pub fn register_local(
        &mut self,
        name: &str,
        args_schema: Value,
        description_template: &str,
        args_template: &str,
        factory: ToolFactory,
    ) {
        let arguments_schema = tool_argument_envelope(name, &args_schema);
        self.entries.insert(
            name.to_string(),
            ToolEntry::Local {
                name: name.to_string(),
                arguments_schema,
                args_schema: close_schema(&args_schema),
                description_template: description_template.to_string(),
                args_template: args_template.to_string(),
                factory,
            },
        );
    }

    /// Loads local tool entries from disk and pairs them with registered
    /// factories. Missing templates or factories fail fast.
    pub fn load_local_tools(&mut self, tools_dir: &Path) -> Result<(), ToolRegistryError> {
        if !tools_dir.exists() {
            tracing::info!(dir = %tools_dir.display(), "tools directory not found; skipping local tools");
            return Ok(());
        }
        let read = std::fs::read_dir(tools_dir).map_err(|source| ToolRegistryError::Io {
            path: tools_dir.to_path_buf(),
            source,
        })?;
        let mut dirs: Vec<PathBuf> = read
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join("tool.yaml").exists())
            .collect();
        dirs.sort();

        for dir in dirs {
            let config_path = dir.join("tool.yaml");
            let text = std::fs::read_to_string(&config_path).map_err(|source| {
                ToolRegistryError::Io {
                    path: config_path.clone(),
                    source,
                }
            })?;
            let raw: RawToolConfig =
                serde_yaml::from_str(&text).map_err(|source| ToolRegistryError::Yaml {
                    path: config_path,
                    source,
                })?;
            let name = raw.name;

            let description_template = read_template(&dir, &name, "description")?;
            let args_template = read_template(&dir, &name, "args")?;

            let factory = self
                .factories
                .get(&name)
                .cloned()
                .ok_or_else(|| ToolRegistryError::MissingFactory { tool: name.clone() })?;

            let inner = raw
                .args_schema
                .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));
            let args_schema = close_schema(&inner);
            let arguments_schema = tool_argument_envelope(&name, &inner);

            if self.entries.contains_key(&name) {
                return Err(ToolRegistryError::DuplicateTool(name));
            }
            tracing::info!(tool = %name, "registered local tool");
            self.entries.insert(
                name.clone(),
                ToolEntry::Local {
                    name,
                    arguments_schema,
                    args_schema,
                    description_template,
                    args_template,
                    factory,
                },
            );
        }
        Ok(())
    }

    /// Synthesizes namespaced MCP tool entries from each enabled server's
    /// cached tool list, honoring per-server allow/denylists.
    pub fn load_mcp_tools(
        &mut self,
        mcp_dir: &Path,
        servers: &BTreeMap<String, McpServerEntry>,
    ) -> Vec<String> {
        let mut problems = Vec::new();
        for (server_id, entry) in servers {
            if !entry.enabled {
                tracing::info!(server = %server_id, "MCP server disabled; skipping tools");
                continue;
            }
            let (tools, cache_problems) = load_tool_cache(mcp_dir, server_id);
            problems.extend(cache_problems);
            for tool in tools {
                if !entry.tool_permitted(&tool.name) {
                    continue;
                }
                let namespaced = format!("mcp::{}::{}", server_id, tool.name);
                let inner = tool
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));
                let args_schema = close_schema(&inner);
                let arguments_schema = tool_argument_envelope(&namespaced, &inner);
                if self.entries.contains_key(&namespaced) {
                    problems.push(format!("duplicate MCP tool name: {namespaced}"));
                    continue;
                }
                self.entries.insert(
                    namespaced.clone(),
                    ToolEntry::Mcp {
                        name: namespaced,
                        server_id: server_id.clone(),
                        mcp_tool_name: tool.name,
                        description: tool.description.unwrap_or_default(),
                        arguments_schema,
                        args_schema,
                    },
                );
            }
        }
        for problem in &problems {
            tracing::warn!(%problem, "MCP tool load issue");
        }
        problems
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Rendered description for prompts. MCP tools carry plain descriptions;
    /// local tools render their template without context.
    pub fn description(&self, name: &str) -> Option<String> {
        match self.entries.get(name)? {
            ToolEntry::Local {
                description_template,
                ..
            } => crate::prompt::render(name, description_template, &serde_json::json!({})).ok(),
            ToolEntry::Mcp { description, .. } => Some(description.clone()),
        }
    }

    /// Rendered argument-generation prompt for a tool.
    pub fn args_prompt(&self, name: &str, context: &Value) -> Option<String> {
        match self.entries.get(name)? {
            ToolEntry::Local { args_template, .. } => {
                crate::prompt::render(name, args_template, context).ok()
            }
            ToolEntry::Mcp {
                description,
                args_schema,
                ..
            } => Some(format!(
                "{}\n\nProvide arguments matching this schema:\n{}",
                description,
                serde_json::to_string_pretty(args_schema).unwrap_or_default()
            )),
        }
    }

    /// Descriptions for a set of allowed tools, keyed by name.
    pub fn descriptions(&self, allowed: &[String]) -> BTreeMap<String, String> {
        allowed
            .iter()
            .filter_map(|name| self.description(name).map(|d| (name.clone(), d)))
            .collect()
    }
}

fn read_template(dir: &Path, tool: &str, kind: &str) -> Result<String, ToolRegistryError> {
    let path = dir.join("prompts").join(format!("{tool}_{kind}.j2"));
    std::fs::read_to_string(&path).map_err(|_| ToolRegistryError::MissingTemplate {
        tool: tool.to_string(),
        template: format!("prompts/{tool}_{kind}.j2"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mcp_directory::load_server_directory;
    use crate::schema::is_closed;
    use crate::tools::{Tool, ToolInvocation, ToolResult};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubTool;

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            "search_notes"
        }
        async fn execute(&self, _invocation: ToolInvocation) -> ToolResult {
            ToolResult::ok("stub", None)
        }
    }

    fn write_local_tool(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("prompts")).unwrap();
        std::fs::write(
            dir.join("tool.yaml"),
            format!(
                "name: {name}\nargs_schema:\n  type: object\n  properties:\n    query: {{type: string}}\n  required: [query]\n"
            ),
        )
        .unwrap();
        std::fs::write(
            dir.join(format!("prompts/{name}_description.j2")),
            "Searches the notes store.",
        )
        .unwrap();
        std::fs::write(
            dir.join(format!("prompts/{name}_args.j2")),
            "Produce arguments for query: {{ agent_input }}",
        )
        .unwrap();
    }

    fn registry_with_stub(root: &Path) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_factory("search_notes", Arc::new(|| Box::new(StubTool)));
        registry.load_local_tools(root).unwrap();
        registry
    }

    /// **Scenario**: a local tool loads with closed inner and envelope schemas.
    #[test]
    fn local_tool_loads_with_closed_schemas() {
        let tmp = tempfile::tempdir().unwrap();
        write_local_tool(tmp.path(), "search_notes");
        let registry = registry_with_stub(tmp.path());

        let entry = registry.get("search_notes").unwrap();
        assert!(is_closed(entry.arguments_schema()));
        assert_eq!(
            entry.arguments_schema()["properties"]["tool_name"]["const"],
            serde_json::json!("search_notes")
        );
        assert_eq!(
            registry.description("search_notes").unwrap(),
            "Searches the notes store."
        );
        let prompt = registry
            .args_prompt("search_notes", &serde_json::json!({"agent_input": "find x"}))
            .unwrap();
        assert!(prompt.contains("find x"));
    }

    /// **Scenario**: an on-disk entry with no factory fails startup.
    #[test]
    fn missing_factory_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        write_local_tool(tmp.path(), "search_notes");
        let mut registry = ToolRegistry::new();
        assert!(matches!(
            registry.load_local_tools(tmp.path()).unwrap_err(),
            ToolRegistryError::MissingFactory { .. }
        ));
    }

    #[test]
    fn missing_template_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        write_local_tool(tmp.path(), "search_notes");
        std::fs::remove_file(
            tmp.path()
                .join("search_notes/prompts/search_notes_args.j2"),
        )
        .unwrap();
        let mut registry = ToolRegistry::new();
        registry.register_factory("search_notes", Arc::new(|| Box::new(StubTool)));
        assert!(matches!(
            registry.load_local_tools(tmp.path()).unwrap_err(),
            ToolRegistryError::MissingTemplate { .. }
        ));
    }

    fn mcp_fixture(tmp: &Path) -> BTreeMap<String, McpServerEntry> {
        let servers_dir = tmp.join("servers");
        std::fs::create_dir_all(&servers_dir).unwrap();
        std::fs::write(
            servers_dir.join("time.yaml"),
            concat!(
                "schema_version: 1\n",
                "server_id: io.test/time\n",
                "display_name: Time\n",
                "enabled: true\n",
                "launch_options:\n",
                "  - transport: stdio\n",
                "    command: uvx\n",
                "    args: [mcp-server-time]\n",
            ),
        )
        .unwrap();
        let cache_dir = tmp.join("tool_cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(
            cache_dir.join("io.test__time.json"),
            r#"{
                "schema_version": 1,
                "server_id": "io.test/time",
                "tools": [
                    {"name": "get_current_time",
                     "description": "Current time",
                     "inputSchema": {"type":"object","properties":{"timezone":{"type":"string"},"format":{"type":"string"}},"required":["timezone"]}}
                ]
            }"#,
        )
        .unwrap();
        let (servers, problems) = load_server_directory(tmp);
        assert!(problems.is_empty());
        servers
    }

    /// **Scenario**: MCP tools get namespaced names and nullable optionals
    /// from the cached input schema.
    #[test]
    fn mcp_tools_are_synthesized_namespaced_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let servers = mcp_fixture(tmp.path());
        let mut registry = ToolRegistry::new();
        let problems = registry.load_mcp_tools(tmp.path(), &servers);
        assert!(problems.is_empty());

        let entry = registry.get("mcp::io.test/time::get_current_time").unwrap();
        assert!(entry.is_mcp());
        let schema = entry.arguments_schema();
        assert!(is_closed(schema));
        let inner = &schema["properties"]["arguments"];
        // Required field stays plain; optional becomes nullable.
        assert_eq!(inner["properties"]["timezone"]["type"], serde_json::json!("string"));
        assert_eq!(
            inner["properties"]["format"]["type"],
            serde_json::json!(["string", "null"])
        );
    }

    #[test]
    fn disabled_server_contributes_no_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let mut servers = mcp_fixture(tmp.path());
        servers.get_mut("io.test/time").unwrap().enabled = false;
        let mut registry = ToolRegistry::new();
        registry.load_mcp_tools(tmp.path(), &servers);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn denylist_filters_mcp_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let mut servers = mcp_fixture(tmp.path());
        servers.get_mut("io.test/time").unwrap().tool_denylist =
            Some(vec!["get_current_time".into()]);
        let mut registry = ToolRegistry::new();
        registry.load_mcp_tools(tmp.path(), &servers);
        assert!(registry.get("mcp::io.test/time::get_current_time").is_none());
    }
}
