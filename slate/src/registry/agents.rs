//! Agent registry: on-disk discovery of agent configs, prompts, and schemas,
//! plus explicit registration of the built-in control nodes.
//!
//! Each agent lives in its own directory under the agents root:
//!
//! ```text
//! agents/
//!   shared/
//!     tool_arguments/
//!       config.yaml
//!       prompts/
//!         system.j2
//!         user.j2
//!         description.j2      (optional)
//!       output_schema.json    (optional, preferred over config.yaml)
//!       input_schema.json     (optional)
//! ```
//!
//! Canonical names are the directory path joined with `::`
//! (`shared::tool_arguments`), unless `config.yaml` already carries a
//! namespaced name. A `.ignore` file skips the folder. Missing system/user
//! prompts and duplicate canonical names abort loading; the process must not
//! start on a broken agent inventory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::llm::LlmParams;
use crate::schema::close_schema;

/// Behavior names resolved by the manager when instantiating nodes. The
/// loader validates against this closed set instead of importing code at
/// runtime.
pub const STANDARD_BEHAVIOR: &str = "standard";
pub const TOOL_ARGUMENTS_BEHAVIOR: &str = "tool_arguments";
pub const DELEGATOR_BEHAVIOR: &str = "delegator";
pub const FINAL_ANSWER_BEHAVIOR: &str = "final_answer";
pub const SUMMARIZER_BEHAVIOR: &str = "summarizer";

const KNOWN_BEHAVIORS: &[&str] = &[
    STANDARD_BEHAVIOR,
    TOOL_ARGUMENTS_BEHAVIOR,
    DELEGATOR_BEHAVIOR,
    FINAL_ANSWER_BEHAVIOR,
    SUMMARIZER_BEHAVIOR,
];

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("agents directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("[{agent}] missing required prompt: {prompt}")]
    MissingPrompt { agent: String, prompt: &'static str },
    #[error("duplicate agent name {name} (first: {first}, second: {second})")]
    DuplicateAgent {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("[{agent}] unknown behavior {behavior:?} (expected one of {KNOWN_BEHAVIORS:?})")]
    UnknownBehavior { agent: String, behavior: String },
    #[error("{path}: yaml: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{path}: json: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: io: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// `all`, or an explicit list of names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(untagged)]
pub enum AllowList {
    #[default]
    #[serde(skip)]
    None,
    Keyword(AllowKeyword),
    Named(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowKeyword {
    All,
}

impl AllowList {
    pub fn is_all(&self) -> bool {
        matches!(self, AllowList::Keyword(AllowKeyword::All))
    }

    /// Resolves the allowed set against the full inventory, minus exclusions.
    pub fn resolve(&self, all: &[String], except: &[String]) -> Vec<String> {
        let candidates: Vec<String> = match self {
            AllowList::None => Vec::new(),
            AllowList::Keyword(AllowKeyword::All) => all.to_vec(),
            AllowList::Named(names) => names
                .iter()
                .filter(|n| all.contains(n))
                .cloned()
                .collect(),
        };
        candidates
            .into_iter()
            .filter(|n| !except.contains(n))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentPrompts {
    pub system: String,
    pub user: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Agent,
    ControlNode,
}

/// Immutable configuration of one agent or control node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub kind: NodeKind,
    pub behavior: String,
    pub prompts: AgentPrompts,
    /// Closed structured-output JSON schema presented to the LLM.
    pub structured_output: Option<Value>,
    /// Closed input schema; agents without one are called argument-free.
    pub input_schema: Option<Value>,
    pub allowed_nodes: AllowList,
    pub except_nodes: Vec<String>,
    pub allowed_tools: AllowList,
    pub except_tools: Vec<String>,
    pub system_context_items: Vec<String>,
    pub user_context_items: Vec<String>,
    /// Context key → RAG scopes queried with that key's value.
    pub rag_fields: BTreeMap<String, Vec<String>>,
    pub events: Vec<String>,
    pub llm_params: LlmParams,
    /// Output keys appended (as lists) instead of overwritten.
    pub append_fields: Vec<String>,
    /// Output keys written to global state instead of the current scope.
    pub global_output_keys: Vec<String>,
    /// Per-message character cap for result-focused history (final answer).
    pub history_char_cap: usize,
    /// Delegator-only: fall back to routing by LLM when the state map has no
    /// entry. Off by default; strict delegators hard-error instead.
    pub llm_fallback: bool,
    pub loaded_from: PathBuf,
}

impl AgentConfig {
    /// Minimal config for an explicitly registered control node.
    pub fn control_node(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::ControlNode,
            behavior: name.to_string(),
            prompts: AgentPrompts {
                system: String::new(),
                user: String::new(),
                description: Some(description.to_string()),
            },
            structured_output: None,
            input_schema: None,
            allowed_nodes: AllowList::None,
            except_nodes: Vec::new(),
            allowed_tools: AllowList::None,
            except_tools: Vec::new(),
            system_context_items: Vec::new(),
            user_context_items: Vec::new(),
            rag_fields: BTreeMap::new(),
            events: Vec::new(),
            llm_params: LlmParams::default(),
            append_fields: Vec::new(),
            global_output_keys: Vec::new(),
            history_char_cap: 2_000,
            llm_fallback: false,
            loaded_from: PathBuf::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAgentConfig {
    name: String,
    #[serde(default = "default_behavior")]
    behavior: String,
    #[serde(default)]
    structured_output: Option<Value>,
    #[serde(default)]
    allowed_nodes: AllowList,
    #[serde(default)]
    except_nodes: Vec<String>,
    #[serde(default)]
    allowed_tools: AllowList,
    #[serde(default)]
    except_tools: Vec<String>,
    #[serde(default)]
    system_context_items: Vec<String>,
    #[serde(default)]
    user_context_items: Vec<String>,
    #[serde(default)]
    rag_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    llm_params: Option<LlmParams>,
    #[serde(default)]
    append_fields: Vec<String>,
    #[serde(default)]
    global_output_keys: Vec<String>,
    #[serde(default = "default_history_cap")]
    history_char_cap: usize,
    #[serde(default)]
    llm_fallback: bool,
}

fn default_behavior() -> String {
    STANDARD_BEHAVIOR.to_string()
}

fn default_history_cap() -> usize {
    2_000
}

/// Shared, read-only registry of agent and control-node configs.
pub struct AgentRegistry {
    agents_dir: PathBuf,
    configs: BTreeMap<String, Arc<AgentConfig>>,
    loaded: bool,
}

impl AgentRegistry {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            configs: BTreeMap::new(),
            loaded: false,
        }
    }

    /// Loads all agent configs from disk and registers the built-in control
    /// nodes. Idempotent: a second call logs a warning and changes nothing.
    pub fn load(&mut self) -> Result<(), LoaderError> {
        if self.loaded {
            tracing::warn!(
                backtrace = %std::backtrace::Backtrace::capture(),
                "agent registry already loaded; ignoring reload"
            );
            return Ok(());
        }
        if !self.agents_dir.exists() {
            return Err(LoaderError::MissingRoot(self.agents_dir.clone()));
        }

        let mut dirs = Vec::new();
        collect_agent_dirs(&self.agents_dir, &mut dirs)?;
        dirs.sort();

        for dir in dirs {
            let config = self.load_agent_dir(&dir)?;
            let name = config.name.clone();
            if let Some(existing) = self.configs.get(&name) {
                return Err(LoaderError::DuplicateAgent {
                    name,
                    first: existing.loaded_from.clone(),
                    second: dir,
                });
            }
            tracing::info!(agent = %name, from = %dir.display(), "loaded agent config");
            self.configs.insert(name, Arc::new(config));
        }

        self.register_builtin_control_nodes();
        self.loaded = true;
        Ok(())
    }

    /// Shallow copy for parallel managers: configs are shared `Arc`s, and any
    /// per-manager instantiation state stays with the manager that made it.
    pub fn fork(&self) -> Self {
        Self {
            agents_dir: self.agents_dir.clone(),
            configs: self.configs.clone(),
            loaded: self.loaded,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.configs.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn list_agents(&self) -> Vec<String> {
        self.configs
            .values()
            .filter(|c| c.kind == NodeKind::Agent)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_control_node(&self, name: &str) -> bool {
        self.configs
            .get(name)
            .map(|c| c.kind == NodeKind::ControlNode)
            .unwrap_or(false)
    }

    /// Rendered description of an agent, used for `allowed_nodes` context.
    pub fn rendered_description(&self, name: &str) -> Option<String> {
        let config = self.configs.get(name)?;
        let raw = config.prompts.description.as_deref()?;
        let short_name = name.rsplit("::").next().unwrap_or(name);
        let ctx = serde_json::json!({
            "self_name": name,
            "self_short_name": short_name,
        });
        match crate::prompt::render(name, raw, &ctx) {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                tracing::warn!(agent = name, error = %e, "description render failed; using raw");
                Some(raw.to_string())
            }
        }
    }

    /// Registers a fully built config programmatically. Embedders use this
    /// for nodes that have no on-disk folder (custom control nodes, tests).
    pub fn register_config(&mut self, config: AgentConfig) {
        self.configs.insert(config.name.clone(), Arc::new(config));
    }

    /// Registers one control node config explicitly.
    pub fn register_control_node(&mut self, name: &str, description: &str) {
        self.configs.insert(
            name.to_string(),
            Arc::new(AgentConfig::control_node(name, description)),
        );
    }

    /// Registers the deterministic node set every manager can route to.
    /// Called by [`AgentRegistry::load`]; public for programmatic setups.
    pub fn register_builtin_control_nodes(&mut self) {
        for (name, description) in [
            ("tool_caller", "Executes the pending tool, agent, or control-node call."),
            ("tool_result_handler", "Routes tool and agent results back to their callers."),
            ("exit_node", "Pops one scope and returns control to the caller."),
            ("flow_exit_node", "Signals that the current flow finished."),
            ("graceful_exit_node", "Records partial findings and winds the manager down."),
            ("manager_exit_node", "Stops the manager loop."),
        ] {
            self.register_control_node(name, description);
        }
    }

    fn load_agent_dir(&self, dir: &Path) -> Result<AgentConfig, LoaderError> {
        let config_path = dir.join("config.yaml");
        let raw_text = std::fs::read_to_string(&config_path).map_err(|source| LoaderError::Io {
            path: config_path.clone(),
            source,
        })?;
        let raw: RawAgentConfig =
            serde_yaml::from_str(&raw_text).map_err(|source| LoaderError::Yaml {
                path: config_path,
                source,
            })?;

        let canonical = canonical_name(&self.agents_dir, dir, &raw.name);
        if !KNOWN_BEHAVIORS.contains(&raw.behavior.as_str()) {
            return Err(LoaderError::UnknownBehavior {
                agent: canonical,
                behavior: raw.behavior,
            });
        }

        let prompts_dir = dir.join("prompts");
        let system = read_prompt(&prompts_dir.join("system.j2")).ok_or_else(|| {
            LoaderError::MissingPrompt {
                agent: canonical.clone(),
                prompt: "prompts/system.j2",
            }
        })?;
        let user = read_prompt(&prompts_dir.join("user.j2")).ok_or_else(|| {
            LoaderError::MissingPrompt {
                agent: canonical.clone(),
                prompt: "prompts/user.j2",
            }
        })?;
        let description = read_prompt(&prompts_dir.join("description.j2"));

        // Schema file takes precedence over the inline config fallback.
        let schema_path = dir.join("output_schema.json");
        let structured_output = if schema_path.exists() {
            if raw.structured_output.is_some() {
                tracing::info!(
                    agent = %canonical,
                    "both output_schema.json and config structured_output present; preferring the file"
                );
            }
            Some(read_json_schema(&schema_path)?)
        } else {
            raw.structured_output
        }
        .map(|s| close_schema(&s));

        let input_path = dir.join("input_schema.json");
        let input_schema = if input_path.exists() {
            Some(close_schema(&read_json_schema(&input_path)?))
        } else {
            None
        };

        Ok(AgentConfig {
            name: canonical,
            kind: NodeKind::Agent,
            behavior: raw.behavior,
            prompts: AgentPrompts {
                system,
                user,
                description,
            },
            structured_output,
            input_schema,
            allowed_nodes: raw.allowed_nodes,
            except_nodes: raw.except_nodes,
            allowed_tools: raw.allowed_tools,
            except_tools: raw.except_tools,
            system_context_items: raw.system_context_items,
            user_context_items: raw.user_context_items,
            rag_fields: raw.rag_fields,
            events: raw.events,
            llm_params: raw.llm_params.unwrap_or_default(),
            append_fields: raw.append_fields,
            global_output_keys: raw.global_output_keys,
            history_char_cap: raw.history_char_cap,
            llm_fallback: raw.llm_fallback,
            loaded_from: dir.to_path_buf(),
        })
    }
}

fn collect_agent_dirs(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), LoaderError> {
    let entries = std::fs::read_dir(root).map_err(|source| LoaderError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.join(".ignore").exists() {
            tracing::info!(dir = %path.display(), "skipping agent folder marked .ignore");
            continue;
        }
        if path.join("config.yaml").exists() {
            out.push(path.clone());
        }
        collect_agent_dirs(&path, out)?;
    }
    Ok(())
}

fn canonical_name(root: &Path, dir: &Path, raw_name: &str) -> String {
    if raw_name.contains("::") {
        return raw_name.to_string();
    }
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let mut parts: Vec<String> = rel
        .parent()
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    if parts.is_empty() {
        raw_name.to_string()
    } else {
        parts.push(raw_name.to_string());
        parts.join("::")
    }
}

fn read_prompt(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn read_json_schema(path: &Path) -> Result<Value, LoaderError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoaderError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::is_closed;

    fn write_agent(
        root: &Path,
        rel: &str,
        name: &str,
        extra_yaml: &str,
        with_description: bool,
    ) {
        let dir = root.join(rel);
        std::fs::create_dir_all(dir.join("prompts")).unwrap();
        std::fs::write(
            dir.join("config.yaml"),
            format!("name: {name}\n{extra_yaml}"),
        )
        .unwrap();
        std::fs::write(dir.join("prompts/system.j2"), "You are {{ self_name }}.").unwrap();
        std::fs::write(dir.join("prompts/user.j2"), "Task: {{ task }}").unwrap();
        if with_description {
            std::fs::write(dir.join("prompts/description.j2"), "{{ self_short_name }} helps.")
                .unwrap();
        }
    }

    /// **Scenario**: directory path becomes the namespace in canonical names.
    #[test]
    fn canonical_names_come_from_directory_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "shared/tool_arguments", "tool_arguments", "behavior: tool_arguments\n", false);
        write_agent(tmp.path(), "planner", "planner", "", true);

        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();

        assert!(registry.get("shared::tool_arguments").is_some());
        assert!(registry.get("planner").is_some());
        assert_eq!(
            registry.get("shared::tool_arguments").unwrap().behavior,
            TOOL_ARGUMENTS_BEHAVIOR
        );
    }

    /// **Scenario**: a `.ignore` marker skips the folder entirely.
    #[test]
    fn ignore_marker_skips_folder() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "kept", "kept", "", false);
        write_agent(tmp.path(), "dropped", "dropped", "", false);
        std::fs::write(tmp.path().join("dropped/.ignore"), "").unwrap();

        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();
        assert!(registry.get("kept").is_some());
        assert!(registry.get("dropped").is_none());
    }

    /// **Scenario**: missing system prompt aborts loading.
    #[test]
    fn missing_system_prompt_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "broken", "broken", "", false);
        std::fs::remove_file(tmp.path().join("broken/prompts/system.j2")).unwrap();

        let mut registry = AgentRegistry::new(tmp.path());
        let err = registry.load().unwrap_err();
        assert!(matches!(err, LoaderError::MissingPrompt { .. }));
    }

    /// **Scenario**: two folders resolving to the same canonical name fail.
    #[test]
    fn duplicate_canonical_name_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "a/dup", "ns::dup", "", false);
        write_agent(tmp.path(), "b/dup", "ns::dup", "", false);

        let mut registry = AgentRegistry::new(tmp.path());
        assert!(matches!(
            registry.load().unwrap_err(),
            LoaderError::DuplicateAgent { .. }
        ));
    }

    /// **Scenario**: reloading is a warning no-op; fork shares configs.
    #[test]
    fn load_is_idempotent_and_fork_shares_configs() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "planner", "planner", "", false);

        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();
        let before = registry.list();
        registry.load().unwrap();
        assert_eq!(registry.list(), before);

        let fork = registry.fork();
        assert_eq!(fork.list(), before);
    }

    /// **Scenario**: schema file wins over inline config and comes out closed.
    #[test]
    fn output_schema_file_is_preferred_and_closed() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(
            tmp.path(),
            "planner",
            "planner",
            "structured_output:\n  type: object\n  properties:\n    ignored: {type: string}\n",
            false,
        );
        std::fs::write(
            tmp.path().join("planner/output_schema.json"),
            r#"{"type":"object","properties":{"action":{"type":"string"},"note":{"type":"string"}},"required":["action"]}"#,
        )
        .unwrap();

        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();
        let config = registry.get("planner").unwrap();
        let schema = config.structured_output.as_ref().unwrap();
        assert!(is_closed(schema));
        assert!(schema["properties"].get("action").is_some());
        assert!(schema["properties"].get("ignored").is_none());
    }

    #[test]
    fn unknown_behavior_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "odd", "odd", "behavior: mystery\n", false);
        let mut registry = AgentRegistry::new(tmp.path());
        assert!(matches!(
            registry.load().unwrap_err(),
            LoaderError::UnknownBehavior { .. }
        ));
    }

    #[test]
    fn builtin_control_nodes_are_registered() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "planner", "planner", "", false);
        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();
        assert!(registry.is_control_node("tool_caller"));
        assert!(registry.is_control_node("tool_result_handler"));
        assert!(!registry.is_control_node("planner"));
        // Control nodes are excluded from the agent listing.
        assert!(!registry.list_agents().contains(&"tool_caller".to_string()));
    }

    #[test]
    fn allow_list_resolution() {
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let allow: AllowList = serde_yaml::from_str("all").unwrap();
        assert_eq!(allow.resolve(&all, &["b".to_string()]), vec!["a", "c"]);
        let named: AllowList = serde_yaml::from_str("[a, z]").unwrap();
        assert_eq!(named.resolve(&all, &[]), vec!["a"]);
        assert!(AllowList::None.resolve(&all, &[]).is_empty());
    }

    #[test]
    fn rendered_description_uses_short_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "ns/helper", "helper", "", true);
        let mut registry = AgentRegistry::new(tmp.path());
        registry.load().unwrap();
        let desc = registry.rendered_description("ns::helper").unwrap();
        assert_eq!(desc, "helper helps.");
    }
}
