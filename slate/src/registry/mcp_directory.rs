//! MCP server directory: curated server entries under `mcp/servers/**/*.yaml`.
//!
//! Loading reads metadata only; no server process is spawned here. Entries
//! failing validation are skipped with a warning so one malformed file never
//! blocks startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// `<namespace>/<name>`, e.g. `io.modelcontextprotocol/time` or `npm/playwright-mcp`.
static SERVER_ID_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(\.[a-z0-9-]+)*/[a-zA-Z0-9._-]+$").expect("static regex"));

/// One ordered way to launch a server over stdio.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchOption {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

fn default_transport() -> String {
    "stdio".to_string()
}

/// Whether calls spawn a fresh process or reuse one long-lived session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    PerCall,
    Stateful,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpPolicy {
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    #[serde(default)]
    pub session_mode: SessionMode,
    /// Tool names whose completion tears down a stateful session.
    #[serde(default = "default_teardown_tools")]
    pub teardown_tools: Vec<String>,
}

fn default_call_timeout() -> u64 {
    20
}

fn default_teardown_tools() -> Vec<String> {
    vec!["browser_close".to_string()]
}

impl Default for McpPolicy {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout(),
            session_mode: SessionMode::PerCall,
            teardown_tools: default_teardown_tools(),
        }
    }
}

/// One curated MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerEntry {
    pub schema_version: u32,
    pub server_id: String,
    pub display_name: String,
    #[serde(default)]
    pub source: Option<String>,
    pub enabled: bool,
    pub launch_options: Vec<LaunchOption>,
    #[serde(default)]
    pub policy: McpPolicy,
    #[serde(default)]
    pub tool_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub tool_denylist: Option<Vec<String>>,
}

impl McpServerEntry {
    fn validate(&self) -> Result<(), String> {
        if self.schema_version < 1 {
            return Err("schema_version must be >= 1".into());
        }
        if !SERVER_ID_SHAPE.is_match(&self.server_id) {
            return Err(format!(
                "server_id must look like '<namespace>/<name>', got {:?}",
                self.server_id
            ));
        }
        if self.display_name.trim().is_empty() {
            return Err("display_name must be a non-empty string".into());
        }
        if self.launch_options.is_empty() {
            return Err("launch_options must be a non-empty list".into());
        }
        Ok(())
    }

    /// Applies allow/denylist filtering to a tool name.
    pub fn tool_permitted(&self, tool_name: &str) -> bool {
        if let Some(allow) = &self.tool_allowlist {
            if !allow.iter().any(|t| t == tool_name) {
                return false;
            }
        }
        if let Some(deny) = &self.tool_denylist {
            if deny.iter().any(|t| t == tool_name) {
                return false;
            }
        }
        true
    }
}

/// Loads all server entries under `<mcp_dir>/servers`. Returns the valid
/// entries keyed by `server_id` and a list of per-file problems.
pub fn load_server_directory(mcp_dir: &Path) -> (BTreeMap<String, McpServerEntry>, Vec<String>) {
    let servers_dir = mcp_dir.join("servers");
    let mut entries = BTreeMap::new();
    let mut problems = Vec::new();

    if !servers_dir.exists() {
        tracing::info!(dir = %servers_dir.display(), "MCP servers directory not found; skipping");
        return (entries, problems);
    }

    let mut files = Vec::new();
    collect_yaml_files(&servers_dir, &mut files);
    files.sort();

    for path in files {
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                problems.push(format!("{}: read error: {e}", path.display()));
                continue;
            }
        };
        let entry: McpServerEntry = match serde_yaml::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                problems.push(format!("{}: yaml: {e}", path.display()));
                continue;
            }
        };
        if let Err(reason) = entry.validate() {
            problems.push(format!("{}: {reason}", path.display()));
            continue;
        }
        if entries.contains_key(&entry.server_id) {
            problems.push(format!(
                "{}: duplicate server_id {:?}",
                path.display(),
                entry.server_id
            ));
            continue;
        }
        entries.insert(entry.server_id.clone(), entry);
    }

    for problem in &problems {
        tracing::warn!(%problem, "MCP directory issue");
    }
    tracing::info!(count = entries.len(), "loaded MCP server entries");
    (entries, problems)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}
