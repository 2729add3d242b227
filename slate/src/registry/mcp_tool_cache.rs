//! Cached MCP `tools/list` payloads on disk.
//!
//! The loader never talks to a server at startup; tool inventories come from
//! `mcp/tool_cache/<sanitized_server_id>.json` files written by a separate
//! refresh step. Cache format (`schema_version: 1`):
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "server_id": "io.modelcontextprotocol/time",
//!   "retrieved_at": "2026-07-02T10:00:00Z",
//!   "tools": [{ "name": "...", "description": "...", "inputSchema": {...} }]
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

/// One tool from a cached `tools/list` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCacheEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CacheFile {
    schema_version: u32,
    server_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    retrieved_at: Option<String>,
    #[serde(default)]
    tools: Vec<ToolCacheEntry>,
}

/// Stable, filesystem-safe mapping from a server id to a cache filename stem.
pub fn sanitize_server_id(server_id: &str) -> String {
    server_id
        .replace('\\', "_")
        .replace('/', "__")
        .replace(':', "_")
        .replace(' ', "_")
}

pub fn cache_path(mcp_dir: &Path, server_id: &str) -> PathBuf {
    mcp_dir
        .join("tool_cache")
        .join(format!("{}.json", sanitize_server_id(server_id)))
}

/// Loads the cached tool list for a server. A missing cache file yields an
/// empty list; parse or consistency problems yield the problems alongside
/// whatever could still be used.
pub fn load_tool_cache(mcp_dir: &Path, server_id: &str) -> (Vec<ToolCacheEntry>, Vec<String>) {
    let path = cache_path(mcp_dir, server_id);
    let mut problems = Vec::new();

    if !path.exists() {
        return (Vec::new(), problems);
    }

    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            problems.push(format!("{}: read error: {e}", path.display()));
            return (Vec::new(), problems);
        }
    };
    let file: CacheFile = match serde_json::from_str(&text) {
        Ok(f) => f,
        Err(e) => {
            problems.push(format!("{}: json: {e}", path.display()));
            return (Vec::new(), problems);
        }
    };

    if file.schema_version != 1 {
        problems.push(format!(
            "{}: unsupported schema_version {} (expected 1)",
            path.display(),
            file.schema_version
        ));
    }
    if file.server_id != server_id {
        problems.push(format!(
            "{}: server_id mismatch: cache has {:?}, expected {:?}",
            path.display(),
            file.server_id,
            server_id
        ));
    }

    let tools = file
        .tools
        .into_iter()
        .filter(|t| !t.name.trim().is_empty())
        .collect();
    (tools, problems)
}
