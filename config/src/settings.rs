//! Typed runtime settings resolved from `config.toml` tables and `SLATE_*`
//! environment variables.
//!
//! Precedence per field: environment variable > config file > built-in default.

use std::path::PathBuf;

use crate::toml_file::ConfigFile;

/// Raw, all-optional settings tables as they appear in `config.toml`.
#[derive(serde::Deserialize, Default)]
pub struct RawSettings {
    #[serde(default)]
    pub paths: RawPaths,
    #[serde(default)]
    pub mcp: RawMcp,
    #[serde(default)]
    pub manager: RawManager,
}

#[derive(serde::Deserialize, Default)]
pub struct RawPaths {
    pub agents_dir: Option<String>,
    pub tools_dir: Option<String>,
    pub mcp_dir: Option<String>,
    pub tasks_dir: Option<String>,
    pub uploads_dir: Option<String>,
    pub artifacts_dir: Option<String>,
}

#[derive(serde::Deserialize, Default)]
pub struct RawMcp {
    pub call_timeout_seconds: Option<u64>,
}

#[derive(serde::Deserialize, Default)]
pub struct RawManager {
    pub max_loops: Option<u32>,
}

/// On-disk roots used by the loader and the tool-result artifact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Agent directories (one folder per agent, `config.yaml` + prompts).
    pub agents_dir: PathBuf,
    /// Local tool directories (`tool.yaml` + prompt templates).
    pub tools_dir: PathBuf,
    /// MCP root: `servers/**/*.yaml` entries and `tool_cache/*.json`.
    pub mcp_dir: PathBuf,
    /// Task/job files (YAML frontmatter + markdown body).
    pub tasks_dir: PathBuf,
    /// Where MCP-produced images and other uploads land.
    pub uploads_dir: PathBuf,
    /// Where full tool-result payloads are persisted as JSON artifacts.
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpDefaults {
    /// Per-call timeout applied when a server entry does not override it.
    pub call_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerDefaults {
    /// Loop-count guard before a manager forces a graceful exit.
    pub max_loops: u32,
}

/// Fully resolved settings handed to the runtime at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub paths: Paths,
    pub mcp: McpDefaults,
    pub manager: ManagerDefaults,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn resolve_path(env_key: &str, file_value: Option<&String>, default: &str) -> PathBuf {
    env_path(env_key)
        .or_else(|| file_value.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(default))
}

impl Settings {
    pub(crate) fn resolve(file: ConfigFile) -> Self {
        let raw = file.settings;
        let paths = Paths {
            agents_dir: resolve_path("SLATE_AGENTS_DIR", raw.paths.agents_dir.as_ref(), "agents"),
            tools_dir: resolve_path("SLATE_TOOLS_DIR", raw.paths.tools_dir.as_ref(), "tools"),
            mcp_dir: resolve_path("SLATE_MCP_DIR", raw.paths.mcp_dir.as_ref(), "mcp"),
            tasks_dir: resolve_path("SLATE_TASKS_DIR", raw.paths.tasks_dir.as_ref(), "tasks"),
            uploads_dir: resolve_path(
                "SLATE_UPLOADS_DIR",
                raw.paths.uploads_dir.as_ref(),
                "uploads/temp",
            ),
            artifacts_dir: resolve_path(
                "SLATE_ARTIFACTS_DIR",
                raw.paths.artifacts_dir.as_ref(),
                "uploads/temp/tool_results",
            ),
        };
        let mcp = McpDefaults {
            call_timeout_seconds: std::env::var("SLATE_MCP_CALL_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(raw.mcp.call_timeout_seconds)
                .unwrap_or(20),
        };
        let manager = ManagerDefaults {
            max_loops: std::env::var("SLATE_MANAGER_MAX_LOOPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(raw.manager.max_loops)
                .unwrap_or(50),
        };
        Settings {
            paths,
            mcp,
            manager,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::resolve(ConfigFile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_configured() {
        // No SLATE_* vars are set in the test environment for these keys.
        let s = Settings::resolve(ConfigFile::default());
        assert_eq!(s.paths.agents_dir, PathBuf::from("agents"));
        assert_eq!(s.paths.artifacts_dir, PathBuf::from("uploads/temp/tool_results"));
        assert_eq!(s.mcp.call_timeout_seconds, 20);
        assert_eq!(s.manager.max_loops, 50);
    }

    #[test]
    fn env_overrides_file_value() {
        std::env::set_var("SLATE_MANAGER_MAX_LOOPS", "9");
        let mut file = ConfigFile::default();
        file.settings.manager.max_loops = Some(3);
        let s = Settings::resolve(file);
        std::env::remove_var("SLATE_MANAGER_MAX_LOOPS");
        assert_eq!(s.manager.max_loops, 9);
    }

    #[test]
    fn file_value_used_when_env_missing() {
        std::env::remove_var("SLATE_MCP_CALL_TIMEOUT_SECONDS");
        let mut file = ConfigFile::default();
        file.settings.mcp.call_timeout_seconds = Some(42);
        let s = Settings::resolve(file);
        assert_eq!(s.mcp.call_timeout_seconds, 42);
    }
}
