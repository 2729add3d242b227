//! Tool-result artifact store.
//!
//! Full tool-result payloads (which can carry sanitized MCP responses and
//! attachment lists) are written to disk as `tool_result_<uuid>.json` so that
//! later prompts can reference them by id instead of inlining them. The
//! message that records the result carries the reference in its metadata.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::blackboard::pipeline_state::ToolResultRef;
use crate::error::RuntimeError;
use crate::tools::ToolResult;

/// On-disk shape of one persisted artifact.
#[derive(Debug, Serialize, Deserialize)]
pub struct ToolResultArtifact {
    pub tool_result_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub tool_result: ToolResult,
}

/// Write-mostly directory of tool-result artifacts. UUID names make
/// collisions a non-issue; there is no locking beyond the filesystem's.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists the full payload and returns a small reference. Persistence
    /// failures are reported as `None` by the caller-facing wrapper in the
    /// result handler; this method surfaces the underlying error.
    pub fn persist(
        &self,
        tool_result: &ToolResult,
        calling_agent: Option<&str>,
        scope_id: Option<&str>,
    ) -> Result<ToolResultRef, RuntimeError> {
        std::fs::create_dir_all(&self.dir)?;
        let tool_result_id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.dir.join(format!("tool_result_{tool_result_id}.json"));

        let artifact = ToolResultArtifact {
            tool_result_id: tool_result_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            calling_agent: calling_agent.map(str::to_string),
            scope_id: scope_id.map(str::to_string),
            tool_result: tool_result.clone(),
        };
        let json = serde_json::to_string_pretty(&artifact)?;
        std::fs::write(&path, json)?;

        Ok(ToolResultRef {
            tool_result_id,
            path: path.to_string_lossy().into_owned(),
        })
    }

    /// Reads an artifact back by id.
    pub fn load(&self, tool_result_id: &str) -> Result<ToolResultArtifact, RuntimeError> {
        let path = self.dir.join(format!("tool_result_{tool_result_id}.json"));
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
