//! Task/job files: YAML frontmatter plus a markdown body.
//!
//! Planner-facing managers consume these; the runtime only enforces the
//! on-disk format and include resolution. An `includes` entry is either a
//! file path (relative to the task file) or a `resource:<key>` reference
//! resolved from the global blackboard.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::blackboard::Blackboard;
use crate::error::RuntimeError;

const FRONTMATTER_DELIMITER: &str = "---";
const RESOURCE_PREFIX: &str = "resource:";

#[derive(Debug, Clone, Deserialize)]
pub struct TaskFrontmatter {
    pub task_id: String,
    pub manager: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// One parsed task file.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub frontmatter: TaskFrontmatter,
    pub body: String,
    pub path: PathBuf,
}

/// Parses one task file. The frontmatter must be fenced by `---` lines at
/// the very top.
pub fn parse_task_file(path: &Path) -> Result<TaskSpec, RuntimeError> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some(FRONTMATTER_DELIMITER) {
        return Err(RuntimeError::ExecutionFailed(format!(
            "{}: task file must start with a '---' frontmatter fence",
            path.display()
        )));
    }
    let mut frontmatter_lines = Vec::new();
    let mut body_lines = Vec::new();
    let mut in_frontmatter = true;
    for line in lines {
        if in_frontmatter && line.trim() == FRONTMATTER_DELIMITER {
            in_frontmatter = false;
            continue;
        }
        if in_frontmatter {
            frontmatter_lines.push(line);
        } else {
            body_lines.push(line);
        }
    }
    if in_frontmatter {
        return Err(RuntimeError::ExecutionFailed(format!(
            "{}: unterminated frontmatter",
            path.display()
        )));
    }

    let frontmatter: TaskFrontmatter = serde_yaml::from_str(&frontmatter_lines.join("\n"))
        .map_err(|e| RuntimeError::ExecutionFailed(format!("{}: {e}", path.display())))?;

    Ok(TaskSpec {
        frontmatter,
        body: body_lines.join("\n").trim().to_string(),
        path: path.to_path_buf(),
    })
}

/// Discovers all `*.md` task files under a directory. Unparseable files are
/// reported, not fatal.
pub fn discover_tasks(dir: &Path) -> (Vec<TaskSpec>, Vec<String>) {
    let mut tasks = Vec::new();
    let mut problems = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return (tasks, problems);
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();
    for path in paths {
        match parse_task_file(&path) {
            Ok(task) => tasks.push(task),
            Err(e) => problems.push(e.to_string()),
        }
    }
    (tasks, problems)
}

/// Resolves `includes` to their contents: files relative to the task file,
/// `resource:<key>` from the global blackboard. Missing entries resolve to a
/// problem, not an error.
pub fn resolve_includes(task: &TaskSpec, blackboard: &Blackboard) -> (Vec<String>, Vec<String>) {
    let mut resolved = Vec::new();
    let mut problems = Vec::new();
    let base = task.path.parent().unwrap_or_else(|| Path::new("."));

    for include in &task.frontmatter.includes {
        if let Some(key) = include.strip_prefix(RESOURCE_PREFIX) {
            match blackboard.get_global_state_value(key) {
                Some(Value::String(text)) => resolved.push(text),
                Some(other) => resolved.push(other.to_string()),
                None => problems.push(format!("resource not found: {key}")),
            }
            continue;
        }
        let path = base.join(include);
        match std::fs::read_to_string(&path) {
            Ok(text) => resolved.push(text),
            Err(e) => problems.push(format!("{}: {e}", path.display())),
        }
    }
    (resolved, problems)
}
