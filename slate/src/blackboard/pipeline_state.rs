//! Typed accessors for pipeline-wide state stored in the global namespace.
//!
//! `pending_tool` is the handoff between argument generation and ToolCaller;
//! `last_tool_result_ref`/`last_tool_result_meta` let later prompts cite a
//! persisted artifact without inlining it; `flags` gate after-tool pipeline
//! rules; `scratch` is free-form rule context.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Blackboard;

const PENDING_TOOL_KEY: &str = "pipeline_pending_tool";
const LAST_RESULT_REF_KEY: &str = "pipeline_last_tool_result_ref";
const LAST_RESULT_META_KEY: &str = "pipeline_last_tool_result_meta";
const RESUME_TARGET_KEY: &str = "pipeline_resume_target";
const FLAGS_KEY: &str = "pipeline_flags";
const SCRATCH_KEY: &str = "pipeline_scratch";

/// What kind of target a pending call resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Tool,
    Agent,
    ControlNode,
}

/// The call staged for ToolCaller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_input: Option<Value>,
    pub calling_agent: String,
    pub kind: PendingKind,
}

/// Reference to a persisted tool-result artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_result_id: String,
    pub path: String,
}

/// Descriptive metadata for the most recent tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_agent: Option<String>,
}

pub fn set_pending_tool(bb: &Blackboard, pending: &PendingTool) {
    if let Ok(value) = serde_json::to_value(pending) {
        bb.update_global_state_value(PENDING_TOOL_KEY, value);
    }
}

pub fn pending_tool(bb: &Blackboard) -> Option<PendingTool> {
    bb.get_global_state_value(PENDING_TOOL_KEY)
        .and_then(|v| serde_json::from_value(v).ok())
}

pub fn clear_pending_tool(bb: &Blackboard) {
    bb.update_global_state_value(PENDING_TOOL_KEY, Value::Null);
}

pub fn set_last_tool_result_ref(
    bb: &Blackboard,
    artifact: Option<&ToolResultRef>,
    meta: &ToolResultMeta,
) {
    let ref_value = artifact
        .and_then(|r| serde_json::to_value(r).ok())
        .unwrap_or(Value::Null);
    bb.update_global_state_value(LAST_RESULT_REF_KEY, ref_value);
    if let Ok(meta_value) = serde_json::to_value(meta) {
        bb.update_global_state_value(LAST_RESULT_META_KEY, meta_value);
    }
}

pub fn last_tool_result_ref(bb: &Blackboard) -> Option<ToolResultRef> {
    bb.get_global_state_value(LAST_RESULT_REF_KEY)
        .and_then(|v| serde_json::from_value(v).ok())
}

pub fn last_tool_result_meta(bb: &Blackboard) -> Option<ToolResultMeta> {
    bb.get_global_state_value(LAST_RESULT_META_KEY)
        .and_then(|v| serde_json::from_value(v).ok())
}

pub fn set_resume_target(bb: &Blackboard, target: Option<&str>) {
    bb.update_global_state_value(
        RESUME_TARGET_KEY,
        target.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null),
    );
}

pub fn resume_target(bb: &Blackboard) -> Option<String> {
    bb.get_global_state_value(RESUME_TARGET_KEY)
        .and_then(|v| v.as_str().map(str::to_string))
}

pub fn set_flag(bb: &Blackboard, key: &str, value: Value) {
    let mut flags = bb
        .get_global_state_value(FLAGS_KEY)
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    flags.insert(key.to_string(), value);
    bb.update_global_state_value(FLAGS_KEY, Value::Object(flags));
}

pub fn flag(bb: &Blackboard, key: &str) -> Option<Value> {
    bb.get_global_state_value(FLAGS_KEY)
        .and_then(|v| v.as_object().and_then(|m| m.get(key).cloned()))
}

pub fn flag_bool(bb: &Blackboard, key: &str) -> bool {
    flag(bb, key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn set_scratch(bb: &Blackboard, key: &str, value: Value) {
    let mut scratch = bb
        .get_global_state_value(SCRATCH_KEY)
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    scratch.insert(key.to_string(), value);
    bb.update_global_state_value(SCRATCH_KEY, Value::Object(scratch));
}

pub fn scratch(bb: &Blackboard, key: &str) -> Option<Value> {
    bb.get_global_state_value(SCRATCH_KEY)
        .and_then(|v| v.as_object().and_then(|m| m.get(key).cloned()))
}
