//! After-tool pipeline: declarative rules evaluated when a tool result lands.
//!
//! A manager may carry a `tool_pipeline` — an ordered rule list. After each
//! tool result, the first matching rule fires and diverts control to a
//! control node or a follow-up tool call instead of returning to the calling
//! agent. This is how deterministic "action + observe" sequences run without
//! an extra LLM turn.
//!
//! Condition handlers are pure functions resolved from an explicit registry
//! populated at startup; a rule naming an unregistered handler never fires.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blackboard::pipeline_state;
use crate::blackboard::Blackboard;

/// When a rule applies. Only post-result evaluation exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleWhen {
    #[default]
    After,
}

/// Declarative action taken when a rule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    ControlNode {
        node: String,
        #[serde(default)]
        set_flags: Map<String, Value>,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        arguments: Map<String, Value>,
        #[serde(default)]
        set_flags: Map<String, Value>,
    },
}

/// One pipeline rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRule {
    #[serde(default)]
    pub when: RuleWhen,
    /// Glob patterns of tool names that trigger the rule.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub unless_tools: Vec<String>,
    /// Pipeline-state flag: when already set, the rule is skipped.
    #[serde(default)]
    pub guard_key: Option<String>,
    /// Name of a registered condition handler gating the rule.
    #[serde(default)]
    pub condition_handler: Option<String>,
    pub action: RuleAction,
}

/// Pure gate: `(raw_tool_content, blackboard) → substitution context`, or
/// `None` to skip the rule.
pub type ConditionHandler =
    Arc<dyn Fn(&str, &Blackboard) -> Option<Map<String, Value>> + Send + Sync>;

/// Explicit handler registry; replaces runtime imports.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, ConditionHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: ConditionHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&ConditionHandler> {
        self.handlers.get(name)
    }
}

/// The action a fired rule resolved to, with `$name` substitutions applied.
#[derive(Debug, Clone)]
pub enum FiredAction {
    ControlNode { node: String },
    ToolCall {
        tool: String,
        arguments: Map<String, Value>,
    },
}

/// Result of pipeline evaluation: the action plus the state writes the
/// handler must perform before transferring control.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub action: FiredAction,
    pub set_flags: Map<String, Value>,
    pub guard_key: Option<String>,
}

fn tool_matches(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            false
        } else if pattern.contains('*') {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        } else {
            pattern == name
        }
    })
}

/// `$name` strings resolve from the substitution context; everything else
/// passes through. Lists and maps are walked recursively.
fn substitute(value: &Value, ctx: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) if s.starts_with('$') => {
            ctx.get(&s[1..]).cloned().unwrap_or_else(|| value.clone())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_map(map: &Map<String, Value>, ctx: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute(v, ctx)))
        .collect()
}

/// Evaluates rules in declared order against a finished tool call; the first
/// rule whose tool patterns, guard, and condition handler all pass wins.
/// Deterministic: same tool, content, and flags ⇒ same outcome.
pub fn evaluate(
    rules: &[PipelineRule],
    selected_tool: Option<&str>,
    calling_agent: Option<&str>,
    raw_content: &str,
    blackboard: &Blackboard,
    handlers: &HandlerRegistry,
) -> Option<RuleOutcome> {
    let tool_name = selected_tool?;

    for rule in rules {
        if rule.when != RuleWhen::After {
            continue;
        }
        if !tool_matches(tool_name, &rule.tools) {
            continue;
        }
        if tool_matches(tool_name, &rule.unless_tools) {
            continue;
        }
        if let Some(guard) = rule.guard_key.as_deref() {
            if pipeline_state::flag_bool(blackboard, guard) {
                continue;
            }
        }

        let mut ctx = Map::new();
        ctx.insert("selected_tool".into(), Value::String(tool_name.to_string()));
        if let Some(agent) = calling_agent {
            ctx.insert("calling_agent".into(), Value::String(agent.to_string()));
        }
        if let Some(handler_name) = rule.condition_handler.as_deref() {
            let Some(handler) = handlers.get(handler_name) else {
                tracing::warn!(handler = handler_name, "pipeline rule names unregistered handler; skipping");
                continue;
            };
            match handler(raw_content, blackboard) {
                Some(handler_ctx) => ctx.extend(handler_ctx),
                None => continue,
            }
        }

        let outcome = match &rule.action {
            RuleAction::ControlNode { node, set_flags } => RuleOutcome {
                action: FiredAction::ControlNode { node: node.clone() },
                set_flags: substitute_map(set_flags, &ctx),
                guard_key: rule.guard_key.clone(),
            },
            RuleAction::ToolCall {
                tool,
                arguments,
                set_flags,
            } => RuleOutcome {
                action: FiredAction::ToolCall {
                    tool: tool.clone(),
                    arguments: substitute_map(arguments, &ctx),
                },
                set_flags: substitute_map(set_flags, &ctx),
                guard_key: rule.guard_key.clone(),
            },
        };
        return Some(outcome);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn click_rule() -> PipelineRule {
        serde_yaml::from_str(
            r#"
when: after
tools: ["*browser_click"]
guard_key: auto_scan_in_progress
action:
  kind: control_node
  node: post_action_scan_node
  set_flags:
    auto_scan_in_progress: true
"#,
        )
        .unwrap()
    }

    /// **Scenario**: a click tool triggers the scan node rule.
    #[test]
    fn glob_pattern_fires_control_node_action() {
        let bb = Blackboard::new();
        let rules = vec![click_rule()];
        let outcome = evaluate(
            &rules,
            Some("mcp::npm/playwright-mcp::browser_click"),
            Some("planner"),
            "clicked",
            &bb,
            &HandlerRegistry::new(),
        )
        .expect("rule fires");
        match outcome.action {
            FiredAction::ControlNode { ref node } => assert_eq!(node, "post_action_scan_node"),
            _ => panic!("expected control node action"),
        }
        assert_eq!(outcome.set_flags["auto_scan_in_progress"], json!(true));
    }

    /// **Scenario**: a set guard flag suppresses the rule.
    #[test]
    fn guard_flag_suppresses_rule() {
        let bb = Blackboard::new();
        pipeline_state::set_flag(&bb, "auto_scan_in_progress", json!(true));
        let outcome = evaluate(
            &[click_rule()],
            Some("browser_click"),
            None,
            "",
            &bb,
            &HandlerRegistry::new(),
        );
        assert!(outcome.is_none());
    }

    #[test]
    fn unless_tools_excludes_matches() {
        let mut rule = click_rule();
        rule.unless_tools = vec!["*playwright*".into()];
        let bb = Blackboard::new();
        assert!(evaluate(
            &[rule],
            Some("mcp::npm/playwright-mcp::browser_click"),
            None,
            "",
            &bb,
            &HandlerRegistry::new(),
        )
        .is_none());
    }

    /// **Scenario**: condition handler gates the rule and feeds `$name`
    /// substitutions into tool-call arguments.
    #[test]
    fn condition_handler_provides_substitutions() {
        let rule: PipelineRule = serde_yaml::from_str(
            r#"
tools: ["browser_click"]
condition_handler: new_tab_opened
action:
  kind: tool_call
  tool: browser_tab_select
  arguments:
    index: $new_tab_index
"#,
        )
        .unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "new_tab_opened",
            Arc::new(|content, _bb| {
                content.contains("Open tabs").then(|| {
                    let mut ctx = Map::new();
                    ctx.insert("new_tab_index".into(), json!(2));
                    ctx
                })
            }),
        );

        let bb = Blackboard::new();
        // Gate closed: handler returns None.
        assert!(evaluate(&[rule.clone()], Some("browser_click"), None, "no tabs", &bb, &handlers).is_none());

        // Gate open: arguments substituted from handler context.
        let outcome = evaluate(
            &[rule],
            Some("browser_click"),
            None,
            "### Open tabs\n- 2: [x](https://x)",
            &bb,
            &handlers,
        )
        .expect("fires");
        match outcome.action {
            FiredAction::ToolCall { ref tool, ref arguments } => {
                assert_eq!(tool, "browser_tab_select");
                assert_eq!(arguments["index"], json!(2));
            }
            _ => panic!("expected tool call"),
        }
    }

    /// **Scenario**: declared order decides when several rules match.
    #[test]
    fn first_matching_rule_wins() {
        let first: PipelineRule = serde_yaml::from_str(
            "tools: [\"t\"]\naction: {kind: control_node, node: first_node}",
        )
        .unwrap();
        let second: PipelineRule = serde_yaml::from_str(
            "tools: [\"t\"]\naction: {kind: control_node, node: second_node}",
        )
        .unwrap();
        let bb = Blackboard::new();
        let outcome = evaluate(
            &[first, second],
            Some("t"),
            None,
            "",
            &bb,
            &HandlerRegistry::new(),
        )
        .unwrap();
        assert!(matches!(
            outcome.action,
            FiredAction::ControlNode { ref node } if node == "first_node"
        ));
    }

    #[test]
    fn unregistered_handler_skips_rule() {
        let rule: PipelineRule = serde_yaml::from_str(
            "tools: [\"t\"]\ncondition_handler: ghost\naction: {kind: control_node, node: n}",
        )
        .unwrap();
        let bb = Blackboard::new();
        assert!(evaluate(&[rule], Some("t"), None, "", &bb, &HandlerRegistry::new()).is_none());
    }
}
