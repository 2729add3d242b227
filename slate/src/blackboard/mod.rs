//! Blackboard: scoped state store, append-only message log, and call stack.
//!
//! One blackboard backs one manager. State lives in a stack of scopes
//! (`root` at the bottom, one scope per in-flight agent call) plus a global
//! namespace shared process-wide signals (`exit`, `error`, pipeline state).
//! Lookups resolve current scope → ancestors → global. Messages are stamped
//! with the scope active at append time and never mutated afterwards.
//!
//! All operations go through a single lock per instance; each call observes a
//! consistent snapshot.

pub mod pipeline_state;

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::RuntimeError;
use crate::message::{DataType, Message};

/// Scope id of the bottom-of-stack scope.
pub const ROOT_SCOPE: &str = "root";

/// A record of one agent-to-agent call on the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub calling_agent: String,
    pub called_agent: String,
    pub scope_id: String,
}

#[derive(Debug)]
struct Scope {
    id: String,
    state: HashMap<String, Value>,
}

impl Scope {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: HashMap::new(),
        }
    }
}

struct Inner {
    /// Scope stack; index 0 is always `root`.
    scopes: Vec<Scope>,
    call_stack: Vec<CallContext>,
    global: HashMap<String, Value>,
    log: Vec<Message>,
    busy: HashMap<String, bool>,
}

/// Scoped state + message log + call stack for one manager.
pub struct Blackboard {
    inner: Mutex<Inner>,
    /// Message count (since the last plan) that triggers summarization.
    summarize_threshold: usize,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self::with_summarize_threshold(12)
    }

    pub fn with_summarize_threshold(summarize_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                scopes: vec![Scope::new(ROOT_SCOPE)],
                call_stack: Vec::new(),
                global: HashMap::new(),
                log: Vec::new(),
                busy: HashMap::new(),
            }),
            summarize_threshold,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // State operations
    // ------------------------------------------------------------------

    /// Lookup order: current scope → ancestor scopes → global → `None`.
    pub fn get_state_value(&self, key: &str) -> Option<Value> {
        let inner = self.lock();
        for scope in inner.scopes.iter().rev() {
            if let Some(v) = scope.state.get(key) {
                return Some(v.clone());
            }
        }
        inner.global.get(key).cloned()
    }

    /// Like [`Blackboard::get_state_value`] with a default.
    pub fn get_state_value_or(&self, key: &str, default: Value) -> Value {
        self.get_state_value(key).unwrap_or(default)
    }

    /// Convenience: read a boolean state flag, absent or non-bool ⇒ `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get_state_value(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Convenience: read a string value from state.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get_state_value(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Writes to the current (topmost) scope.
    pub fn update_state_value(&self, key: &str, value: Value) {
        let mut inner = self.lock();
        let scope = inner.scopes.last_mut().expect("root scope always present");
        scope.state.insert(key.to_string(), value);
    }

    /// Removes a key from the current scope (a `null` write is distinct:
    /// it shadows ancestor values, removal un-shadows them).
    pub fn clear_state_value(&self, key: &str) {
        let mut inner = self.lock();
        let scope = inner.scopes.last_mut().expect("root scope always present");
        scope.state.remove(key);
    }

    /// Appends to a list at the current scope, creating it if absent.
    pub fn append_state_value(&self, key: &str, value: Value) {
        let mut inner = self.lock();
        let scope = inner.scopes.last_mut().expect("root scope always present");
        let entry = scope
            .state
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value),
            other => {
                // Non-list value under this key: wrap it so appends keep history.
                let previous = other.take();
                *other = Value::Array(vec![previous, value]);
            }
        }
    }

    /// Reads from the global namespace only.
    pub fn get_global_state_value(&self, key: &str) -> Option<Value> {
        self.lock().global.get(key).cloned()
    }

    /// Writes to the global namespace.
    pub fn update_global_state_value(&self, key: &str, value: Value) {
        self.lock().global.insert(key.to_string(), value);
    }

    /// Global keys currently set, in sorted order.
    pub fn global_keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys: Vec<String> = inner.global.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Appends to a list at global scope, creating it if absent.
    pub fn append_global_state_value(&self, key: &str, value: Value) {
        let mut inner = self.lock();
        let entry = inner
            .global
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, value]);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scopes and call stack
    // ------------------------------------------------------------------

    pub fn get_current_scope_id(&self) -> String {
        self.lock()
            .scopes
            .last()
            .expect("root scope always present")
            .id
            .clone()
    }

    /// Creates a fresh scope and pushes the call context. Scope ids must be
    /// unique among live scopes.
    pub fn push_call_context(
        &self,
        calling_agent: &str,
        called_agent: &str,
        scope_id: &str,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        if inner.scopes.iter().any(|s| s.id == scope_id) {
            return Err(RuntimeError::DuplicateScopeId(scope_id.to_string()));
        }
        inner.scopes.push(Scope::new(scope_id));
        inner.call_stack.push(CallContext {
            calling_agent: calling_agent.to_string(),
            called_agent: called_agent.to_string(),
            scope_id: scope_id.to_string(),
        });
        Ok(())
    }

    /// Pops the top call context and removes its scope. Underflow at root is a
    /// programming error.
    pub fn pop_call_context(&self) -> Result<CallContext, RuntimeError> {
        let mut inner = self.lock();
        let ctx = inner
            .call_stack
            .pop()
            .ok_or(RuntimeError::CallStackUnderflow)?;
        // The popped context's scope is the current top; remove it but never
        // the root scope.
        if inner.scopes.len() > 1 {
            inner.scopes.pop();
        }
        Ok(ctx)
    }

    /// Peeks the top call context without popping.
    pub fn get_current_call_context(&self) -> Option<CallContext> {
        self.lock().call_stack.last().cloned()
    }

    pub fn call_stack_depth(&self) -> usize {
        self.lock().call_stack.len()
    }

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    /// Appends a message stamped with the current scope id; returns the
    /// stamped copy.
    pub fn add_msg(&self, mut msg: Message) -> Message {
        let mut inner = self.lock();
        let scope_id = inner
            .scopes
            .last()
            .expect("root scope always present")
            .id
            .clone();
        msg.scope_id = Some(scope_id);
        inner.log.push(msg.clone());
        msg
    }

    /// All messages tagged with the given scope, in append order.
    pub fn get_messages_for_scope(&self, scope_id: &str) -> Vec<Message> {
        self.lock()
            .log
            .iter()
            .filter(|m| m.scope_id.as_deref() == Some(scope_id))
            .cloned()
            .collect()
    }

    pub fn all_messages(&self) -> Vec<Message> {
        self.lock().log.clone()
    }

    pub fn message_count(&self) -> usize {
        self.lock().log.len()
    }

    // ------------------------------------------------------------------
    // Busy flags
    // ------------------------------------------------------------------

    pub fn set_agent_busy(&self, agent: &str, busy: bool) {
        self.lock().busy.insert(agent.to_string(), busy);
    }

    pub fn is_agent_busy(&self, agent: &str) -> bool {
        self.lock().busy.get(agent).copied().unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Summarization helpers
    // ------------------------------------------------------------------

    fn last_plan_index(log: &[Message]) -> Option<usize> {
        log.iter()
            .rposition(|m| m.data_type == Some(DataType::PlannerResult))
    }

    /// Messages appended before the most recent planner result. Empty when no
    /// plan exists yet.
    pub fn messages_before_last_plan(&self) -> Vec<Message> {
        let inner = self.lock();
        match Self::last_plan_index(&inner.log) {
            Some(idx) => inner.log[..idx].to_vec(),
            None => Vec::new(),
        }
    }

    /// Drops all messages that precede the most recent planner result.
    pub fn remove_messages_before_last_plan(&self) {
        let mut inner = self.lock();
        if let Some(idx) = Self::last_plan_index(&inner.log) {
            inner.log.drain(..idx);
        }
    }

    /// True once enough pre-plan messages accumulated to warrant a summary.
    pub fn time_to_summarize(&self) -> bool {
        let inner = self.lock();
        match Self::last_plan_index(&inner.log) {
            Some(idx) => idx >= self.summarize_threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_msg() -> Message {
        Message::new()
            .with_data_type(DataType::PlannerResult)
            .with_content("plan")
    }

    /// **Scenario**: lookups fall through current scope → parent → global.
    #[test]
    fn state_lookup_resolves_through_ancestors_and_global() {
        let bb = Blackboard::new();
        bb.update_global_state_value("g", json!("global"));
        bb.update_state_value("root_key", json!("root"));
        bb.push_call_context("a", "b", "scope_1").unwrap();
        bb.update_state_value("child_key", json!("child"));

        assert_eq!(bb.get_state_value("child_key"), Some(json!("child")));
        assert_eq!(bb.get_state_value("root_key"), Some(json!("root")));
        assert_eq!(bb.get_state_value("g"), Some(json!("global")));
        assert_eq!(bb.get_state_value("missing"), None);
    }

    /// **Scenario**: writes land in the current scope and disappear on pop.
    #[test]
    fn scope_writes_are_isolated() {
        let bb = Blackboard::new();
        bb.push_call_context("a", "b", "scope_1").unwrap();
        bb.update_state_value("x", json!(1));
        assert_eq!(bb.get_state_value("x"), Some(json!(1)));
        bb.pop_call_context().unwrap();
        assert_eq!(bb.get_state_value("x"), None);
    }

    /// **Scenario**: child scope shadows a parent value without mutating it.
    #[test]
    fn child_scope_shadows_parent_value() {
        let bb = Blackboard::new();
        bb.update_state_value("k", json!("parent"));
        bb.push_call_context("a", "b", "scope_1").unwrap();
        bb.update_state_value("k", json!("child"));
        assert_eq!(bb.get_state_value("k"), Some(json!("child")));
        bb.pop_call_context().unwrap();
        assert_eq!(bb.get_state_value("k"), Some(json!("parent")));
    }

    /// **Scenario**: appended messages are stamped with the scope active at
    /// append time.
    #[test]
    fn messages_are_stamped_with_current_scope() {
        let bb = Blackboard::new();
        let m1 = bb.add_msg(Message::new().with_content("at root"));
        assert_eq!(m1.scope_id.as_deref(), Some(ROOT_SCOPE));

        bb.push_call_context("a", "b", "scope_1").unwrap();
        let m2 = bb.add_msg(Message::new().with_content("in child"));
        assert_eq!(m2.scope_id.as_deref(), Some("scope_1"));

        assert_eq!(bb.get_messages_for_scope(ROOT_SCOPE).len(), 1);
        assert_eq!(bb.get_messages_for_scope("scope_1").len(), 1);
    }

    /// **Scenario**: call stack keeps LIFO discipline and underflow errors.
    #[test]
    fn call_stack_is_lifo_and_underflow_is_error() {
        let bb = Blackboard::new();
        bb.push_call_context("a", "b", "scope_1").unwrap();
        bb.push_call_context("b", "c", "scope_2").unwrap();
        assert_eq!(bb.call_stack_depth(), 2);

        let top = bb.pop_call_context().unwrap();
        assert_eq!(top.called_agent, "c");
        let next = bb.pop_call_context().unwrap();
        assert_eq!(next.called_agent, "b");
        assert!(matches!(
            bb.pop_call_context(),
            Err(RuntimeError::CallStackUnderflow)
        ));
    }

    #[test]
    fn duplicate_scope_id_is_rejected() {
        let bb = Blackboard::new();
        bb.push_call_context("a", "b", "scope_1").unwrap();
        assert!(matches!(
            bb.push_call_context("b", "c", "scope_1"),
            Err(RuntimeError::DuplicateScopeId(_))
        ));
    }

    /// **Scenario**: append_state_value creates the list on first use.
    #[test]
    fn append_creates_list_when_absent() {
        let bb = Blackboard::new();
        bb.append_state_value("items", json!(1));
        bb.append_state_value("items", json!(2));
        assert_eq!(bb.get_state_value("items"), Some(json!([1, 2])));

        bb.append_global_state_value("g_items", json!("a"));
        bb.append_global_state_value("g_items", json!("b"));
        assert_eq!(bb.get_global_state_value("g_items"), Some(json!(["a", "b"])));
    }

    #[test]
    fn busy_flags_default_false() {
        let bb = Blackboard::new();
        assert!(!bb.is_agent_busy("planner"));
        bb.set_agent_busy("planner", true);
        assert!(bb.is_agent_busy("planner"));
        bb.set_agent_busy("planner", false);
        assert!(!bb.is_agent_busy("planner"));
    }

    /// **Scenario**: summarization helpers slice the log around the last plan.
    #[test]
    fn summarization_helpers_use_last_plan_boundary() {
        let bb = Blackboard::with_summarize_threshold(2);
        bb.add_msg(Message::new().with_content("m1"));
        bb.add_msg(Message::new().with_content("m2"));
        assert!(!bb.time_to_summarize()); // no plan yet
        bb.add_msg(plan_msg());
        assert!(bb.time_to_summarize());
        assert_eq!(bb.messages_before_last_plan().len(), 2);

        bb.remove_messages_before_last_plan();
        assert!(bb.messages_before_last_plan().is_empty());
        // The plan message itself survives pruning.
        assert_eq!(bb.message_count(), 1);
    }

    #[test]
    fn clear_state_value_unshadows_parent() {
        let bb = Blackboard::new();
        bb.update_state_value("k", json!("parent"));
        bb.push_call_context("a", "b", "scope_1").unwrap();
        bb.update_state_value("k", json!("child"));
        bb.clear_state_value("k");
        assert_eq!(bb.get_state_value("k"), Some(json!("parent")));
    }
}
