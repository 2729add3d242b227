//! Runtime error types and the single fatal-abort channel.
//!
//! Recoverable failures (routing errors, tool failures, malformed LLM output)
//! travel as [`RuntimeError`] and are turned into blackboard error state or
//! `ToolResult` errors by their callers. Unrecoverable conditions (LLM quota
//! exhaustion, loader hard errors at startup) also travel as `RuntimeError`,
//! but the manager loop and the CLI funnel them through [`abort_process`] so
//! the process exits from exactly one place.

use thiserror::Error;

/// Agent/node execution error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// LLM structured output was not a JSON object.
    #[error("[{agent}] expected structured object from LLM, got: {got}")]
    MalformedLlmOutput { agent: String, got: String },

    /// A quota-exhaustion keyword was found in an LLM response or error text.
    /// Callers must treat this as fatal (see [`abort_process`]).
    #[error("LLM quota exhausted (matched {keyword:?}): {preview}")]
    QuotaExhausted { keyword: String, preview: String },

    /// An agent emitted `action == "error"`, which is reserved.
    #[error("[{0}] action \"error\" leaked into flow control")]
    ReservedErrorAction(String),

    /// Call-stack underflow: pop requested at root scope.
    #[error("call stack underflow: pop_call_context at root")]
    CallStackUnderflow,

    /// A pushed scope id collided with a live one.
    #[error("scope id already on the stack: {0}")]
    DuplicateScopeId(String),

    /// Prompt template rendering failed.
    #[error("[{agent}] prompt rendering failed: {message}")]
    PromptRender { agent: String, message: String },

    /// Dispatch target could not be resolved to a tool, agent, or control node.
    #[error("unknown dispatch target: {0}")]
    UnknownTarget(String),

    /// Node lookup failed in the manager's instance table.
    #[error("no instance for node: {0}")]
    NoInstance(String),

    /// Generic execution failure with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// True for errors that must terminate the whole process, not just the
    /// current manager.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::QuotaExhausted { .. })
    }
}

/// Logs the error at `error` level and exits the process with a non-zero
/// status. The only process-exit call site in the library.
pub fn abort_process(err: &RuntimeError) -> ! {
    tracing::error!(error = %err, "fatal runtime error, aborting process");
    std::process::exit(1);
}
