//! MCP session layer: stdio JSON-RPC client, per-call and stateful sessions,
//! response content handling and sanitization.
//!
//! Transport is line-delimited JSON-RPC 2.0 over a child process's stdio.
//! The client is synchronous (reader threads + bounded waits); async callers
//! wrap calls in `spawn_blocking`.

mod content;
mod session;
mod stdio;

pub use content::{
    content_max_chars, format_call_response, sanitize_call_response, Attachment, CallContent,
    DEFAULT_MAX_TEXT_CHARS, STDERR_KEY,
};
pub use session::{call_tool, close_all_sessions, close_session, select_launch_option, SessionState};
pub use stdio::{McpError, StdioJsonRpcClient};
