//! MCP session supervision: launch-option selection, per-call vs stateful
//! sessions, and restart-on-failure recovery.
//!
//! Per-call servers are spawned for a single `tools/call` and terminated.
//! Stateful servers (declared via `policy.session_mode: stateful`) keep one
//! long-lived process per `server_id` in a process-global table with at most
//! one request in flight; a known launch-failure pattern closes the session,
//! deletes the stale temp user-data directory if one can be parsed from the
//! error text, and retries once. Callers run all of this through
//! `spawn_blocking`; nothing here is async.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::content::STDERR_KEY;
use super::stdio::{McpError, StdioJsonRpcClient};
use crate::registry::{LaunchOption, McpServerEntry, SessionMode};

/// Supervisor state of a stateful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawning,
    Ready,
    InCall,
    Failed,
    Closing,
}

struct StatefulSession {
    server_id: String,
    client: StdioJsonRpcClient,
    state: Mutex<SessionState>,
    /// Serializes requests: at most one in flight per session.
    call_guard: Mutex<()>,
}

static SESSIONS: Lazy<Mutex<HashMap<String, Arc<StatefulSession>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static USER_DATA_DIR_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"--user-data-dir="([^"]+)""#).expect("static regex"));
static USER_DATA_DIR_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--user-data-dir=(\S+)").expect("static regex"));

/// Picks the first usable stdio launch option, probing each candidate:
/// python `-m` launchers must import their module, docker launchers need a
/// responsive daemon, and anything else must exist on PATH (or at its given
/// path).
pub fn select_launch_option(entry: &McpServerEntry) -> Result<LaunchOption, McpError> {
    let mut failures: Vec<String> = Vec::new();

    for option in &entry.launch_options {
        if option.transport != "stdio" {
            continue;
        }
        let command = option.command.trim();
        if command.is_empty() {
            failures.push(format!("{:?}: missing command", option.id));
            continue;
        }

        if command.contains(std::path::MAIN_SEPARATOR) {
            if !std::path::Path::new(command).exists() {
                failures.push(format!("{:?}: path {command:?} not found", option.id));
                continue;
            }
        } else if which::which(command).is_err() {
            failures.push(format!("{:?}: {command:?} not found on PATH", option.id));
            continue;
        }

        if command == "docker" {
            if let Err(reason) = probe_ok(command, &["info".to_string()]) {
                failures.push(format!("{:?}: docker daemon not ready ({reason})", option.id));
                continue;
            }
        }

        if matches!(command, "python" | "python3") {
            if let [flag, module, ..] = option.args.as_slice() {
                if flag == "-m" {
                    let import = format!("import {module}");
                    if let Err(reason) =
                        probe_ok(command, &["-c".to_string(), import])
                    {
                        failures.push(format!(
                            "{:?}: python module {module:?} not available ({reason})",
                            option.id
                        ));
                        continue;
                    }
                }
            }
        }

        return Ok(option.clone());
    }

    Err(McpError::NoLaunchOption(if failures.is_empty() {
        "no stdio launch options defined".to_string()
    } else {
        failures.join("; ")
    }))
}

/// Runs a short probe command, bounded at two seconds.
fn probe_ok(command: &str, args: &[String]) -> Result<(), String> {
    let mut child = std::process::Command::new(command)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| format!("probe spawn failed: {e}"))?;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => return Err(format!("probe exited with {status}")),
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err("probe timed out".to_string());
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("probe wait failed: {e}")),
        }
    }
}

fn spawn_server(entry: &McpServerEntry) -> Result<StdioJsonRpcClient, McpError> {
    let option = select_launch_option(entry)?;
    let cwd = option
        .cwd
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let env: HashMap<String, String> = option.env.clone().into_iter().collect();

    tracing::debug!(
        server = %entry.server_id,
        command = %option.command,
        args = ?option.args,
        cwd = %cwd.display(),
        "spawning MCP stdio server"
    );
    let client = StdioJsonRpcClient::spawn(&option.command, &option.args, &env, &cwd)?;

    // Best-effort initialize: servers that reject it still answer tools/call.
    let init = client.request(
        "initialize",
        Some(json!({
            "protocolVersion": "2025-11-25",
            "capabilities": {},
            "clientInfo": { "name": "slate", "version": env!("CARGO_PKG_VERSION") },
        })),
        call_timeout(entry),
    );
    match init {
        Ok(resp) if resp.get("error").is_some() => {
            tracing::debug!(server = %entry.server_id, "MCP initialize rejected (continuing)");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(server = %entry.server_id, error = %e, "MCP initialize skipped/failed (continuing)");
        }
    }
    Ok(client)
}

fn call_timeout(entry: &McpServerEntry) -> Duration {
    Duration::from_secs(entry.policy.call_timeout_seconds.max(1))
}

fn get_or_start_session(entry: &McpServerEntry) -> Result<Arc<StatefulSession>, McpError> {
    let mut sessions = SESSIONS.lock().unwrap();
    if let Some(session) = sessions.get(&entry.server_id) {
        if session.client.is_alive() {
            return Ok(Arc::clone(session));
        }
        sessions.remove(&entry.server_id);
    }
    let session = Arc::new(StatefulSession {
        server_id: entry.server_id.clone(),
        client: spawn_server(entry)?,
        state: Mutex::new(SessionState::Ready),
        call_guard: Mutex::new(()),
    });
    sessions.insert(entry.server_id.clone(), Arc::clone(&session));
    Ok(session)
}

/// Closes and forgets the stateful session for a server id, if any.
pub fn close_session(server_id: &str) {
    let session = SESSIONS.lock().unwrap().remove(server_id);
    if let Some(session) = session {
        *session.state.lock().unwrap() = SessionState::Closing;
        session.client.terminate();
        tracing::debug!(server = %server_id, "closed MCP session");
    }
}

/// Terminates every live stateful session. Called at shutdown so no server
/// process outlives the runtime.
pub fn close_all_sessions() {
    let ids: Vec<String> = SESSIONS.lock().unwrap().keys().cloned().collect();
    for id in ids {
        close_session(&id);
    }
}

/// Number of live stateful sessions (diagnostics and tests).
pub fn active_session_count() -> usize {
    SESSIONS.lock().unwrap().len()
}

fn extract_text(response: &Value) -> String {
    response
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    (item.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| item.get("text").and_then(Value::as_str))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn is_launch_failure(response: &Value) -> bool {
    let is_error = response
        .get("result")
        .and_then(|r| r.get("isError"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !is_error {
        return false;
    }
    let text = extract_text(response);
    text.contains("launchPersistentContext") && text.contains("Failed to launch the browser process")
}

/// Deletes a stale user-data directory parsed from a launch-failure error
/// text. Only temp-like paths are removed. Returns true when a deletion was
/// attempted.
fn cleanup_user_data_dir(error_text: &str) -> bool {
    let candidate = USER_DATA_DIR_QUOTED
        .captures(error_text)
        .or_else(|| USER_DATA_DIR_BARE.captures(error_text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches('"').to_string());
    let Some(path) = candidate.filter(|p| !p.is_empty()) else {
        return false;
    };
    let lower = path.to_lowercase();
    if !(lower.contains("/tmp") || lower.contains("\\temp") || lower.contains("\\appdata\\local\\temp")) {
        return false;
    }
    tracing::warn!(%path, "deleting user-data directory after MCP launch failure");
    let _ = std::fs::remove_dir_all(&path);
    true
}

fn attach_stderr(client: &StdioJsonRpcClient, response: &mut Value) {
    let preview = client.stderr_preview(30);
    if !preview.is_empty() {
        if let Some(obj) = response.as_object_mut() {
            obj.insert(STDERR_KEY.to_string(), Value::String(preview));
        }
    }
}

/// Runs one MCP `tools/call` against the server described by `entry`,
/// respecting its session mode and timeout policy. Returns the raw JSON-RPC
/// response with a stderr preview attached when the server wrote any.
pub fn call_tool(
    entry: &McpServerEntry,
    tool_name: &str,
    arguments: &Map<String, Value>,
) -> Result<Value, McpError> {
    let params = json!({ "name": tool_name, "arguments": arguments });
    let timeout = call_timeout(entry);

    if entry.policy.session_mode == SessionMode::Stateful {
        let session = get_or_start_session(entry)?;
        let _guard = session.call_guard.lock().unwrap();
        *session.state.lock().unwrap() = SessionState::InCall;
        let mut response = session
            .client
            .request("tools/call", Some(params.clone()), timeout)
            .inspect_err(|_| {
                *session.state.lock().unwrap() = SessionState::Failed;
            })?;
        *session.state.lock().unwrap() = SessionState::Ready;
        attach_stderr(&session.client, &mut response);

        // Known launch-failure pattern: restart the session, clean up the
        // stale profile directory, retry once.
        if is_launch_failure(&response) {
            tracing::warn!(server = %session.server_id, "MCP launch failure detected; restarting session and retrying once");
            cleanup_user_data_dir(&extract_text(&response));
            drop(_guard);
            close_session(&session.server_id);
            let retry_session = get_or_start_session(entry)?;
            let _retry_guard = retry_session.call_guard.lock().unwrap();
            *retry_session.state.lock().unwrap() = SessionState::InCall;
            response = retry_session
                .client
                .request("tools/call", Some(params), timeout)?;
            *retry_session.state.lock().unwrap() = SessionState::Ready;
            attach_stderr(&retry_session.client, &mut response);
        }

        if entry.policy.teardown_tools.iter().any(|t| t == tool_name) {
            close_session(&entry.server_id);
        }
        return Ok(response);
    }

    // Per-call: spawn, call, terminate.
    let client = spawn_server(entry)?;
    let result = client.request("tools/call", Some(params), timeout);
    let mut response = match result {
        Ok(r) => r,
        Err(e) => {
            client.terminate();
            return Err(e);
        }
    };
    attach_stderr(&client, &mut response);
    client.terminate();
    Ok(response)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Shell script that answers every JSON-RPC line with a fixed text result,
    /// echoing the request id back.
    const FAKE_SERVER: &str = r#"while IFS= read -r line; do
        id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
        printf '{"jsonrpc":"2.0","id":%s,"result":{"isError":false,"content":[{"type":"text","text":"12:00:00 UTC"}]}}\n' "$id"
    done"#;

    fn entry(server_id: &str, mode: &str) -> McpServerEntry {
        serde_yaml::from_str(&format!(
            concat!(
                "schema_version: 1\n",
                "server_id: {id}\n",
                "display_name: Fake\n",
                "enabled: true\n",
                "launch_options:\n",
                "  - transport: stdio\n",
                "    command: sh\n",
                "    args: [\"-c\", {script:?}]\n",
                "policy:\n",
                "  call_timeout_seconds: 5\n",
                "  session_mode: {mode}\n",
            ),
            id = server_id,
            script = FAKE_SERVER,
            mode = mode,
        ))
        .expect("valid entry yaml")
    }

    /// **Scenario**: per-call mode spawns, calls, and the response text comes
    /// back through tools/call.
    #[test]
    fn per_call_roundtrip() {
        let entry = entry("test/per-call", "per_call");
        let response = call_tool(&entry, "get_current_time", &Map::new()).unwrap();
        assert_eq!(extract_text(&response), "12:00:00 UTC");
    }

    /// **Scenario**: stateful mode reuses one session and teardown tools
    /// close it.
    #[test]
    fn stateful_session_reuse_and_teardown() {
        let entry = entry("test/stateful-reuse", "stateful");
        assert!(!SESSIONS.lock().unwrap().contains_key("test/stateful-reuse"));
        call_tool(&entry, "browser_snapshot", &Map::new()).unwrap();
        assert!(SESSIONS.lock().unwrap().contains_key("test/stateful-reuse"));
        call_tool(&entry, "browser_snapshot", &Map::new()).unwrap();
        assert!(SESSIONS.lock().unwrap().contains_key("test/stateful-reuse"));
        call_tool(&entry, "browser_close", &Map::new()).unwrap();
        assert!(!SESSIONS.lock().unwrap().contains_key("test/stateful-reuse"));
    }

    /// **Scenario**: a command that exists nowhere fails launch selection
    /// with a diagnostic.
    #[test]
    fn unusable_launch_options_are_reported() {
        let mut e = entry("test/no-launch", "per_call");
        e.launch_options[0].command = "definitely-not-a-command-xyz".into();
        let err = select_launch_option(&e).unwrap_err();
        assert!(matches!(err, McpError::NoLaunchOption(_)));
        assert!(err.to_string().contains("not found on PATH"));
    }

    #[test]
    fn launch_failure_pattern_detection() {
        let failure = serde_json::json!({
            "result": {
                "isError": true,
                "content": [{"type": "text",
                    "text": "browserType.launchPersistentContext: Failed to launch the browser process"}]
            }
        });
        assert!(is_launch_failure(&failure));
        let ok = serde_json::json!({"result": {"isError": false, "content": []}});
        assert!(!is_launch_failure(&ok));
    }

    /// **Scenario**: only temp-like user-data dirs are cleaned up.
    #[test]
    fn user_data_cleanup_is_conservative() {
        let tmp = tempfile::tempdir().unwrap();
        let victim = tmp.path().join("profile");
        std::fs::create_dir_all(&victim).unwrap();
        // tempdir lives under /tmp on unix, so this is eligible.
        let text = format!("--user-data-dir=\"{}\" exploded", victim.display());
        assert!(cleanup_user_data_dir(&text));
        assert!(!victim.exists());

        assert!(!cleanup_user_data_dir("--user-data-dir=\"/home/user/real-profile\" exploded"));
        assert!(!cleanup_user_data_dir("no dir mentioned"));
    }

    #[test]
    fn close_all_sessions_empties_the_table() {
        let entry = entry("test/close-all", "stateful");
        call_tool(&entry, "anything", &Map::new()).unwrap();
        assert!(SESSIONS.lock().unwrap().contains_key("test/close-all"));
        close_all_sessions();
        assert!(!SESSIONS.lock().unwrap().contains_key("test/close-all"));
    }
}
