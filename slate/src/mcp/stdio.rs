//! Line-delimited JSON-RPC 2.0 client over a child process's stdio.
//!
//! One JSON object per line in each direction. Outgoing requests carry
//! monotonically increasing integer ids; a reader thread parses stdout lines
//! and routes responses to per-request channels. A second thread captures
//! stderr into a bounded ring buffer for diagnostics.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

/// Lines of stderr retained for diagnostics.
const STDERR_RING_CAPACITY: usize = 200;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn MCP process {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("MCP process exited before request {method:?} (exit={exit_code:?})\nstderr:\n{stderr}")]
    ProcessExited {
        method: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("failed to write request {method:?} to MCP process: {source}\nstderr:\n{stderr}")]
    Write {
        method: String,
        source: std::io::Error,
        stderr: String,
    },
    #[error("timeout waiting for JSON-RPC response to {method} (id={id})")]
    Timeout { method: String, id: i64 },
    #[error("no usable stdio launch option: {0}")]
    NoLaunchOption(String),
    #[error("mcp: {0}")]
    Other(String),
}

/// Minimal JSON-RPC client bound to one child process.
pub struct StdioJsonRpcClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicI64,
    pending: Arc<Mutex<HashMap<i64, SyncSender<Value>>>>,
    stderr_lines: Arc<Mutex<VecDeque<String>>>,
}

impl StdioJsonRpcClient {
    /// Spawns the process with piped stdio and starts the reader threads.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: &std::path::Path,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(cwd);
        // Inherited environment minus PYTHONPATH: IDE-injected paths can
        // shadow the server's own dependencies.
        cmd.env_remove("PYTHONPATH");
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let pending: Arc<Mutex<HashMap<i64, SyncSender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stderr_lines: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

        let pending_for_reader = Arc::clone(&pending);
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(msg) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                let Some(id) = msg.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let sender = pending_for_reader.lock().unwrap().get(&id).cloned();
                if let Some(sender) = sender {
                    let _ = sender.try_send(msg);
                }
            }
        });

        let stderr_for_reader = Arc::clone(&stderr_lines);
        std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                let mut ring = stderr_for_reader.lock().unwrap();
                if ring.len() >= STDERR_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending,
            stderr_lines,
        })
    }

    /// Most recent stderr lines, newest last.
    pub fn stderr_preview(&self, max_lines: usize) -> String {
        let ring = self.stderr_lines.lock().unwrap();
        let start = ring.len().saturating_sub(max_lines);
        ring.iter()
            .skip(start)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    pub fn is_alive(&self) -> bool {
        match self.child.lock().unwrap().try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    /// Sends one request and waits for the matching response.
    pub fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut payload = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            payload["params"] = params;
        }

        let (tx, rx) = sync_channel::<Value>(1);
        self.pending.lock().unwrap().insert(id, tx);

        let result = self.send_and_wait(method, id, &payload, rx, timeout);
        self.pending.lock().unwrap().remove(&id);
        result
    }

    fn send_and_wait(
        &self,
        method: &str,
        id: i64,
        payload: &Value,
        rx: std::sync::mpsc::Receiver<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if let Ok(Some(status)) = self.child.lock().unwrap().try_wait() {
            return Err(McpError::ProcessExited {
                method: method.to_string(),
                exit_code: status.code(),
                stderr: self.stderr_preview(30),
            });
        }

        {
            let mut stdin = self.stdin.lock().unwrap();
            let line = format!("{payload}\n");
            stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.flush())
                .map_err(|source| McpError::Write {
                    method: method.to_string(),
                    source,
                    stderr: self.stderr_preview(30),
                })?;
        }

        match rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(McpError::Timeout {
                    method: method.to_string(),
                    id,
                })
            }
        }
    }

    /// Terminates the child: kill, then reap.
    pub fn terminate(&self) {
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for StdioJsonRpcClient {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
