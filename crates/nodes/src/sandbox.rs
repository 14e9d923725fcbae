//! Isolated execution of custom plugin code in a child process.
//!
//! The plugin receives one JSON document on stdin:
//! `{ "input": …, "params": …, "context": { "runId", "nodeId", "attempt", "inputs", "steps" } }`
//! and must print its result as a single JSON line on stdout:
//! `{ "success": true, "output": … }` or `{ "success": false, "error": "…" }`.
//! The last non-empty stdout line is taken as the result. The child runs
//! with a cleared environment (only `PATH` and the configured `env`) and is
//! killed when the wall-clock timeout expires.
//!
//! Config:
//! ```json
//! { "command": "python3", "args": ["plugin.py"], "timeoutMs": 30000,
//!   "version": "1.4.0", "env": { "MODE": "strict" }, "params": {} }
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::{ExecutableNode, ExecutionContext, NodeError, NodeOutput};

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Deserialize)]
struct PluginResult {
    success: bool,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct SandboxNode {
    default_timeout: Duration,
}

impl SandboxNode {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn parse_result(stdout: &str) -> Result<PluginResult, NodeError> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| NodeError::Sandbox("plugin produced no result line".into()))?;

        serde_json::from_str(line)
            .map_err(|e| NodeError::Sandbox(format!("plugin result line is not valid JSON: {e}")))
    }
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl ExecutableNode for SandboxNode {
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::invalid_config("CUSTOM", "missing 'command'"))?;
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();
        let timeout = config
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = config.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::Sandbox(format!("failed to spawn plugin '{command}': {e}")))?;

        let payload = json!({
            "input": input,
            "params": config.get("params").cloned().unwrap_or(Value::Null),
            "context": {
                "runId": ctx.run_id,
                "nodeId": ctx.node_id,
                "attempt": ctx.attempt,
                "inputs": ctx.run_input,
                "steps": ctx.steps,
            },
        });
        let mut bytes = serde_json::to_vec(&payload)
            .map_err(|e| NodeError::Sandbox(format!("payload encoding failed: {e}")))?;
        bytes.push(b'\n');

        let stdin = child.stdin.take();
        let node_id = &ctx.node_id;
        let feed = async move {
            let Some(mut stdin) = stdin else { return };
            // A plugin that never reads stdin closes the pipe early; that is
            // not a failure of the plugin itself.
            if let Err(e) = stdin.write_all(&bytes).await {
                warn!(node_id = %node_id, "plugin stdin closed early: {}", e);
            }
        };

        // Feeding stdin and waiting run together under one deadline, so a
        // plugin that ignores a large payload cannot stall the write past it.
        // Dropping the future on timeout drops the child, which kills it.
        let run = async move { tokio::join!(feed, child.wait_with_output()).1 };
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result
                .map_err(|e| NodeError::Sandbox(format!("failed to wait for plugin: {e}")))?,
            Err(_) => {
                return Err(NodeError::Sandbox(format!(
                    "plugin timeout after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(NodeError::Sandbox(format!(
                "plugin process exited with {}: {}",
                output.status,
                tail(&stderr)
            )));
        }

        let result = Self::parse_result(&stdout)?;
        if result.success {
            Ok(NodeOutput::Complete(result.output))
        } else {
            Err(NodeError::Sandbox(
                result.error.unwrap_or_else(|| "plugin reported failure".into()),
            ))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: uuid::Uuid::nil(),
            run_id: uuid::Uuid::nil(),
            node_id: "plugin".into(),
            run_input: Value::Null,
            steps: HashMap::new(),
            attempt: 1,
        }
    }

    fn shell(script: &str) -> Value {
        json!({ "command": "sh", "args": ["-c", script], "timeoutMs": 2000 })
    }

    #[tokio::test]
    async fn last_json_line_is_the_result() {
        let node = SandboxNode::new(Duration::from_secs(5));
        let config = shell(r#"read payload; echo "debug noise"; echo '{"success":true,"output":{"ok":1}}'"#);
        let out = node.execute(&config, json!({ "a": 1 }), &ctx()).await.unwrap();
        assert_eq!(out, NodeOutput::Complete(json!({ "ok": 1 })));
    }

    #[tokio::test]
    async fn reported_failure_carries_plugin_message() {
        let node = SandboxNode::new(Duration::from_secs(5));
        let config = shell(r#"echo '{"success":false,"error":"connection refused by upstream"}'"#);
        let err = node.execute(&config, Value::Null, &ctx()).await.unwrap_err();
        assert_eq!(err, NodeError::Sandbox("connection refused by upstream".into()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_sandbox_error() {
        let node = SandboxNode::new(Duration::from_secs(5));
        let err = node
            .execute(&shell("echo broken >&2; exit 3"), Value::Null, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(&err, NodeError::Sandbox(m) if m.contains("broken")));
    }

    #[tokio::test]
    async fn slow_plugin_times_out() {
        let node = SandboxNode::new(Duration::from_secs(5));
        let config = json!({ "command": "sh", "args": ["-c", "sleep 5"], "timeoutMs": 100 });
        let err = node.execute(&config, Value::Null, &ctx()).await.unwrap_err();
        assert!(err.message().contains("timeout"));
    }

    #[tokio::test]
    async fn unread_large_input_still_times_out() {
        let node = SandboxNode::new(Duration::from_secs(5));
        let config = json!({ "command": "sh", "args": ["-c", "sleep 4"], "timeoutMs": 100 });
        let input = Value::String("x".repeat(1 << 20));

        let started = std::time::Instant::now();
        let err = node.execute(&config, input, &ctx()).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(err.message().contains("timeout"), "{err}");
    }
}
