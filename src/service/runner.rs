//! Session Runner: launches one agent invocation and streams its events.
//!
//! [`SessionRunner`] is the seam the orchestrator drives; [`CommandRunner`]
//! is the production implementation, which spawns the configured agent CLI
//! and translates its `stream-json` output into [`SessionEvent`]s. Lines
//! that already use the native event shape are passed through unchanged,
//! so any agent command can speak the protocol directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::model::{SandboxMode, SessionType};

pub const ENV_DIR: &str = "AUTOPILOT_DIR";
pub const ENV_PROJECT_ID: &str = "AUTOPILOT_PROJECT_ID";
pub const ENV_SESSION_ID: &str = "AUTOPILOT_SESSION_ID";
pub const ENV_SANDBOX: &str = "AUTOPILOT_SANDBOX";

/// One event from a running agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ToolUse {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    ToolResult {
        tool: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: String,
    },
    /// Incremental token/cost usage
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
    SessionComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    SessionError {
        message: String,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::SessionComplete { .. } | SessionEvent::SessionError { .. }
        )
    }
}

/// Everything needed to start one agent invocation
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub project_id: String,
    pub project_name: String,
    pub session_id: String,
    pub session_type: SessionType,
    pub model: String,
    pub prompt: String,
    pub sandbox: SandboxMode,
}

/// A launched agent. The event stream ends when the process is gone.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub cancel: CancellationToken,
}

impl ProcessHandle {
    /// Ask the process to stop; best effort
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle>;
}

/// Runs the configured agent command as a child process
#[derive(Debug, Clone)]
pub struct CommandRunner {
    agent: AgentConfig,
    state_dir: PathBuf,
    kill_grace: Duration,
}

impl CommandRunner {
    pub fn new(agent: AgentConfig, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            state_dir: state_dir.into(),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Raw output log for a session
    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.state_dir
            .join("sessions")
            .join(format!("{}.log", session_id))
    }
}

#[async_trait]
impl SessionRunner for CommandRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle> {
        let args = self.agent.build_args(
            &request.model,
            &request.prompt,
            &request.session_id,
            &request.project_id,
        );
        let log_path = self.log_path(&request.session_id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Launch(format!("creating {:?}: {}", parent, e)))?;
        }
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| Error::Launch(format!("opening {:?}: {}", log_path, e)))?;

        let state_dir = std::path::absolute(&self.state_dir).unwrap_or_else(|_| self.state_dir.clone());
        let sandbox = match request.sandbox {
            SandboxMode::Docker => "docker",
            SandboxMode::Local => "local",
        };

        let mut cmd = Command::new(&self.agent.command);
        cmd.args(&args)
            .current_dir(&self.agent.workdir)
            .env(ENV_DIR, &state_dir)
            .env(ENV_PROJECT_ID, &request.project_id)
            .env(ENV_SESSION_ID, &request.session_id)
            .env(ENV_SANDBOX, sandbox)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Launch(format!("{}: {}", self.agent.command, e)))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launch("agent stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Launch("agent stderr not captured".into()))?;

        tracing::debug!(
            session = %request.session_id,
            pid = ?pid,
            command = %self.agent.command,
            "agent process spawned"
        );

        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            child,
            stdout,
            stderr,
            log,
            tx,
            cancel.clone(),
            self.kill_grace,
        ));

        Ok(ProcessHandle {
            pid,
            events: rx,
            cancel,
        })
    }
}

/// Forward translated stdout events until the process exits or is cancelled
async fn pump(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    mut log: tokio::fs::File,
    tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let stderr_tail = tokio::spawn(tail_lines(stderr, 20));
    let mut lines = BufReader::new(stdout).lines();
    let mut translator = StreamTranslator::default();
    let mut saw_terminal = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child, grace).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let _ = log.write_all(line.as_bytes()).await;
                    let _ = log.write_all(b"\n").await;
                    for event in translator.translate(&line) {
                        saw_terminal |= event.is_terminal();
                        if tx.send(event).await.is_err() {
                            // Receiver gone; nobody is listening
                            terminate(&mut child, grace).await;
                            return;
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
    let _ = log.flush().await;

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = cancel.cancelled() => {
            terminate(&mut child, grace).await;
            return;
        }
    };
    let tail = stderr_tail.await.unwrap_or_default();

    if saw_terminal {
        return;
    }
    // No result event: derive one from the exit status. A signal death
    // (no exit code) sends nothing, which reads as a crash.
    let event = match status.and_then(|s| s.code()) {
        Some(0) => Some(SessionEvent::SessionComplete { summary: None }),
        Some(code) => Some(SessionEvent::SessionError {
            message: if tail.is_empty() {
                format!("agent exited with code {}", code)
            } else {
                format!("agent exited with code {}: {}", code, tail)
            },
        }),
        None => None,
    };
    if let Some(event) = event {
        let _ = tx.send(event).await;
    }
}

async fn tail_lines(reader: impl AsyncRead + Unpin, keep: usize) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail: Vec<String> = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tail.push(line);
        if tail.len() > keep {
            tail.remove(0);
        }
    }
    tail.join("\n")
}

/// SIGTERM, then SIGKILL once `grace` runs out
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Turns agent stdout lines into [`SessionEvent`]s.
///
/// Understands the claude `stream-json` shapes (`assistant` tool_use
/// blocks, `user` tool_result blocks, the final `result`) and the native
/// event shape. Anything else is ignored.
#[derive(Debug, Default)]
pub struct StreamTranslator {
    /// tool_use id -> tool name, so results can be attributed
    tool_names: HashMap<String, String>,
}

impl StreamTranslator {
    pub fn translate(&mut self, line: &str) -> Vec<SessionEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return vec![];
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => self.assistant(&value),
            Some("user") => self.user(&value),
            Some("result") => result_events(&value),
            _ => serde_json::from_value::<SessionEvent>(value)
                .map(|e| vec![e])
                .unwrap_or_default(),
        }
    }

    fn assistant(&mut self, event: &Value) -> Vec<SessionEvent> {
        let mut out = vec![];
        for item in content_items(event) {
            if item.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                continue;
            }
            let Some(name) = item.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            if let Some(id) = item.get("id").and_then(|i| i.as_str()) {
                self.tool_names.insert(id.to_string(), name.to_string());
            }
            out.push(SessionEvent::ToolUse {
                tool: name.to_string(),
                task_id: item.get("input").and_then(task_id_from_input),
            });
        }
        out
    }

    fn user(&mut self, event: &Value) -> Vec<SessionEvent> {
        let mut out = vec![];
        for item in content_items(event) {
            if item.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let tool = item
                .get("tool_use_id")
                .and_then(|i| i.as_str())
                .and_then(|id| self.tool_names.remove(id))
                .unwrap_or_else(|| "unknown".to_string());
            let content = match item.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            out.push(SessionEvent::ToolResult {
                tool,
                is_error: item
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false),
                content,
            });
        }
        out
    }
}

fn content_items(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
}

fn result_events(event: &Value) -> Vec<SessionEvent> {
    let usage = event.get("usage");
    let tokens = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    let mut out = vec![SessionEvent::Usage {
        input_tokens: tokens("input_tokens"),
        output_tokens: tokens("output_tokens"),
        cost_usd: event
            .get("total_cost_usd")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0),
    }];

    let text = event
        .get("result")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string());
    let is_error = event
        .get("is_error")
        .and_then(|e| e.as_bool())
        .unwrap_or(false)
        || event
            .get("subtype")
            .and_then(|s| s.as_str())
            .is_some_and(|s| s.starts_with("error"));

    if is_error {
        let subtype = event
            .get("subtype")
            .and_then(|s| s.as_str())
            .unwrap_or("error");
        out.push(SessionEvent::SessionError {
            message: text.unwrap_or_else(|| format!("agent reported {}", subtype)),
        });
    } else {
        out.push(SessionEvent::SessionComplete { summary: text });
    }
    out
}

/// Pull a task id from a tool input: an explicit `task_id` field, or an
/// `autopilot task done <id>` / `autopilot test add <id>` shell command.
fn task_id_from_input(input: &Value) -> Option<String> {
    if let Some(id) = input.get("task_id").and_then(|t| t.as_str()) {
        return Some(id.to_string());
    }
    let command = input.get("command").and_then(|c| c.as_str())?;
    let words: Vec<&str> = command.split_whitespace().collect();
    words.windows(4).find_map(|w| match w {
        ["autopilot", "task", "done", id] | ["autopilot", "test", "add", id] => {
            Some(id.trim_matches(|c| c == '\'' || c == '"').to_string())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_events_pass_through() {
        let mut t = StreamTranslator::default();
        let events = t.translate(r#"{"type":"tool_result","tool":"Bash","is_error":true,"content":"boom"}"#);
        assert_eq!(
            events,
            vec![SessionEvent::ToolResult {
                tool: "Bash".into(),
                is_error: true,
                content: "boom".into()
            }]
        );
        assert!(t.translate("not json").is_empty());
        assert!(t.translate(r#"{"type":"system","subtype":"init"}"#).is_empty());
    }

    #[test]
    fn test_claude_tool_use_and_result_are_paired() {
        let mut t = StreamTranslator::default();
        let assistant = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "running"},
                {"type": "tool_use", "id": "tu_1", "name": "Bash",
                 "input": {"command": "autopilot task done task-7"}}
            ]}
        });
        let events = t.translate(&assistant.to_string());
        assert_eq!(
            events,
            vec![SessionEvent::ToolUse {
                tool: "Bash".into(),
                task_id: Some("task-7".into())
            }]
        );

        let user = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "tu_1", "is_error": true,
                 "content": [{"type": "text", "text": "exit 1"}]}
            ]}
        });
        let events = t.translate(&user.to_string());
        assert_eq!(
            events,
            vec![SessionEvent::ToolResult {
                tool: "Bash".into(),
                is_error: true,
                content: "exit 1".into()
            }]
        );
    }

    #[test]
    fn test_claude_result_success_and_error() {
        let mut t = StreamTranslator::default();
        let ok = json!({"type": "result", "subtype": "success", "is_error": false,
                        "result": "done", "total_cost_usd": 0.5,
                        "usage": {"input_tokens": 10, "output_tokens": 20}});
        let events = t.translate(&ok.to_string());
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            SessionEvent::Usage {
                input_tokens: 10,
                output_tokens: 20,
                cost_usd: 0.5
            }
        );
        assert_eq!(
            events[1],
            SessionEvent::SessionComplete {
                summary: Some("done".into())
            }
        );

        let err = json!({"type": "result", "subtype": "error_max_turns", "is_error": false});
        let events = t.translate(&err.to_string());
        assert!(matches!(events[1], SessionEvent::SessionError { .. }));
        assert!(events[1].is_terminal());
    }

    #[test]
    fn test_task_id_from_input() {
        assert_eq!(
            task_id_from_input(&json!({"task_id": "t1"})).as_deref(),
            Some("t1")
        );
        assert_eq!(
            task_id_from_input(&json!({"command": "cd x && autopilot test add 't2' 'desc'"}))
                .as_deref(),
            Some("t2")
        );
        assert!(task_id_from_input(&json!({"command": "ls"})).is_none());
    }

    #[cfg(unix)]
    fn sh_runner(dir: &std::path::Path, script: &str) -> CommandRunner {
        let agent = AgentConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..AgentConfig::default()
        };
        CommandRunner::new(agent, dir).with_kill_grace(Duration::from_secs(2))
    }

    #[cfg(unix)]
    fn request(session_id: &str) -> LaunchRequest {
        LaunchRequest {
            project_id: "p1".into(),
            project_name: "Demo".into(),
            session_id: session_id.into(),
            session_type: SessionType::Coding,
            model: "sonnet".into(),
            prompt: "go".into(),
            sandbox: SandboxMode::Local,
        }
    }

    #[cfg(unix)]
    async fn drain(handle: &mut ProcessHandle) -> Vec<SessionEvent> {
        let mut out = vec![];
        while let Some(event) = handle.events.recv().await {
            out.push(event);
        }
        out
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_streams_and_logs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = r#"echo '{"type":"tool_use","tool":"Bash"}'; echo "$AUTOPILOT_SESSION_ID" >&2; echo '{"type":"session_complete"}'"#;
        let runner = sh_runner(tmp.path(), script);
        let mut handle = runner.launch(request("sess-a")).await.unwrap();
        assert!(handle.pid.is_some());

        let events = drain(&mut handle).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], SessionEvent::SessionComplete { .. }));

        let log = std::fs::read_to_string(runner.log_path("sess-a")).unwrap();
        assert!(log.contains("tool_use"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_nonzero_exit_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = sh_runner(tmp.path(), "echo nope >&2; exit 3");
        let mut handle = runner.launch(request("sess-b")).await.unwrap();
        let events = drain(&mut handle).await;
        match events.as_slice() {
            [SessionEvent::SessionError { message }] => {
                assert!(message.contains("code 3"));
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_clean_exit_completes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = sh_runner(tmp.path(), "true");
        let mut handle = runner.launch(request("sess-c")).await.unwrap();
        let events = drain(&mut handle).await;
        assert_eq!(events, vec![SessionEvent::SessionComplete { summary: None }]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_cancel_ends_stream() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = sh_runner(tmp.path(), "sleep 30");
        let mut handle = runner.launch(request("sess-d")).await.unwrap();
        handle.cancel();
        let events = tokio::time::timeout(Duration::from_secs(10), drain(&mut handle))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_missing_command_is_launch_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let agent = AgentConfig {
            command: "/definitely/not/a/real/agent".into(),
            ..AgentConfig::default()
        };
        let runner = CommandRunner::new(agent, tmp.path());
        let err = runner.launch(request_any()).await.unwrap_err();
        assert_eq!(err.kind(), "Launch");
    }

    fn request_any() -> LaunchRequest {
        LaunchRequest {
            project_id: "p1".into(),
            project_name: "Demo".into(),
            session_id: "sess-x".into(),
            session_type: SessionType::Initializer,
            model: "sonnet".into(),
            prompt: "go".into(),
            sandbox: SandboxMode::Docker,
        }
    }
}
