//! Agent subprocess executor.
//!
//! Spawns one external agent CLI invocation per task and exposes it as an
//! [`ExecutionHandle`]: a bounded event stream for the single consumer (the
//! bridge run loop) plus a cloneable [`ExecutionControl`] for the answer
//! path, which runs on a different flow. Abort is advisory: the reader
//! kills the child and the stream ends at the next boundary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::AgentEvent;

/// Event channel depth: enough to absorb a chatty agent without letting an
/// unread stream grow unboundedly.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Metadata injected into the agent's system prompt so it can call the
/// control API (e.g. to schedule follow-ups for its own chat).
#[derive(Debug, Clone, Default)]
pub struct ApiContext {
    pub bot_name: String,
    pub chat_id: String,
    pub port: Option<u16>,
    pub secret: Option<String>,
}

/// Per-bot execution policy from the bot config.
#[derive(Debug, Clone, Default)]
pub struct ExecPolicy {
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
}

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub abort: CancellationToken,
    pub outputs_dir: PathBuf,
    pub api_context: ApiContext,
    pub policy: ExecPolicy,
}

/// Cloneable control surface for an in-flight invocation.
#[derive(Clone)]
pub struct ExecutionControl {
    answer_tx: mpsc::UnboundedSender<String>,
    finish: CancellationToken,
}

impl ExecutionControl {
    pub(crate) fn new(
        answer_tx: mpsc::UnboundedSender<String>,
        finish: CancellationToken,
    ) -> Self {
        Self { answer_tx, finish }
    }

    /// Enqueue an answer to an outstanding ask-user tool invocation.
    /// Non-blocking; a closed subprocess just drops the answer.
    pub fn send_answer(&self, tool_use_id: &str, session_id: Option<&str>, answers: Value) {
        let line = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": [{"type": "text", "text": answers.to_string()}],
                }],
            },
            "session_id": session_id,
        });
        if self.answer_tx.send(line.to_string()).is_err() {
            warn!(tool_use_id, "Agent input closed, answer dropped");
        }
    }

    /// Signal that no more input will be sent; the subprocess can shut its
    /// stdin and exit gracefully.
    pub fn finish(&self) {
        self.finish.cancel();
    }
}

/// A started invocation: the lazy event stream plus its control surface.
pub struct ExecutionHandle {
    pub events: mpsc::Receiver<AgentEvent>,
    pub control: ExecutionControl,
}

/// Seam between the bridge and the subprocess, mocked in tests.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn start(&self, req: ExecutionRequest) -> Result<ExecutionHandle, ExecutorError>;
}

/// Drives the real agent CLI with stream-json stdio.
pub struct ClaudeExecutor {
    binary: PathBuf,
}

impl ClaudeExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl AgentRunner for ClaudeExecutor {
    async fn start(&self, req: ExecutionRequest) -> Result<ExecutionHandle, ExecutorError> {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&req.cwd)
            .arg("-p")
            .arg(&req.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--append-system-prompt")
            .arg(system_prompt_suffix(&req))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(sid) = &req.session_id {
            cmd.arg("--resume").arg(sid);
        }
        if !req.policy.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools").arg(req.policy.allowed_tools.join(","));
        }
        if let Some(max_turns) = req.policy.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        if let Some(model) = &req.policy.model {
            cmd.arg("--model").arg(model);
        }

        let mut child = cmd.spawn()?;
        info!(
            bot = req.api_context.bot_name,
            chat_id = req.api_context.chat_id,
            cwd = %req.cwd.display(),
            resume = req.session_id.is_some(),
            "Agent process started"
        );

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdin = child.stdin.take().expect("stdin was piped");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel::<String>();
        let finish = CancellationToken::new();

        // Writer: forwards answers to the child's stdin until finish is
        // signalled, then closes stdin so the child can exit.
        let writer_finish = finish.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_finish.cancelled() => break,
                    line = answer_rx.recv() => {
                        let Some(line) = line else { break };
                        if stdin.write_all(line.as_bytes()).await.is_err()
                            || stdin.write_all(b"\n").await.is_err()
                            || stdin.flush().await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            drop(stdin);
        });

        // Stderr drain, for diagnostics only.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent_stderr", "{line}");
            }
        });

        // Reader: parses stdout lines into events until EOF or abort.
        let abort = req.abort.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = abort.cancelled() => {
                        debug!("Agent aborted, killing process");
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        for event in AgentEvent::from_wire_line(&line) {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            match child.wait().await {
                Ok(status) => debug!(code = ?status.code(), "Agent process exited"),
                Err(e) => warn!(error = %e, "Failed waiting for agent process"),
            }
        });

        Ok(ExecutionHandle {
            events: event_rx,
            control: ExecutionControl { answer_tx, finish },
        })
    }
}

fn system_prompt_suffix(req: &ExecutionRequest) -> String {
    let mut suffix = format!(
        "Files written to {} will be sent back into the chat when you finish.",
        req.outputs_dir.display()
    );
    if let Some(port) = req.api_context.port {
        suffix.push_str(&format!(
            "\nA control API is available at http://127.0.0.1:{port}. \
             To schedule follow-up work for this conversation, POST to /api/schedule \
             with botName \"{}\" and chatId \"{}\".",
            req.api_context.bot_name, req.api_context.chat_id
        ));
        if let Some(secret) = &req.api_context.secret {
            suffix.push_str(&format!(
                "\nSend the header `Authorization: Bearer {secret}` with every request."
            ));
        }
    }
    suffix
}
