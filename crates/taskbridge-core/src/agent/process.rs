//! JSON-lines subprocess agent
//!
//! One child process per turn. The engine writes one JSON object per line to
//! the child's stdin, the child answers with `AgentEvent` lines on stdout:
//!
//! ```text
//! engine → {"type":"start","user_id":1,"input":"...","working_directory":"...","continuation":"..."}
//! child  → {"type":"text_delta","text":"..."}
//! child  → {"type":"permission_request","tool_name":"Write","arguments":{...}}
//! engine → {"type":"resume","value":{"kind":"permission","approved":true}}
//! child  → {"type":"done","continuation":"..."}
//! ```
//!
//! Stderr is forwarded to the log.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{AgentBackend, AgentEvent, AgentTurn, ResumeValue, TurnRequest};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::session::{ContinuationHandle, UserId};

/// Line written to the child's stdin
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Start {
        user_id: UserId,
        input: &'a str,
        working_directory: &'a Path,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation: Option<&'a ContinuationHandle>,
    },
    Resume { value: &'a ResumeValue },
}

/// Spawns the configured executable for every turn
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl AgentBackend for ProcessAgent {
    async fn start_turn(&self, request: TurnRequest) -> Result<Box<dyn AgentTurn>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::AgentStream(format!("Failed to spawn {}: {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::AgentStream("Failed to capture agent stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::AgentStream("Failed to capture agent stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let user_id = request.user_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(user_id, "agent stderr: {}", line);
                }
            });
        }

        info!(
            user_id = request.user_id,
            command = %self.command,
            dir = %request.working_directory.display(),
            resumed = request.continuation.is_some(),
            "Spawned agent process"
        );

        let mut turn = ProcessTurn {
            user_id: request.user_id,
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            finished: false,
        };
        turn.write(&Outbound::Start {
            user_id: request.user_id,
            input: &request.input,
            working_directory: &request.working_directory,
            continuation: request.continuation.as_ref(),
        })
        .await?;

        Ok(Box::new(turn))
    }
}

struct ProcessTurn {
    user_id: UserId,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    finished: bool,
}

impl ProcessTurn {
    async fn write(&mut self, message: &Outbound<'_>) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::AgentStream(format!("Failed to write to agent: {}", e)))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::AgentStream(format!("Failed to write to agent: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::AgentStream(format!("Failed to write to agent: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl AgentTurn for ProcessTurn {
    async fn next_event(&mut self) -> Option<Result<AgentEvent>> {
        if self.finished {
            return None;
        }
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentEvent>(line) {
                        Ok(event) => {
                            if matches!(event, AgentEvent::Done { .. }) {
                                self.finished = true;
                            }
                            return Some(Ok(event));
                        }
                        Err(e) => {
                            warn!(user_id = self.user_id, error = %e, "Skipping unparseable agent line");
                        }
                    }
                }
                Ok(None) => {
                    self.finished = true;
                    let status = self.child.wait().await.ok();
                    return Some(Err(Error::AgentStream(match status {
                        Some(status) => format!("Agent exited before finishing the turn ({})", status),
                        None => "Agent exited before finishing the turn".to_string(),
                    })));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(Error::AgentStream(format!("Failed to read agent output: {}", e))));
                }
            }
        }
    }

    async fn resume(&mut self, value: ResumeValue) -> Result<()> {
        debug!(user_id = self.user_id, ?value, "Resuming agent");
        self.write(&Outbound::Resume { value: &value }).await
    }

    async fn cancel(&mut self) {
        self.finished = true;
        if let Err(e) = self.child.kill().await {
            debug!(user_id = self.user_id, error = %e, "Agent process already gone");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(body: &str) -> ProcessAgent {
        ProcessAgent::new("sh", vec!["-c".to_string(), body.to_string()])
    }

    fn request() -> TurnRequest {
        TurnRequest {
            user_id: 1,
            input: "list files".to_string(),
            working_directory: std::env::temp_dir(),
            continuation: None,
        }
    }

    #[tokio::test]
    async fn test_reads_events_and_skips_garbage() {
        let agent = script(
            r#"read start
echo '{"type":"text_delta","text":"hi"}'
echo 'not json'
echo '{"type":"done","continuation":"c-1"}'"#,
        );
        let mut turn = agent.start_turn(request()).await.unwrap();

        let first = turn.next_event().await.unwrap().unwrap();
        assert_eq!(first, AgentEvent::TextDelta { text: "hi".into() });

        let done = turn.next_event().await.unwrap().unwrap();
        assert_eq!(
            done,
            AgentEvent::Done {
                continuation: Some(ContinuationHandle::new("c-1"))
            }
        );
        assert!(turn.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_start_line_and_resume_reach_child() {
        // Echo back what the engine wrote, wrapped as text deltas
        let agent = script(
            r#"read start
case "$start" in *'"type":"start"'*'"input":"list files"'*) echo '{"type":"permission_request","tool_name":"Write"}';; esac
read resume
case "$resume" in *'"approved":false'*) echo '{"type":"done"}';; esac"#,
        );
        let mut turn = agent.start_turn(request()).await.unwrap();

        let event = turn.next_event().await.unwrap().unwrap();
        assert!(matches!(event, AgentEvent::PermissionRequest { ref tool_name, .. } if tool_name == "Write"));

        turn.resume(ResumeValue::Permission {
            approved: false,
            clarification: None,
        })
        .await
        .unwrap();
        assert_eq!(turn.next_event().await.unwrap().unwrap(), AgentEvent::Done { continuation: None });
    }

    #[tokio::test]
    async fn test_early_exit_is_stream_error() {
        let agent = script("read start; exit 3");
        let mut turn = agent.start_turn(request()).await.unwrap();
        assert!(matches!(turn.next_event().await, Some(Err(Error::AgentStream(_)))));
        assert!(turn.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let agent = ProcessAgent::new("/nonexistent/agent-binary", vec![]);
        assert!(matches!(agent.start_turn(request()).await, Err(Error::AgentStream(_))));
    }
}
