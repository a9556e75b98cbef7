//! Codex CLI oracle backend
//!
//! Shells out to a codex-style reasoning CLI. The prompt (instructions plus
//! the JSON request payload) goes in on stdin; the response JSON comes back
//! on stdout, possibly wrapped in prose or a fenced code block.

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    OracleError, OracleFailure, OracleResult, PriorityFn, PriorityRequest, RefineFn, ScoreFn, SessionSnapshot, TurnFn,
    TurnRequest, parse_response,
};

/// Default per-call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(40);
/// Hard cap on the per-call timeout, whatever the config says
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(120);

const TURN_PROMPT: &str = "\
You are assisting a PRD (requirements) interview. Given the session state, \
the recent conversation and the user's latest message, respond with ONLY a \
JSON object: {\"reply\", \"next_question\", \"suggested_stage\", \
\"ready_to_apply\", \"session_patch\": {\"problem\", \"goal\", \"in_scope\", \
\"out_of_scope\", \"acceptance\", \"constraints\"}, \"story\": {\"title\", \
\"description\", \"role\", \"priority\"}}. Omit fields you have nothing for. \
suggested_stage must be one of the session's stage names.";

const SCORE_PROMPT: &str = "\
Assess the completeness of this PRD session. Respond with ONLY a JSON \
object: {\"score\": 0-100, \"ready_to_apply\": bool, \"missing\": [..], \
\"summary\": \"..\"}.";

const REFINE_PROMPT: &str = "\
Assess this PRD session and propose the single most valuable next question. \
Respond with ONLY a JSON object: {\"score\": 0-100, \"ready_to_apply\": \
bool, \"ask\": \"..\", \"missing\": [..], \"suggested_stage\": \"..\", \
\"reason\": \"..\"}.";

const PRIORITY_PROMPT: &str = "\
Estimate a queue priority for this story (lower runs earlier; typical range \
100-3000). Respond with ONLY a JSON object: {\"priority\": int, \"reason\": \
\"..\"}.";

/// One configured codex-style CLI, shared by all four call kinds
pub struct CodexCli {
    command: String,
    timeout: Duration,
}

impl CodexCli {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            command: command.into(),
            timeout: timeout.min(MAX_CALL_TIMEOUT),
        })
    }

    /// Run one CLI invocation and return raw stdout
    async fn invoke(&self, prompt: String) -> OracleResult<String> {
        debug!(command = %self.command, prompt_len = prompt.len(), "Invoking oracle CLI");

        let mut child = Command::new(&self.command)
            .arg("exec")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    OracleError::new(OracleFailure::NotInstalled, format!("'{}' is not installed", self.command))
                }
                ErrorKind::PermissionDenied => OracleError::new(OracleFailure::Permission, e.to_string()),
                _ => OracleError::new(OracleFailure::ExecFailure, e.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A CLI that exits early may close stdin; that surfaces via the
            // exit status, not here.
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(OracleError::new(OracleFailure::ExecFailure, e.to_string())),
            Err(_) => {
                return Err(OracleError::new(
                    OracleFailure::Timeout,
                    format!("oracle call exceeded {:?}", self.timeout),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }
        if stdout.trim().is_empty() {
            return Err(OracleError::new(OracleFailure::InvalidResponse, "oracle produced no output"));
        }
        Ok(stdout)
    }

    pub fn turn_fn(self: &Arc<Self>) -> TurnFn {
        let cli = self.clone();
        Arc::new(move |req: TurnRequest| {
            let cli = cli.clone();
            Box::pin(async move {
                let payload = encode(&req)?;
                let raw = cli.invoke(format!("{}\n\n{}", TURN_PROMPT, payload)).await?;
                parse_response(&raw)
            })
        })
    }

    pub fn score_fn(self: &Arc<Self>) -> ScoreFn {
        let cli = self.clone();
        Arc::new(move |snap: SessionSnapshot| {
            let cli = cli.clone();
            Box::pin(async move {
                let payload = encode(&snap)?;
                let raw = cli.invoke(format!("{}\n\n{}", SCORE_PROMPT, payload)).await?;
                parse_response(&raw)
            })
        })
    }

    pub fn refine_fn(self: &Arc<Self>) -> RefineFn {
        let cli = self.clone();
        Arc::new(move |snap: SessionSnapshot| {
            let cli = cli.clone();
            Box::pin(async move {
                let payload = encode(&snap)?;
                let raw = cli.invoke(format!("{}\n\n{}", REFINE_PROMPT, payload)).await?;
                parse_response(&raw)
            })
        })
    }

    pub fn priority_fn(self: &Arc<Self>) -> PriorityFn {
        let cli = self.clone();
        Arc::new(move |req: PriorityRequest| {
            let cli = cli.clone();
            Box::pin(async move {
                let payload = encode(&req)?;
                let raw = cli.invoke(format!("{}\n\n{}", PRIORITY_PROMPT, payload)).await?;
                parse_response(&raw)
            })
        })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> OracleResult<String> {
    serde_json::to_string(value).map_err(|e| OracleError::new(OracleFailure::InvalidResponse, e.to_string()))
}

/// Classify a non-zero exit by what the CLI wrote to stderr
fn classify_failure(code: Option<i32>, stderr: &str) -> OracleError {
    let lower = stderr.to_lowercase();
    let category = if lower.contains("no such file") || lower.contains("file not found") {
        OracleFailure::FileNotFound
    } else if lower.contains("permission denied") {
        OracleFailure::Permission
    } else if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("dns")
        || lower.contains("could not resolve")
    {
        OracleFailure::Network
    } else {
        OracleFailure::ExecFailure
    };

    let detail = if stderr.trim().is_empty() {
        format!("exit code {}", code.unwrap_or(-1))
    } else {
        format!("exit code {}: {}", code.unwrap_or(-1), stderr.trim())
    };
    OracleError::new(category, detail)
}
