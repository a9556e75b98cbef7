//! External reasoning service integration
//!
//! The engine consults the oracle for four independent things: interpreting a
//! free-form turn, scoring clarity, proposing a refinement question, and
//! estimating story priority. Each call kind is an injectable function value
//! with a fixed request/response schema, so tests swap in deterministic
//! stubs without a provider hierarchy.

mod codex;

pub use codex::{CodexCli, DEFAULT_CALL_TIMEOUT, MAX_CALL_TIMEOUT};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::session::PrdSession;

/// Classification of an oracle call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleFailure {
    NotInstalled,
    FileNotFound,
    Timeout,
    Permission,
    Network,
    InvalidResponse,
    ExecFailure,
}

impl OracleFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleFailure::NotInstalled => "not_installed",
            OracleFailure::FileNotFound => "file_not_found",
            OracleFailure::Timeout => "timeout",
            OracleFailure::Permission => "permission",
            OracleFailure::Network => "network",
            OracleFailure::InvalidResponse => "invalid_response",
            OracleFailure::ExecFailure => "exec_failure",
        }
    }

    /// Whether a background call may retry after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleFailure::Timeout | OracleFailure::Network | OracleFailure::ExecFailure
        )
    }
}

impl fmt::Display for OracleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified oracle failure with human-readable detail
#[derive(Debug, Clone, Error)]
#[error("{category}: {detail}")]
pub struct OracleError {
    pub category: OracleFailure,
    pub detail: String,
}

impl OracleError {
    pub fn new(category: OracleFailure, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

// === Request/response schemas (strict JSON) ===

/// Snapshot sent with every oracle call
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: PrdSession,
    pub conversation_tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnRequest {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub input: String,
}

/// Sparse patch over the six context fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_of_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

impl SessionPatch {
    /// Field-by-field view, in interview order
    pub fn entries(&self) -> [(crate::session::ContextField, Option<&str>); 6] {
        use crate::session::ContextField as F;
        [
            (F::Problem, self.problem.as_deref()),
            (F::Goal, self.goal.as_deref()),
            (F::InScope, self.in_scope.as_deref()),
            (F::OutOfScope, self.out_of_scope.as_deref()),
            (F::Acceptance, self.acceptance.as_deref()),
            (F::Constraints, self.constraints.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, v)| v.is_none())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnResponse {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub next_question: Option<String>,
    #[serde(default)]
    pub suggested_stage: Option<String>,
    #[serde(default)]
    pub ready_to_apply: bool,
    #[serde(default)]
    pub session_patch: SessionPatch,
    #[serde(default)]
    pub story: Option<StoryPatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    pub score: i64,
    #[serde(default)]
    pub ready_to_apply: bool,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefineResponse {
    pub score: i64,
    #[serde(default)]
    pub ready_to_apply: bool,
    #[serde(default)]
    pub ask: String,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub suggested_stage: Option<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityRequest {
    pub title: String,
    pub description: String,
    pub role: String,
    pub product: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorityResponse {
    pub priority: i64,
    #[serde(default)]
    pub reason: String,
}

// === Strategy function values ===

pub type OracleResult<T> = Result<T, OracleError>;

pub type TurnFn = Arc<dyn Fn(TurnRequest) -> BoxFuture<'static, OracleResult<TurnResponse>> + Send + Sync>;
pub type ScoreFn = Arc<dyn Fn(SessionSnapshot) -> BoxFuture<'static, OracleResult<ScoreResponse>> + Send + Sync>;
pub type RefineFn = Arc<dyn Fn(SessionSnapshot) -> BoxFuture<'static, OracleResult<RefineResponse>> + Send + Sync>;
pub type PriorityFn = Arc<dyn Fn(PriorityRequest) -> BoxFuture<'static, OracleResult<PriorityResponse>> + Send + Sync>;

/// The four injectable call kinds
///
/// A `None` slot means the service is not configured; callers degrade to the
/// deterministic path.
#[derive(Clone, Default)]
pub struct Oracle {
    pub turn: Option<TurnFn>,
    pub score: Option<ScoreFn>,
    pub refine: Option<RefineFn>,
    pub priority: Option<PriorityFn>,
}

impl Oracle {
    /// No oracle configured; everything runs deterministically
    pub fn disabled() -> Self {
        Self::default()
    }

    /// All four call kinds backed by one codex-style CLI
    pub fn from_cli(cli: Arc<CodexCli>) -> Self {
        Self {
            turn: Some(cli.turn_fn()),
            score: Some(cli.score_fn()),
            refine: Some(cli.refine_fn()),
            priority: Some(cli.priority_fn()),
        }
    }
}

/// Extract the outermost JSON object from oracle output
///
/// Tolerates a fenced code block wrapper and leading/trailing prose by
/// slicing from the first `{` to the last `}`.
pub fn extract_json(raw: &str) -> OracleResult<&str> {
    let start = raw
        .find('{')
        .ok_or_else(|| OracleError::new(OracleFailure::InvalidResponse, "no JSON object in response"))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end >= start)
        .ok_or_else(|| OracleError::new(OracleFailure::InvalidResponse, "unterminated JSON object in response"))?;
    Ok(&raw[start..=end])
}

/// Parse a strict-schema response out of possibly-noisy oracle output
pub fn parse_response<T: serde::de::DeserializeOwned>(raw: &str) -> OracleResult<T> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| OracleError::new(OracleFailure::InvalidResponse, e.to_string()))
}

/// Linear-backoff retry for background oracle calls
///
/// Not used for interactive turns (single attempt, latency-sensitive).
pub async fn with_linear_backoff<T, F, Fut>(attempts: u32, base_delay: Duration, mut call: F) -> OracleResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = OracleResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(attempt, category = %e.category, "Oracle call failed");
                if !e.category.is_retryable() || attempt == attempts {
                    return Err(e);
                }
                tokio::time::sleep(base_delay * attempt).await;
                attempt += 1;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let raw = r#"{"score": 80}"#;
        assert_eq!(extract_json(raw).unwrap(), raw);
    }

    #[test]
    fn test_extract_json_fenced_with_prose() {
        let raw = "Here is my assessment:\n```json\n{\"score\": 75, \"ready_to_apply\": false}\n```\nHope that helps.";
        let parsed: ScoreResponse = parse_response(raw).unwrap();
        assert_eq!(parsed.score, 75);
        assert!(!parsed.ready_to_apply);
    }

    #[test]
    fn test_extract_json_missing_object() {
        let err = extract_json("no json here").unwrap_err();
        assert_eq!(err.category, OracleFailure::InvalidResponse);
    }

    #[test]
    fn test_parse_turn_response_sparse() {
        let raw = r#"{"reply": "noted", "session_patch": {"goal": "faster checkout"}}"#;
        let resp: TurnResponse = parse_response(raw).unwrap();
        assert_eq!(resp.reply.as_deref(), Some("noted"));
        assert_eq!(resp.session_patch.goal.as_deref(), Some("faster checkout"));
        assert!(resp.session_patch.problem.is_none());
        assert!(!resp.ready_to_apply);
        assert!(resp.story.is_none());
    }

    #[tokio::test]
    async fn test_backoff_retries_then_succeeds() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_linear_backoff(3, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                    Err(OracleError::new(OracleFailure::Timeout, "busy"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_invalid_response() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let result: OracleResult<u32> = with_linear_backoff(3, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(OracleError::new(OracleFailure::InvalidResponse, "bad json"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
