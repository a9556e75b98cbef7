//! PRD document serialization and the apply pipeline
//!
//! `render` turns a session into a self-contained document; `save` writes it
//! anywhere without ceremony; `apply` is the guarded exit: refresh the
//! external assessment (fail closed when the service is unreachable), gate on
//! readiness, write atomically, hand the path to the issue importer, and only
//! then delete the session.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::PrdError;
use crate::importer::{ImportReport, IssueImporter};
use crate::oracle::Oracle;
use crate::score::{self, OracleAssessment};
use crate::session::{ContextField, PrdSession, PrdStory, Role, SessionContext, SessionStore, is_assumed};

/// A rendered PRD document, the unit handed to the issue importer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdDocument {
    pub product: String,
    pub generated_at: DateTime<Utc>,
    pub clarity: DocumentClarity,
    pub context: SessionContext,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub agent_priority: BTreeMap<Role, u32>,
    #[serde(default)]
    pub stories: Vec<PrdStory>,
}

/// Clarity block embedded in the document header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentClarity {
    pub score: u8,
    pub ready: bool,
    #[serde(default)]
    pub missing: Vec<String>,
    /// `heuristic` or `codex`
    pub source: String,
}

/// Result of a successful apply
#[derive(Debug)]
pub struct ApplyOutcome {
    pub score: u8,
    pub report: ImportReport,
}

/// Render a session into a document
///
/// Every story comes out with a non-empty id and a positive priority: a zero
/// priority (never produced by this engine, but possible in hand-edited
/// stores) resolves through the session's role profile.
pub fn render(session: &PrdSession) -> PrdDocument {
    let clarity = score::heuristic(session);
    let clarity = match (session.codex_score, session.codex_ready) {
        (Some(cached), Some(ready)) => DocumentClarity {
            score: cached,
            ready,
            missing: session.codex_missing.clone(),
            source: "codex".to_string(),
        },
        _ => DocumentClarity {
            score: clarity.score,
            ready: clarity.ready,
            missing: clarity.missing,
            source: "heuristic".to_string(),
        },
    };

    let stories = session
        .stories
        .iter()
        .enumerate()
        .map(|(i, story)| {
            let mut story = story.clone();
            if story.id.trim().is_empty() {
                story.id = format!("prd-{}-{:03}", session.created_at.format("%Y%m%d%H%M%S"), i + 1);
            }
            if story.priority == 0 {
                story.priority = session.role_priority(story.role);
            }
            story
        })
        .collect();

    PrdDocument {
        product: session.product_name.clone(),
        generated_at: Utc::now(),
        clarity,
        context: session.context.clone(),
        assumptions: session.assumptions.clone(),
        agent_priority: session.agent_priority.clone(),
        stories,
    }
}

/// Write a document atomically (temp file + rename in the target directory)
pub fn write_document(doc: &PrdDocument, path: &Path) -> Result<(), PrdError> {
    if let Some(dir) = path.parent()
        && !dir.exists()
    {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a document back (the importer's side of the hand-off)
pub fn read_document(path: &Path) -> Result<PrdDocument, PrdError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Render and write, no gate, session untouched
pub fn save(session: &PrdSession, path: &Path) -> Result<(), PrdError> {
    let doc = render(session);
    write_document(&doc, path)?;
    info!(chat_id = session.chat_id, path = %path.display(), stories = doc.stories.len(), "Saved PRD document");
    Ok(())
}

/// The guarded finalization pipeline
///
/// The assessment must come fresh from the oracle on this call; a stale
/// cached score or a heuristic-only pass never opens the gate, and the
/// refreshed assessment is authoritative once it arrives. The one local
/// check on top is the assumed-placeholder invariant: a skipped answer
/// never ships. The session is deleted only after the document is on disk
/// and imported.
pub async fn apply(
    session: &mut PrdSession,
    conversation_tail: &str,
    oracle: &Oracle,
    store: &SessionStore,
    importer: &dyn IssueImporter,
    path: &Path,
) -> Result<ApplyOutcome, PrdError> {
    let assessment: OracleAssessment = score::oracle_score(oracle, session, conversation_tail).await?;
    score::cache_assessment(session, &assessment);
    store.upsert(session)?;

    let assumed: Vec<String> = ContextField::all()
        .iter()
        .filter(|f| is_assumed(session.context.get(**f)))
        .map(|f| f.key().to_string())
        .collect();
    if !assessment.ready || !assumed.is_empty() {
        let mut missing = assessment.missing;
        for field in assumed {
            if !missing.contains(&field) {
                missing.push(field);
            }
        }
        warn!(chat_id = session.chat_id, score = assessment.score, ?missing, "Apply blocked");
        return Err(PrdError::ApplyBlocked {
            score: assessment.score,
            missing,
        });
    }

    let doc = render(session);
    write_document(&doc, path)?;
    let report = importer.import(path, Role::Developer, false)?;
    store.delete(session.chat_id)?;
    info!(
        chat_id = session.chat_id,
        path = %path.display(),
        imported = report.imported,
        skipped = report.skipped_existing + report.skipped_invalid,
        "Applied PRD document"
    );
    Ok(ApplyOutcome {
        score: assessment.score,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::QueueImporter;
    use crate::oracle::stubs::{score_failing, score_stub};
    use crate::oracle::{OracleFailure, ScoreResponse};
    use crate::session::ContextField;
    use tempfile::TempDir;

    fn ready_session() -> PrdSession {
        let mut s = PrdSession::new(42);
        s.product_name = "Wallet".into();
        s.set_context_field(ContextField::Problem, "payments fail silently");
        s.set_context_field(ContextField::Goal, "recover 95% of failures");
        s.set_context_field(ContextField::InScope, "retry pipeline");
        s.set_context_field(ContextField::OutOfScope, "refunds");
        s.set_context_field(ContextField::Acceptance, "retried within 5 minutes");
        s.set_context_field(ContextField::Constraints, "PCI");
        s.push_story("retry".into(), "with backoff".into(), Role::Developer, 1000);
        s
    }

    fn ready_oracle() -> Oracle {
        Oracle {
            score: Some(score_stub(ScoreResponse {
                score: 90,
                ready_to_apply: true,
                missing: vec![],
                summary: "solid".to_string(),
            })),
            ..Oracle::disabled()
        }
    }

    #[test]
    fn test_render_prefers_cached_assessment() {
        let mut s = ready_session();
        s.codex_score = Some(85);
        s.codex_ready = Some(true);
        let doc = render(&s);
        assert_eq!(doc.clarity.score, 85);
        assert_eq!(doc.clarity.source, "codex");
    }

    #[test]
    fn test_render_backfills_zero_priority() {
        let mut s = ready_session();
        s.stories[0].priority = 0;
        let doc = render(&s);
        assert_eq!(doc.stories[0].priority, 1000);
    }

    #[test]
    fn test_save_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wallet.prd.json");
        let s = ready_session();
        save(&s, &path).unwrap();

        let doc = read_document(&path).unwrap();
        assert_eq!(doc.product, "Wallet");
        assert_eq!(doc.stories.len(), 1);
        assert_eq!(doc.context.problem, "payments fail silently");
    }

    #[tokio::test]
    async fn test_apply_writes_imports_and_deletes() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        let mut s = ready_session();
        store.upsert(&s).unwrap();

        let outcome = apply(&mut s, "", &ready_oracle(), &store, &importer, &path)
            .await
            .unwrap();
        assert_eq!(outcome.report.imported, 1);
        assert!(path.exists());
        assert!(store.load(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_fails_closed_without_oracle() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        let mut s = ready_session();
        store.upsert(&s).unwrap();

        let err = apply(&mut s, "", &Oracle::disabled(), &store, &importer, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, PrdError::ExternalService { .. }));
        assert!(!path.exists());
        assert!(store.load(42).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_fails_closed_on_oracle_failure() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        let oracle = Oracle {
            score: Some(score_failing(OracleFailure::Network)),
            ..Oracle::disabled()
        };
        let mut s = ready_session();
        store.upsert(&s).unwrap();

        let err = apply(&mut s, "", &oracle, &store, &importer, &path).await.unwrap_err();
        assert!(matches!(
            err,
            PrdError::ExternalService {
                category: OracleFailure::Network,
                ..
            }
        ));
        assert!(store.load(42).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_trusts_refreshed_assessment_over_heuristic() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        // Thin by heuristic standards (no stories), but the refreshed
        // assessment is authoritative
        let mut s = ready_session();
        s.stories.clear();
        store.upsert(&s).unwrap();

        let outcome = apply(&mut s, "", &ready_oracle(), &store, &importer, &path)
            .await
            .unwrap();
        assert_eq!(outcome.report.total, 0);
        assert!(path.exists());
        assert!(store.load(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_blocked_below_gate() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        let mut s = ready_session();
        s.set_context_field(ContextField::Acceptance, "skip"); // assumed placeholder
        store.upsert(&s).unwrap();

        let err = apply(&mut s, "", &ready_oracle(), &store, &importer, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, PrdError::ApplyBlocked { .. }));
        assert!(!path.exists());
        // Session survives, with the fresh assessment cached
        let kept = store.load(42).unwrap().unwrap();
        assert_eq!(kept.codex_score, Some(90));
    }

    #[tokio::test]
    async fn test_apply_blocked_when_oracle_not_ready() {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::open(temp.path());
        let importer = QueueImporter::new(temp.path().join("queue"));
        let path = temp.path().join("wallet.prd.json");

        let oracle = Oracle {
            score: Some(score_stub(ScoreResponse {
                score: 70,
                ready_to_apply: false,
                missing: vec!["acceptance detail".to_string()],
                summary: "thin".to_string(),
            })),
            ..Oracle::disabled()
        };
        let mut s = ready_session();
        store.upsert(&s).unwrap();

        let err = apply(&mut s, "", &oracle, &store, &importer, &path).await.unwrap_err();
        match err {
            PrdError::ApplyBlocked { score, missing } => {
                assert_eq!(score, 70);
                assert!(missing.contains(&"acceptance detail".to_string()));
            }
            other => panic!("expected ApplyBlocked, got {other:?}"),
        }
    }
}
