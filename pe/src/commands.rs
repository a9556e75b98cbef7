//! Chat command surface
//!
//! One [`Engine`] per process handles every inbound chat message: `/prd ...`
//! slash commands plus free-form turns. All replies are chat-ready strings;
//! user mistakes (bad role, malformed quick form, blocked apply) come back as
//! replies, never as errors. Only infrastructure failures propagate.
//!
//! The store lock is the sole shared mutable resource, so each message may
//! run on its own tokio task. Oracle calls always happen between store
//! operations, never while the lock is held.

use std::path::PathBuf;
use std::sync::Arc;

use convlog::ConvLog;
use tracing::{info, warn};

use crate::config::Config;
use crate::document;
use crate::error::PrdError;
use crate::importer::{IssueImporter, QueueImporter};
use crate::oracle::Oracle;
use crate::score;
use crate::session::{PrdSession, Role, SessionStore, default_agent_priority};
use crate::stage;
use crate::turn;

const HELP: &str = "PRD commands:\n\
/prd start [product] - begin a requirements session\n\
/prd refine - get the most valuable next question\n\
/prd score - check clarity score and readiness\n\
/prd preview - show the document as it stands\n\
/prd priority [role=value ...|default] - adjust role priorities\n\
/prd save [path] - write the document without finalizing\n\
/prd apply [path] - finalize: write, queue stories, close the session\n\
/prd cancel - discard the session\n\
Anything else is treated as an answer to the current question.";

/// The chat-facing engine
pub struct Engine {
    store: SessionStore,
    log: ConvLog,
    oracle: Oracle,
    importer: Arc<dyn IssueImporter>,
    documents_dir: PathBuf,
    tail_budget: usize,
}

impl Engine {
    /// Engine wired from config, with a file-backed issue queue
    pub fn new(config: &Config, oracle: Oracle) -> eyre::Result<Self> {
        Ok(Self {
            store: SessionStore::open(&config.control_root),
            log: ConvLog::open(&config.conversation_log_dir)?,
            oracle,
            importer: Arc::new(QueueImporter::new(&config.issue_queue_dir)),
            documents_dir: config.documents_dir.clone(),
            tail_budget: config.conversation_tail_budget,
        })
    }

    /// Engine from explicit parts (tests, embedding)
    pub fn with_parts(
        store: SessionStore,
        log: ConvLog,
        oracle: Oracle,
        importer: Arc<dyn IssueImporter>,
        documents_dir: PathBuf,
        tail_budget: usize,
    ) -> Self {
        Self {
            store,
            log,
            oracle,
            importer,
            documents_dir,
            tail_budget,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Handle one inbound chat message and produce the reply
    pub async fn handle_message(&self, chat_id: i64, text: &str) -> Result<String, PrdError> {
        let text = text.trim();
        let result = if let Some(rest) = text.strip_prefix("/prd") {
            self.dispatch(chat_id, rest.trim()).await
        } else if text.is_empty() {
            return Ok(HELP.to_string());
        } else {
            self.free_text(chat_id, text).await
        };

        match result {
            Ok(reply) => Ok(reply),
            Err(e) if recoverable(&e) => Ok(friendly(&e)),
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, chat_id: i64, rest: &str) -> Result<String, PrdError> {
        let mut words = rest.split_whitespace();
        let sub = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match sub {
            "" | "help" => Ok(HELP.to_string()),
            "start" => self.cmd_start(chat_id, &args.join(" ")).await,
            "refine" => self.cmd_refine(chat_id).await,
            "score" => self.cmd_score(chat_id).await,
            "preview" => self.cmd_preview(chat_id),
            "priority" => self.cmd_priority(chat_id, &args),
            "save" => self.cmd_save(chat_id, args.first().copied()),
            "apply" => self.cmd_apply(chat_id, args.first().copied()).await,
            "cancel" => self.cmd_cancel(chat_id),
            other => Ok(format!("Unknown command '/prd {}'.\n{}", other, HELP)),
        }
    }

    async fn cmd_start(&self, chat_id: i64, product: &str) -> Result<String, PrdError> {
        // A fresh session always starts from a clean conversation
        if let Err(e) = self.log.clear(chat_id) {
            warn!(chat_id, error = %e, "Failed to clear conversation log");
        }

        let mut session = PrdSession::new(chat_id);
        let reply = if product.is_empty() {
            stage::prompt_for(session.stage).to_string()
        } else {
            stage::handle_input(&mut session, product, &self.oracle).await?
        };
        self.store.upsert(&session)?;
        info!(chat_id, product, "Started PRD session");
        Ok(format!("Starting a new PRD session. {}", reply))
    }

    async fn cmd_refine(&self, chat_id: i64) -> Result<String, PrdError> {
        let mut session = self.load(chat_id)?;
        let tail = self.tail(chat_id);

        match score::oracle_refine(&self.oracle, &session, &tail).await {
            Ok(outcome) => {
                score::cache_assessment(&mut session, &outcome.assessment);
                session.stage = outcome
                    .suggested_stage
                    .unwrap_or_else(|| score::heuristic(&session).recommended_stage);
                self.store.upsert(&session)?;
                Ok(format!(
                    "Clarity {}/100{}.\n{}",
                    outcome.assessment.score,
                    if outcome.assessment.ready { ", ready to apply" } else { "" },
                    outcome.ask
                ))
            }
            Err(e) => {
                // No dynamic question without the oracle; fall back to the
                // fixed prompt for the recommended stage.
                let clarity = score::heuristic(&session);
                session.stage = clarity.recommended_stage;
                self.store.upsert(&session)?;
                Ok(format!(
                    "Refine service unavailable ({}). Heuristic clarity {}/100.\n{}",
                    e.category,
                    clarity.score,
                    stage::prompt_for(clarity.recommended_stage)
                ))
            }
        }
    }

    async fn cmd_score(&self, chat_id: i64) -> Result<String, PrdError> {
        let mut session = self.load(chat_id)?;
        let tail = self.tail(chat_id);
        let clarity = score::heuristic(&session);

        match score::oracle_score(&self.oracle, &session, &tail).await {
            Ok(assessment) => {
                score::cache_assessment(&mut session, &assessment);
                self.store.upsert(&session)?;
                Ok(format!(
                    "Clarity: heuristic {}/100, assessed {}/100{}.{}",
                    clarity.score,
                    assessment.score,
                    if assessment.ready { " Ready to apply" } else { "" },
                    missing_line(&assessment.missing)
                ))
            }
            Err(e) => {
                let cached = match (session.codex_score, session.codex_scored_at) {
                    (Some(score), Some(at)) => {
                        format!(" Last assessment {}/100 at {}.", score, at.format("%Y-%m-%d %H:%M UTC"))
                    }
                    _ => String::new(),
                };
                Ok(format!(
                    "Scoring service unavailable ({}). Heuristic clarity {}/100.{}{}",
                    e.category,
                    clarity.score,
                    missing_line(&clarity.missing),
                    cached
                ))
            }
        }
    }

    fn cmd_preview(&self, chat_id: i64) -> Result<String, PrdError> {
        let session = self.load(chat_id)?;
        let doc = document::render(&session);
        let body = serde_json::to_string_pretty(&doc)?;
        Ok(format!(
            "PRD preview ({} clarity {}/100, {} stories):\n{}",
            doc.clarity.source,
            doc.clarity.score,
            doc.stories.len(),
            body
        ))
    }

    fn cmd_priority(&self, chat_id: i64, args: &[&str]) -> Result<String, PrdError> {
        let mut session = self.load(chat_id)?;

        if args == ["default"] {
            session.agent_priority = default_agent_priority();
            session.touch();
        } else if args.is_empty() {
            return Ok(priority_table(&session));
        } else {
            for pair in args {
                let (role_part, value_part) = pair
                    .split_once('=')
                    .ok_or_else(|| PrdError::InvalidPriority((*pair).to_string()))?;
                let role: Role = role_part
                    .parse()
                    .map_err(|_| PrdError::InvalidRole(role_part.to_string()))?;
                let value: u32 = match value_part.parse() {
                    Ok(v) if v > 0 => v,
                    _ => return Err(PrdError::InvalidPriority(value_part.to_string())),
                };
                session.agent_priority.insert(role, value);
            }
            session.touch();
        }

        self.store.upsert(&session)?;
        Ok(priority_table(&session))
    }

    fn cmd_save(&self, chat_id: i64, path: Option<&str>) -> Result<String, PrdError> {
        let session = self.load(chat_id)?;
        let path = self.document_path(&session, path);
        document::save(&session, &path)?;
        Ok(format!("PRD document saved to {} (session stays open).", path.display()))
    }

    async fn cmd_apply(&self, chat_id: i64, path: Option<&str>) -> Result<String, PrdError> {
        let mut session = self.load(chat_id)?;
        let tail = self.tail(chat_id);
        let path = self.document_path(&session, path);

        let outcome = document::apply(
            &mut session,
            &tail,
            &self.oracle,
            &self.store,
            self.importer.as_ref(),
            &path,
        )
        .await?;

        if let Err(e) = self.log.clear(chat_id) {
            warn!(chat_id, error = %e, "Failed to clear conversation log");
        }
        Ok(format!(
            "PRD applied at clarity {}/100: {} written, {} of {} stories queued ({} already queued, {} invalid). Session closed.",
            outcome.score,
            path.display(),
            outcome.report.imported,
            outcome.report.total,
            outcome.report.skipped_existing,
            outcome.report.skipped_invalid,
        ))
    }

    fn cmd_cancel(&self, chat_id: i64) -> Result<String, PrdError> {
        self.store.delete(chat_id)?;
        if let Err(e) = self.log.clear(chat_id) {
            warn!(chat_id, error = %e, "Failed to clear conversation log");
        }
        info!(chat_id, "Cancelled PRD session");
        Ok("PRD session discarded. /prd start to begin again.".to_string())
    }

    async fn free_text(&self, chat_id: i64, text: &str) -> Result<String, PrdError> {
        let mut session = self.load(chat_id)?;
        let tail = self.tail(chat_id);

        if let Err(e) = self.log.append(chat_id, "user", text) {
            warn!(chat_id, error = %e, "Failed to append to conversation log");
        }

        let reply = turn::process(&mut session, text, &tail, &self.oracle).await?;
        self.store.upsert(&session)?;

        if let Err(e) = self.log.append(chat_id, "assistant", &reply) {
            warn!(chat_id, error = %e, "Failed to append to conversation log");
        }
        Ok(reply)
    }

    fn load(&self, chat_id: i64) -> Result<PrdSession, PrdError> {
        self.store.load(chat_id)?.ok_or(PrdError::SessionNotFound(chat_id))
    }

    fn tail(&self, chat_id: i64) -> String {
        match self.log.tail(chat_id, self.tail_budget) {
            Ok(tail) => tail,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to read conversation tail");
                String::new()
            }
        }
    }

    fn document_path(&self, session: &PrdSession, explicit: Option<&str>) -> PathBuf {
        match explicit {
            Some(path) => PathBuf::from(path),
            None => {
                let slug = slugify(&session.product_name);
                let name = if slug.is_empty() {
                    format!("prd-chat-{}.json", session.chat_id)
                } else {
                    format!("{}.prd.json", slug)
                };
                self.documents_dir.join(name)
            }
        }
    }
}

/// Whether an error should come back as a chat reply instead of propagating
fn recoverable(e: &PrdError) -> bool {
    e.is_input_error()
        || matches!(
            e,
            PrdError::SessionNotFound(_) | PrdError::ApplyBlocked { .. } | PrdError::ExternalService { .. }
        )
}

fn friendly(e: &PrdError) -> String {
    match e {
        PrdError::SessionNotFound(_) => "No active PRD session here. /prd start to begin.".to_string(),
        PrdError::ApplyBlocked { score, missing } => format!(
            "Not ready to apply (clarity {}/100).{} /prd refine to close the gaps.",
            score,
            missing_line(missing)
        ),
        PrdError::ExternalService { category, detail } => {
            format!("External service failure ({}): {}", category, detail)
        }
        other => other.to_string(),
    }
}

fn missing_line(missing: &[String]) -> String {
    if missing.is_empty() {
        String::new()
    } else {
        format!(" Missing: {}.", missing.join(", "))
    }
}

fn priority_table(session: &PrdSession) -> String {
    let rows: Vec<String> = Role::all()
        .iter()
        .map(|role| format!("{}: {}", role, session.role_priority(*role)))
        .collect();
    format!("Role priorities - {}", rows.join(", "))
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
