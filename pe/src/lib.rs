//! prdengine - chat-driven PRD session engine
//!
//! prdengine turns a chat conversation into a structured product requirements
//! document. A deterministic staged interview collects the narrative context
//! and user stories; an external reasoning service (the "oracle") accelerates
//! turns, scores clarity, and estimates story priorities - and every oracle
//! path degrades to the deterministic one, so the engine works with no oracle
//! at all. The only hard gate is `apply`: finalization demands a fresh oracle
//! assessment.
//!
//! # Core guarantees
//!
//! - **Crash-safe persistence**: sessions live in one JSON store replaced
//!   atomically under an advisory lock with stale-lock recovery
//! - **Total turns**: every message produces a reply; malformed input never
//!   advances the interview
//! - **Fail-closed finalization**: `apply` never runs on a stale or
//!   heuristic-only assessment
//!
//! # Modules
//!
//! - [`session`] - session model, durable store, advisory lock
//! - [`stage`] - deterministic stage machine
//! - [`turn`] - oracle-assisted turn processing
//! - [`score`] - clarity scoring (heuristic + oracle)
//! - [`priority`] - story priority resolution
//! - [`document`] - document serialization and the apply pipeline
//! - [`importer`] - issue queue hand-off
//! - [`commands`] - the chat command surface
//! - [`oracle`] - external reasoning service integration
//! - [`config`] / [`cli`] - configuration and the CLI shell

pub mod cli;
pub mod commands;
pub mod config;
pub mod document;
pub mod error;
pub mod importer;
pub mod oracle;
pub mod priority;
pub mod score;
pub mod session;
pub mod stage;
pub mod turn;

// Re-export commonly used types
pub use commands::Engine;
pub use config::Config;
pub use document::{ApplyOutcome, PrdDocument};
pub use error::PrdError;
pub use importer::{ImportReport, IssueImporter, QueueImporter};
pub use oracle::{CodexCli, Oracle, OracleError, OracleFailure};
pub use session::{PrdSession, PrdStory, Role, SessionStore, Stage};
