//! Durable session store
//!
//! The persisted unit is one JSON document mapping chat ids to sessions.
//! Every read-modify-write happens under the store lock; the document is
//! replaced via write-to-temp-then-rename so readers never observe a
//! half-written store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PrdError;
use crate::session::PrdSession;

use super::lock::StoreLock;

/// Canonical store file name inside the control root
pub const STORE_FILE: &str = "prd_sessions.json";
/// Pre-workspace store file, migrated once on first access
pub const LEGACY_STORE_FILE: &str = "sessions.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    sessions: BTreeMap<String, PrdSession>,
}

/// File-backed session store guarded by the store lock
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store rooted at a control directory, using the canonical file name
    pub fn open(control_root: impl AsRef<Path>) -> Self {
        Self {
            path: control_root.as_ref().join(STORE_FILE),
        }
    }

    /// Store at an explicit file path (tests, tooling)
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch one session, if present
    pub fn load(&self, chat_id: i64) -> Result<Option<PrdSession>, PrdError> {
        let _lock = StoreLock::acquire(&self.path)?;
        let doc = self.read_doc()?;
        Ok(doc.sessions.get(&chat_id.to_string()).cloned())
    }

    /// Insert or replace one session
    pub fn upsert(&self, session: &PrdSession) -> Result<(), PrdError> {
        let _lock = StoreLock::acquire(&self.path)?;
        let mut doc = self.read_doc()?;
        doc.sessions.insert(session.chat_id.to_string(), session.clone());
        self.write_doc(&doc)?;
        debug!(chat_id = session.chat_id, stage = %session.stage, "Upserted session");
        Ok(())
    }

    /// Remove one session; removing an absent session is not an error
    pub fn delete(&self, chat_id: i64) -> Result<(), PrdError> {
        let _lock = StoreLock::acquire(&self.path)?;
        let mut doc = self.read_doc()?;
        if doc.sessions.remove(&chat_id.to_string()).is_some() {
            self.write_doc(&doc)?;
            debug!(chat_id, "Deleted session");
        }
        Ok(())
    }

    /// All chat ids with an active session
    pub fn chat_ids(&self) -> Result<Vec<i64>, PrdError> {
        let _lock = StoreLock::acquire(&self.path)?;
        let doc = self.read_doc()?;
        Ok(doc.sessions.keys().filter_map(|k| k.parse().ok()).collect())
    }

    /// Read the whole document, running the legacy migration first
    fn read_doc(&self) -> Result<StoreDoc, PrdError> {
        self.migrate_legacy()?;
        if !self.path.exists() {
            return Ok(StoreDoc::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let doc: StoreDoc = serde_json::from_str(&content)?;
        Ok(doc)
    }

    /// Replace the whole document atomically with owner-only permissions
    fn write_doc(&self, doc: &StoreDoc) -> Result<(), PrdError> {
        if let Some(dir) = self.path.parent()
            && !dir.exists()
        {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&tmp, content)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// One-time migration from the legacy single-file location
    ///
    /// Idempotent and safe to race: a concurrent migration finds the
    /// canonical file already present and skips.
    fn migrate_legacy(&self) -> Result<(), PrdError> {
        if self.path.exists() {
            return Ok(());
        }
        let legacy = match self.path.parent() {
            Some(dir) => dir.join(LEGACY_STORE_FILE),
            None => return Ok(()),
        };
        if legacy == self.path || !legacy.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&legacy)?;
        let doc: StoreDoc = serde_json::from_str(&content)?;
        self.write_doc(&doc)?;
        let _ = fs::remove_file(&legacy);
        info!(from = %legacy.display(), to = %self.path.display(), "Migrated legacy session store");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
