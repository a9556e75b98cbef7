//! Core ConvLog implementation

use eyre::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Append-only per-chat conversation log
pub struct ConvLog {
    /// Base directory holding one `<chat_id>.log` file per chat
    base_dir: PathBuf,
}

impl ConvLog {
    /// Open or create a conversation log directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).context("Failed to create conversation log directory")?;
        debug!(?base_dir, "Opened conversation log");
        Ok(Self { base_dir })
    }

    fn chat_path(&self, chat_id: i64) -> PathBuf {
        self.base_dir.join(format!("{}.log", chat_id))
    }

    /// Append one role-tagged message to a chat's log
    ///
    /// Each entry is a single line; embedded newlines in the text are
    /// flattened so the log stays line-oriented.
    pub fn append(&self, chat_id: i64, role: &str, text: &str) -> Result<()> {
        let path = self.chat_path(chat_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open conversation log: {}", path.display()))?;

        let flat = text.replace(['\n', '\r'], " ");
        let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        writeln!(file, "[{}] {}: {}", stamp, role, flat)?;
        debug!(chat_id, role, len = flat.len(), "Appended conversation entry");
        Ok(())
    }

    /// Read the most recent conversation text, bounded by a byte budget
    ///
    /// Returns an empty string when no log exists. Truncation happens at the
    /// front and respects UTF-8 char boundaries.
    pub fn tail(&self, chat_id: i64, max_bytes: usize) -> Result<String> {
        let path = self.chat_path(chat_id);
        if !path.exists() {
            return Ok(String::new());
        }

        let content =
            fs::read_to_string(&path).context(format!("Failed to read conversation log: {}", path.display()))?;
        if content.len() <= max_bytes {
            return Ok(content);
        }

        let mut start = content.len() - max_bytes;
        while start < content.len() && !content.is_char_boundary(start) {
            start += 1;
        }
        debug!(chat_id, dropped = start, "Truncated conversation tail");
        Ok(content[start..].to_string())
    }

    /// Remove a chat's log entirely
    ///
    /// Idempotent: clearing a chat that has no log is not an error.
    pub fn clear(&self, chat_id: i64) -> Result<()> {
        let path = self.chat_path(chat_id);
        if path.exists() {
            fs::remove_file(&path).context(format!("Failed to clear conversation log: {}", path.display()))?;
            debug!(chat_id, "Cleared conversation log");
        }
        Ok(())
    }
}
