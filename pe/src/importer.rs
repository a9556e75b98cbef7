//! Issue importer
//!
//! The hand-off at the end of an apply: each story in a rendered document
//! becomes one queued issue. The trait keeps the queue format out of the
//! engine; [`QueueImporter`] is the file-backed implementation, one JSON
//! issue per story in a queue directory.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PrdError;
use crate::session::Role;

/// Counts from one import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub imported: usize,
    pub skipped_existing: usize,
    pub skipped_invalid: usize,
}

/// Turns a PRD document on disk into queued issues
pub trait IssueImporter: Send + Sync {
    /// Import the document at `path`
    ///
    /// `default_role` backfills stories whose role is missing in older
    /// documents; `dry_run` counts without writing.
    fn import(&self, path: &Path, default_role: Role, dry_run: bool) -> Result<ImportReport, PrdError>;
}

/// One queued issue as written to the queue directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedIssue {
    pub id: String,
    pub title: String,
    pub description: String,
    pub role: Role,
    pub priority: u32,
    pub status: String,
    pub source: String,
    pub product: String,
    pub created_at: DateTime<Utc>,
}

// Lenient read side: documents written by older builds may omit a story's
// role or priority, which the strict document types reject.
#[derive(Deserialize)]
struct LenientDoc {
    #[serde(default)]
    product: String,
    #[serde(default)]
    stories: Vec<LenientStory>,
}

#[derive(Deserialize)]
struct LenientStory {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    priority: u32,
}

/// File-backed importer writing `<story id>.json` per story
pub struct QueueImporter {
    queue_dir: PathBuf,
}

impl QueueImporter {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
        }
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }
}

impl IssueImporter for QueueImporter {
    fn import(&self, path: &Path, default_role: Role, dry_run: bool) -> Result<ImportReport, PrdError> {
        let doc: LenientDoc = serde_json::from_str(&fs::read_to_string(path)?)?;
        if !dry_run && !self.queue_dir.exists() {
            fs::create_dir_all(&self.queue_dir)?;
        }

        let mut report = ImportReport {
            total: doc.stories.len(),
            ..Default::default()
        };
        for story in &doc.stories {
            if story.id.trim().is_empty() || story.title.trim().is_empty() || story.description.trim().is_empty() {
                debug!(id = %story.id, "Skipping invalid story");
                report.skipped_invalid += 1;
                continue;
            }
            let target = self.queue_dir.join(format!("{}.json", story.id));
            if target.exists() {
                debug!(id = %story.id, "Skipping already-queued story");
                report.skipped_existing += 1;
                continue;
            }

            if !dry_run {
                let role = story.role.unwrap_or(default_role);
                let issue = QueuedIssue {
                    id: story.id.clone(),
                    title: story.title.clone(),
                    description: story.description.clone(),
                    role,
                    priority: if story.priority > 0 {
                        story.priority
                    } else {
                        role.default_priority()
                    },
                    status: "queued".to_string(),
                    source: "prd".to_string(),
                    product: doc.product.clone(),
                    created_at: Utc::now(),
                };
                fs::write(&target, serde_json::to_string_pretty(&issue)?)?;
            }
            report.imported += 1;
        }

        info!(
            path = %path.display(),
            total = report.total,
            imported = report.imported,
            dry_run,
            "Imported PRD document"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{render, write_document};
    use crate::session::{ContextField, PrdSession};
    use tempfile::TempDir;

    fn doc_with_stories(temp: &TempDir, count: usize) -> PathBuf {
        let mut s = PrdSession::new(1);
        s.product_name = "Wallet".into();
        s.set_context_field(ContextField::Problem, "payments fail");
        for i in 0..count {
            s.push_story(format!("story {i}"), format!("description {i}"), Role::Developer, 1000);
        }
        let path = temp.path().join("wallet.prd.json");
        write_document(&render(&s), &path).unwrap();
        path
    }

    #[test]
    fn test_import_writes_one_issue_per_story() {
        let temp = TempDir::new().unwrap();
        let path = doc_with_stories(&temp, 3);
        let importer = QueueImporter::new(temp.path().join("queue"));

        let report = importer.import(&path, Role::Developer, false).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.imported, 3);
        assert_eq!(report.skipped_existing, 0);

        let entries = fs::read_dir(importer.queue_dir()).unwrap().count();
        assert_eq!(entries, 3);
    }

    #[test]
    fn test_reimport_skips_existing_ids() {
        let temp = TempDir::new().unwrap();
        let path = doc_with_stories(&temp, 2);
        let importer = QueueImporter::new(temp.path().join("queue"));

        importer.import(&path, Role::Developer, false).unwrap();
        let second = importer.import(&path, Role::Developer, false).unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped_existing, 2);
    }

    #[test]
    fn test_dry_run_counts_without_writing() {
        let temp = TempDir::new().unwrap();
        let path = doc_with_stories(&temp, 2);
        let importer = QueueImporter::new(temp.path().join("queue"));

        let report = importer.import(&path, Role::Developer, true).unwrap();
        assert_eq!(report.imported, 2);
        assert!(!importer.queue_dir().exists());
    }

    #[test]
    fn test_invalid_story_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut s = PrdSession::new(1);
        s.product_name = "Wallet".into();
        s.push_story("good".into(), "has a description".into(), Role::Qa, 1100);
        s.push_story("bad".into(), "   ".into(), Role::Qa, 1100);
        let path = temp.path().join("wallet.prd.json");
        write_document(&render(&s), &path).unwrap();

        let importer = QueueImporter::new(temp.path().join("queue"));
        let report = importer.import(&path, Role::Developer, false).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped_invalid, 1);
    }

    #[test]
    fn test_missing_role_backfills_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("old.prd.json");
        fs::write(
            &path,
            r#"{"product": "Wallet", "stories": [{"id": "prd-x-001", "title": "t", "description": "d"}]}"#,
        )
        .unwrap();

        let importer = QueueImporter::new(temp.path().join("queue"));
        let report = importer.import(&path, Role::Developer, false).unwrap();
        assert_eq!(report.imported, 1);

        let issue: QueuedIssue =
            serde_json::from_str(&fs::read_to_string(importer.queue_dir().join("prd-x-001.json")).unwrap()).unwrap();
        assert_eq!(issue.role, Role::Developer);
        assert_eq!(issue.priority, 1000);
    }

    #[test]
    fn test_queued_issue_content() {
        let temp = TempDir::new().unwrap();
        let path = doc_with_stories(&temp, 1);
        let importer = QueueImporter::new(temp.path().join("queue"));
        importer.import(&path, Role::Developer, false).unwrap();

        let entry = fs::read_dir(importer.queue_dir()).unwrap().next().unwrap().unwrap();
        let issue: QueuedIssue = serde_json::from_str(&fs::read_to_string(entry.path()).unwrap()).unwrap();
        assert_eq!(issue.status, "queued");
        assert_eq!(issue.source, "prd");
        assert_eq!(issue.product, "Wallet");
        assert_eq!(issue.priority, 1000);
    }
}
