//! Project standards handed to reviewers.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read-only source of the standards a review should be held to.
#[async_trait]
pub trait StandardsSource: Send + Sync {
    async fn applicable(&self, session_id: &str, context: Option<&str>) -> Vec<String>;
}

pub struct NoStandards;

#[async_trait]
impl StandardsSource for NoStandards {
    async fn applicable(&self, _session_id: &str, _context: Option<&str>) -> Vec<String> {
        Vec::new()
    }
}

/// Every `*.md` / `*.txt` file under a directory, in path order.
///
/// Each entry is `"<relative path>\n\n<contents>"`. Hidden directories are
/// skipped and unreadable files are logged and left out.
pub struct DirectoryStandards {
    root: PathBuf,
    max_depth: usize,
}

impl DirectoryStandards {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: 4,
        }
    }

    fn collect(root: &Path, max_depth: usize) -> Vec<String> {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        let mut standards = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Skipping standards entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let is_doc = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "md" | "txt"));
            if !is_doc {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            match std::fs::read_to_string(entry.path()) {
                Ok(content) if !content.trim().is_empty() => {
                    standards.push(format!("{}\n\n{}", rel, content.trim()));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to read standard {}: {}", rel, e),
            }
        }
        standards
    }
}

#[async_trait]
impl StandardsSource for DirectoryStandards {
    async fn applicable(&self, session_id: &str, _context: Option<&str>) -> Vec<String> {
        let root = self.root.clone();
        let max_depth = self.max_depth;
        match tokio::task::spawn_blocking(move || Self::collect(&root, max_depth)).await {
            Ok(standards) => {
                tracing::debug!(
                    session_id = %session_id,
                    count = standards.len(),
                    "Loaded review standards"
                );
                standards
            }
            Err(e) => {
                tracing::warn!("Standards loader failed: {}", e);
                Vec::new()
            }
        }
    }
}
