//! Markdown file discovery below the workspace roots.

use std::{path::Path, sync::Arc};
use walkdir::{DirEntry, WalkDir};

use crate::{
    config::NotedownConfig,
    index::{FileInfo, WorkspaceRoot},
    paths::{is_markdown, os_path_to_string},
};

/// Enumerates Markdown files, honouring exclusions, hidden names and the file cap.
#[derive(Debug, Clone)]
pub struct Scanner {
    config: Arc<NotedownConfig>,
}

impl Scanner {
    pub fn new(config: Arc<NotedownConfig>) -> Self {
        Scanner { config }
    }

    /// Exclusions are matched against the root-relative path so the location of the root itself
    /// never excludes anything.
    fn skip(&self, entry: &DirEntry, walk_root: &Path, root: &WorkspaceRoot) -> bool {
        if entry.path() == walk_root {
            return false;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false);
        let relative = entry.path().strip_prefix(&root.path).unwrap_or(entry.path());
        hidden || self.config.is_excluded(&os_path_to_string(relative))
    }

    /// Scan every root in order. Once `max_files` entries were found scanning stops for all
    /// remaining roots; reaching the cap is not an error.
    #[tracing::instrument(skip_all)]
    pub fn scan(&self, roots: &[WorkspaceRoot]) -> Vec<FileInfo> {
        let mut found = Vec::new();
        for root in roots.iter() {
            if found.len() >= self.config.max_files {
                break;
            }
            let limit = self.config.max_files - found.len();
            found.extend(self.scan_dir(root, &root.path, limit));
        }
        if found.len() >= self.config.max_files {
            tracing::warn!(
                "[Scanner] Reached the limit of {} files, remaining files are not indexed",
                self.config.max_files
            );
        }
        tracing::info!(
            "[Scanner] Found {} markdown files in {} roots",
            found.len(),
            roots.len()
        );
        found
    }

    /// Scan the subtree `dir` of `root`, returning at most `limit` files.
    ///
    /// Directories that vanish mid-walk are skipped, the rest of the tree is still scanned.
    pub fn scan_dir(&self, root: &WorkspaceRoot, dir: &Path, limit: usize) -> Vec<FileInfo> {
        let mut found = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.skip(e, dir, root));
        for entry in walker {
            if found.len() >= limit {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("[Scanner] Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_markdown(entry.path()) {
                continue;
            }
            match FileInfo::from_path(root, entry.path()) {
                Ok(info) => found.push(info),
                Err(e) => {
                    tracing::debug!("[Scanner] Could not stat {:?}: {}", entry.path(), e);
                }
            }
        }
        found
    }
}
