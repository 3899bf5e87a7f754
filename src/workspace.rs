//! Long-lived workspace state shared by the server, the watcher and the CLI.
//!
//! A [`Workspace`] owns the file index, the wikilink index and the document cache for an ordered
//! set of roots. File-level changes, whether reported by an LSP client or by the local watcher,
//! go through [`Workspace::apply_file_change`] so both sources keep the indices coherent in the
//! same way.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::DocumentCache,
    config::NotedownConfig,
    error::NotedownError,
    event::FileChangeKind,
    filter::FilterExpression,
    index::{resolve_target, FileIndex, FileInfo, WikilinkIndex, WorkspaceRoot},
    paths::{is_markdown, os_path_to_string, uri_to_path},
    pipeline::{Pipeline, PipelineOutput},
    scanner::Scanner,
};

#[derive(Debug)]
pub struct Workspace {
    config: Arc<NotedownConfig>,
    files: FileIndex,
    wikilinks: WikilinkIndex,
    cache: Arc<DocumentCache>,
    scanner: Scanner,
}

impl Workspace {
    /// The cache is persisted in the first root; without roots it lives in memory only.
    pub fn new(config: Arc<NotedownConfig>, roots: Vec<WorkspaceRoot>) -> Self {
        let cache = match roots.first() {
            Some(root) => DocumentCache::load(DocumentCache::path_for_root(&root.path)),
            None => DocumentCache::in_memory(),
        };
        Self::with_cache(config, roots, Arc::new(cache))
    }

    pub fn with_cache(
        config: Arc<NotedownConfig>,
        roots: Vec<WorkspaceRoot>,
        cache: Arc<DocumentCache>,
    ) -> Self {
        Workspace {
            scanner: Scanner::new(config.clone()),
            config,
            files: FileIndex::new(roots),
            wikilinks: WikilinkIndex::new(),
            cache,
        }
    }

    pub fn config(&self) -> &Arc<NotedownConfig> {
        &self.config
    }

    pub fn files(&self) -> &FileIndex {
        &self.files
    }

    pub fn wikilinks(&self) -> &WikilinkIndex {
        &self.wikilinks
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn roots(&self) -> Vec<WorkspaceRoot> {
        self.files.roots()
    }

    pub fn add_root(&self, root: WorkspaceRoot) -> bool {
        self.files.add_root(root)
    }

    pub fn remove_root(&self, uri: &str) -> Option<WorkspaceRoot> {
        let removed = self.files.remove_root(uri);
        if removed.is_some() {
            self.refresh_matches();
        }
        removed
    }

    /// Full rescan of every root. Replaces the file index and re-resolves wikilink targets.
    #[tracing::instrument(skip_all)]
    pub fn scan(&self) -> usize {
        let found = self.scanner.scan(&self.files.roots());
        let count = found.len();
        self.files.replace_all(found);
        self.refresh_matches();
        count
    }

    /// Run [`Workspace::scan`] on the blocking pool.
    pub fn scan_async(self: &Arc<Self>) -> JoinHandle<usize> {
        let workspace = self.clone();
        tokio::task::spawn_blocking(move || workspace.scan())
    }

    /// Re-resolve every tracked wikilink target against the current file index.
    pub fn refresh_matches(&self) {
        self.wikilinks.refresh_matches(&self.files.relative_paths());
    }

    /// Replace the references originating at `uri` with the ones in `content`.
    pub fn refresh_document(&self, uri: &str, content: &str) {
        self.wikilinks
            .refresh_document(uri, content, &self.files.relative_paths());
    }

    /// Workspace-relative paths the target resolves to.
    pub fn resolve(&self, target: &str) -> BTreeSet<String> {
        resolve_target(target, self.files.relative_paths().iter())
    }

    /// Absolute path of a workspace-relative path, looked up in the file index first and
    /// otherwise placed under the first root.
    pub fn absolute_path(&self, relative: &str) -> Option<PathBuf> {
        if let Some(path) = self.files.find_by_path(relative).and_then(|f| f.fs_path()) {
            return Some(path);
        }
        self.files.roots().first().map(|root| root.path.join(relative))
    }

    /// Hidden or excluded relative to its root. Paths outside every root are never ignored.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(root) = self.files.root_for(path) else {
            return false;
        };
        let Ok(relative) = path.strip_prefix(&root.path) else {
            return false;
        };
        let hidden = relative.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.'))
                .unwrap_or(false)
        });
        hidden || self.config.is_excluded(&os_path_to_string(relative))
    }

    /// Apply one created/changed/deleted notification to the file index.
    ///
    /// Created directories are scanned, deleted paths drop every entry below them and cached
    /// summaries of deleted files are invalidated. Returns whether the index changed; wikilink
    /// targets are re-resolved whenever it did.
    pub fn apply_file_change(&self, uri: &str, kind: FileChangeKind) -> Result<bool, NotedownError> {
        let path = uri_to_path(uri)
            .ok_or_else(|| NotedownError::NotFound(format!("Not a file URI: {uri}")))?;
        if self.is_ignored(&path) {
            return Ok(false);
        }
        let changed = match kind {
            FileChangeKind::Created | FileChangeKind::Changed if path.is_dir() => {
                if kind == FileChangeKind::Created {
                    self.index_directory(&path)
                } else {
                    false
                }
            }
            FileChangeKind::Created | FileChangeKind::Changed => {
                if !is_markdown(&path) {
                    return Ok(false);
                }
                let before = self.files.get(uri);
                if before.is_none() && self.files.len() >= self.config.max_files {
                    tracing::debug!("[Workspace] File limit reached, not indexing {}", uri);
                    return Ok(false);
                }
                let info = self.files.add(uri)?;
                before.as_ref() != Some(&info)
            }
            FileChangeKind::Deleted => {
                let mut removed = self.files.remove_prefix(uri);
                removed.extend(self.files.remove(uri));
                for info in removed.iter() {
                    self.cache.invalidate(&info.path);
                }
                !removed.is_empty()
            }
        };
        if changed {
            tracing::debug!("[Workspace] {:?} {}", kind, uri);
            self.refresh_matches();
        }
        Ok(changed)
    }

    fn index_directory(&self, dir: &Path) -> bool {
        let Some(root) = self.files.root_for(dir) else {
            return false;
        };
        let limit = self.config.max_files.saturating_sub(self.files.len());
        let found = self.scanner.scan_dir(&root, dir, limit);
        let changed = !found.is_empty();
        for info in found {
            self.files.insert(info);
        }
        changed
    }

    /// A pipeline bound to this workspace's configuration and cache.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(&self.config).with_cache(self.cache.clone())
    }

    /// Run the pipeline over every indexed file.
    pub async fn list_documents(
        &self,
        filter: Option<FilterExpression>,
        cancel: CancellationToken,
    ) -> PipelineOutput {
        let mut files: Vec<FileInfo> = self.files.list();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        self.pipeline().run(files, filter, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::path_to_uri;
    use std::fs;
    use tempfile::TempDir;
    use test_log::test;

    fn workspace(files: &[&str]) -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        for rel in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, format!("# {rel}\n")).unwrap();
        }
        let root = WorkspaceRoot::from_path(dir.path()).unwrap();
        let ws = Workspace::with_cache(
            Arc::new(NotedownConfig::default()),
            vec![root],
            Arc::new(DocumentCache::in_memory()),
        );
        ws.scan();
        (dir, ws)
    }

    fn uri(dir: &TempDir, rel: &str) -> String {
        path_to_uri(&dir.path().join(rel)).unwrap()
    }

    #[test]
    fn test_scan_and_resolve() {
        let (_dir, ws) = workspace(&["docs/a.md", "notes/a.md", "b.md"]);
        assert_eq!(ws.files().len(), 3);
        assert_eq!(ws.resolve("a").len(), 2);
        assert_eq!(
            ws.resolve("b"),
            BTreeSet::from(["b.md".to_string()])
        );
    }

    #[test]
    fn test_file_changes_update_matches() {
        let (dir, ws) = workspace(&["docs/a.md"]);
        ws.refresh_document("file:///open.md", "[[a]]");
        assert!(!ws.wikilinks().get_target("a").unwrap().is_ambiguous);

        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/a.md"), "x").unwrap();
        assert!(ws
            .apply_file_change(&uri(&dir, "notes/a.md"), FileChangeKind::Created)
            .unwrap());
        assert!(ws.wikilinks().get_target("a").unwrap().is_ambiguous);

        fs::remove_file(dir.path().join("notes/a.md")).unwrap();
        assert!(ws
            .apply_file_change(&uri(&dir, "notes/a.md"), FileChangeKind::Deleted)
            .unwrap());
        assert!(!ws.wikilinks().get_target("a").unwrap().is_ambiguous);
    }

    #[test]
    fn test_directory_create_and_delete() {
        let (dir, ws) = workspace(&[]);
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/one.md"), "1").unwrap();
        fs::write(dir.path().join("x/y/two.md"), "2").unwrap();
        assert!(ws
            .apply_file_change(&uri(&dir, "x"), FileChangeKind::Created)
            .unwrap());
        assert_eq!(ws.files().relative_paths(), vec!["x/one.md", "x/y/two.md"]);

        fs::remove_dir_all(dir.path().join("x")).unwrap();
        assert!(ws
            .apply_file_change(&uri(&dir, "x"), FileChangeKind::Deleted)
            .unwrap());
        assert!(ws.files().is_empty());
    }

    #[test]
    fn test_ignored_and_non_markdown_changes() {
        let (dir, ws) = workspace(&[]);
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/a.md"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join(".draft.md"), "x").unwrap();
        for rel in ["node_modules/a.md", "notes.txt", ".draft.md"] {
            assert!(!ws
                .apply_file_change(&uri(&dir, rel), FileChangeKind::Created)
                .unwrap());
        }
        assert!(ws.files().is_empty());
        assert!(ws
            .apply_file_change("untitled:Untitled-1", FileChangeKind::Created)
            .is_err());
    }

    #[test]
    fn test_unchanged_file_reports_no_change() {
        let (dir, ws) = workspace(&["a.md"]);
        assert!(!ws
            .apply_file_change(&uri(&dir, "a.md"), FileChangeKind::Changed)
            .unwrap());
    }

    #[test(tokio::test)]
    async fn test_list_documents_with_empty_roots() {
        let ws = Workspace::new(Arc::new(NotedownConfig::default()), vec![]);
        assert_eq!(ws.scan(), 0);
        let output = ws.list_documents(None, CancellationToken::new()).await;
        assert!(output.records.is_empty());
        assert!(output.status().is_ok());
    }
}
