use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::NotedownError,
    index::WorkspaceRoot,
    paths::{os_path_to_string, path_to_uri, relative_path, uri_to_path},
};

/// Lightweight file record. Uniquely keyed by `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    pub uri: String,
    /// Workspace-relative path with forward slashes.
    pub path: String,
    /// Modification time in milliseconds since the unix epoch.
    pub mtime: i64,
    pub size: u64,
}

impl FileInfo {
    /// Stat `path` and describe it relative to `root`.
    pub fn from_path(root: &WorkspaceRoot, path: &Path) -> Result<FileInfo, NotedownError> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(NotedownError::NotFound(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(FileInfo {
            uri: path_to_uri(path)?,
            path: relative_path(&root.path, path)?,
            mtime: metadata.modified().map(mtime_millis).unwrap_or_default(),
            size: metadata.len(),
        })
    }

    /// Absolute filesystem path, when the uri is a file uri.
    pub fn fs_path(&self) -> Option<std::path::PathBuf> {
        uri_to_path(&self.uri)
    }
}

pub fn mtime_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

/// Concurrent map from file URI to [`FileInfo`].
///
/// The index also owns the ordered workspace roots, since relative paths are derived from them.
/// Readers always receive owned copies.
#[derive(Debug, Default)]
pub struct FileIndex {
    roots: RwLock<Vec<WorkspaceRoot>>,
    files: RwLock<BTreeMap<String, FileInfo>>,
}

impl FileIndex {
    pub fn new(roots: Vec<WorkspaceRoot>) -> Self {
        FileIndex {
            roots: RwLock::new(roots),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn roots(&self) -> Vec<WorkspaceRoot> {
        self.roots.read().clone()
    }

    /// Append a root unless one with the same uri is present. Returns whether it was added.
    pub fn add_root(&self, root: WorkspaceRoot) -> bool {
        let mut roots = self.roots.write();
        if roots.iter().any(|r| r.uri == root.uri) {
            return false;
        }
        roots.push(root);
        true
    }

    /// Remove a root and every file indexed below it.
    pub fn remove_root(&self, uri: &str) -> Option<WorkspaceRoot> {
        let removed = {
            let mut roots = self.roots.write();
            let idx = roots.iter().position(|r| r.uri == uri)?;
            roots.remove(idx)
        };
        let remaining = self.roots();
        self.files.write().retain(|_, info| {
            info.fs_path()
                .map(|path| {
                    !removed.contains(&path) || remaining.iter().any(|r| r.contains(&path))
                })
                .unwrap_or(true)
        });
        Some(removed)
    }

    /// The innermost root containing `path`.
    pub fn root_for(&self, path: &Path) -> Option<WorkspaceRoot> {
        self.roots
            .read()
            .iter()
            .filter(|root| root.contains(path))
            .max_by_key(|root| root.path.components().count())
            .cloned()
    }

    /// Stat the file behind `uri` and insert or update its entry.
    pub fn add(&self, uri: &str) -> Result<FileInfo, NotedownError> {
        let path = uri_to_path(uri)
            .ok_or_else(|| NotedownError::NotFound(format!("Not a file URI: {uri}")))?;
        let info = match self.root_for(&path) {
            Some(root) => FileInfo::from_path(&root, &path)?,
            None => {
                let metadata = std::fs::metadata(&path)?;
                FileInfo {
                    uri: uri.to_string(),
                    path: os_path_to_string(&path),
                    mtime: metadata.modified().map(mtime_millis).unwrap_or_default(),
                    size: metadata.len(),
                }
            }
        };
        self.insert(info.clone());
        Ok(info)
    }

    pub fn insert(&self, info: FileInfo) {
        self.files.write().insert(info.uri.clone(), info);
    }

    pub fn remove(&self, uri: &str) -> Option<FileInfo> {
        self.files.write().remove(uri)
    }

    /// Remove every entry whose uri lies below `dir_uri`. Used when a directory disappears.
    pub fn remove_prefix(&self, dir_uri: &str) -> Vec<FileInfo> {
        let prefix = format!("{}/", dir_uri.trim_end_matches('/'));
        let mut files = self.files.write();
        let doomed: Vec<String> = files
            .keys()
            .filter(|uri| uri.starts_with(&prefix))
            .cloned()
            .collect();
        doomed
            .into_iter()
            .filter_map(|uri| files.remove(&uri))
            .collect()
    }

    pub fn get(&self, uri: &str) -> Option<FileInfo> {
        self.files.read().get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.files.read().contains_key(uri)
    }

    /// Snapshot of all entries ordered by uri.
    pub fn list(&self) -> Vec<FileInfo> {
        self.files.read().values().cloned().collect()
    }

    /// Workspace-relative paths of all entries, used for target resolution.
    pub fn relative_paths(&self) -> Vec<String> {
        self.files
            .read()
            .values()
            .map(|info| info.path.clone())
            .collect()
    }

    /// Find the entry for a workspace-relative path.
    pub fn find_by_path(&self, path: &str) -> Option<FileInfo> {
        self.files
            .read()
            .values()
            .find(|info| info.path == path)
            .cloned()
    }

    pub fn replace_all(&self, files: Vec<FileInfo>) {
        let map = files
            .into_iter()
            .map(|info| (info.uri.clone(), info))
            .collect::<BTreeMap<String, FileInfo>>();
        *self.files.write() = map;
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}
