//! Shared read-mostly workspace state: the file index and the wikilink index.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{
    error::NotedownError,
    paths::{path_to_uri, uri_to_path},
};

pub mod files;
pub mod wikilinks;

pub use files::{FileIndex, FileInfo};
pub use wikilinks::{resolve_target, WikilinkIndex, WikilinkTargetInfo};

/// A workspace folder. Multiple roots are allowed and their order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceRoot {
    pub uri: String,
    pub path: PathBuf,
    pub name: String,
}

impl WorkspaceRoot {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, NotedownError> {
        let path = path.as_ref().to_path_buf();
        let uri = path_to_uri(&path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| uri.clone());
        Ok(WorkspaceRoot { uri, path, name })
    }

    pub fn from_uri(uri: &str, name: Option<&str>) -> Result<Self, NotedownError> {
        let path = uri_to_path(uri)
            .ok_or_else(|| NotedownError::Protocol(format!("Not a file URI: {uri}")))?;
        let mut root = WorkspaceRoot::from_path(path)?;
        if let Some(name) = name {
            root.name = name.to_string();
        }
        Ok(root)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}
