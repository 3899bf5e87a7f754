use lsp_types::FileChangeType;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Normalised filesystem event kinds emitted by the recursive watcher.
///
/// Renames are reported as a `Remove` of the old path; the new path arrives as a separate
/// `Create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsEventKind {
    Create,
    Remove,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FsEventKind) -> Self {
        FsEvent {
            path: path.into(),
            kind,
        }
    }

    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Create)
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Remove)
    }

    pub fn write(path: impl Into<PathBuf>) -> Self {
        Self::new(path, FsEventKind::Write)
    }
}

impl Display for FsEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let kind = match self.kind {
            FsEventKind::Create => "Create",
            FsEventKind::Remove => "Remove",
            FsEventKind::Write => "Write",
        };
        write!(f, "{kind}({})", self.path.display())
    }
}

/// File-level change applied to the workspace indices, whether it came from the client
/// (`workspace/didChangeWatchedFiles`) or from the local watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl From<FsEventKind> for FileChangeKind {
    fn from(kind: FsEventKind) -> Self {
        match kind {
            FsEventKind::Create => FileChangeKind::Created,
            FsEventKind::Write => FileChangeKind::Changed,
            FsEventKind::Remove => FileChangeKind::Deleted,
        }
    }
}

impl TryFrom<FileChangeType> for FileChangeKind {
    type Error = FileChangeType;

    fn try_from(kind: FileChangeType) -> Result<Self, Self::Error> {
        if kind == FileChangeType::CREATED {
            Ok(FileChangeKind::Created)
        } else if kind == FileChangeType::CHANGED {
            Ok(FileChangeKind::Changed)
        } else if kind == FileChangeType::DELETED {
            Ok(FileChangeKind::Deleted)
        } else {
            Err(kind)
        }
    }
}
