//! In-memory state of the documents the client has open.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{error::NotedownError, paths::basepath_from_uri};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDocument {
    pub uri: String,
    pub version: i32,
    pub content: String,
    /// Filename without its last extension; empty for non-file URIs.
    pub basepath: String,
}

impl OpenDocument {
    pub fn new(uri: &str) -> Self {
        OpenDocument {
            uri: uri.to_string(),
            version: 0,
            content: String::new(),
            basepath: basepath_from_uri(uri),
        }
    }
}

/// Thread-safe map from uri to [`OpenDocument`].
///
/// Content only ever changes through client notifications; filesystem events never touch it.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: RwLock<BTreeMap<String, OpenDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `uri` with empty content. An already tracked document is left untouched.
    pub fn add(&self, uri: &str) {
        self.documents
            .write()
            .entry(uri.to_string())
            .or_insert_with(|| OpenDocument::new(uri));
    }

    /// Track `uri` with its initial content, replacing any previous state.
    pub fn open(&self, uri: &str, content: String, version: i32) -> OpenDocument {
        let mut doc = OpenDocument::new(uri);
        doc.content = content;
        doc.version = version;
        self.documents.write().insert(uri.to_string(), doc.clone());
        doc
    }

    /// Replace the content of a tracked document.
    ///
    /// Returns `Ok(false)` without changing anything when `version` is older than the stored
    /// one, so the observed version sequence never decreases.
    pub fn set(&self, uri: &str, content: String, version: i32) -> Result<bool, NotedownError> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(uri)
            .ok_or_else(|| NotedownError::NotFound(format!("Document is not open: {uri}")))?;
        if version < doc.version {
            tracing::warn!(
                "[DocumentStore] Ignoring stale change for {} (version {} < {})",
                uri,
                version,
                doc.version
            );
            return Ok(false);
        }
        doc.content = content;
        doc.version = version;
        Ok(true)
    }

    pub fn remove(&self, uri: &str) -> Option<OpenDocument> {
        self.documents.write().remove(uri)
    }

    pub fn get(&self, uri: &str) -> Option<OpenDocument> {
        self.documents.read().get(uri).cloned()
    }

    pub fn has(&self, uri: &str) -> bool {
        self.documents.read().contains_key(uri)
    }

    /// Copy of every open document, taken under one read lock.
    pub fn snapshot(&self) -> Vec<OpenDocument> {
        self.documents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basepath_only_for_file_uris() {
        let store = DocumentStore::new();
        store.add("file:///w/notes/today.md");
        store.add("untitled:Untitled-1");
        assert_eq!(store.get("file:///w/notes/today.md").unwrap().basepath, "today");
        assert_eq!(store.get("untitled:Untitled-1").unwrap().basepath, "");
    }

    #[test]
    fn test_open_set_close() {
        let store = DocumentStore::new();
        store.open("file:///w/a.md", "# Title\n".to_string(), 1);
        assert!(store.set("file:///w/a.md", "# New\n".to_string(), 2).unwrap());
        let doc = store.get("file:///w/a.md").unwrap();
        assert_eq!((doc.version, doc.content.as_str()), (2, "# New\n"));

        assert!(!store.set("file:///w/a.md", "old".to_string(), 1).unwrap());
        assert_eq!(store.get("file:///w/a.md").unwrap().version, 2);

        assert!(store.remove("file:///w/a.md").is_some());
        assert!(!store.has("file:///w/a.md"));
        assert!(store.set("file:///w/a.md", "x".to_string(), 3).is_err());
    }

    #[test]
    fn test_concurrent_versions_are_monotone() {
        let store = Arc::new(DocumentStore::new());
        store.open("file:///w/a.md", String::new(), 0);
        let handles: Vec<_> = (1..=16)
            .map(|version| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let _ = store.set("file:///w/a.md", format!("v{version}"), version);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let doc = store.get("file:///w/a.md").unwrap();
        assert_eq!(doc.version, 16);
        assert_eq!(doc.content, "v16");
    }
}
