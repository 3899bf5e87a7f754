//! Cross-reference index over wiki-style links.
//!
//! For every target the index records which workspace files it resolves to and which documents
//! reference it. A reverse map from document to targets lets a document be refreshed by first
//! removing all of its old references; both steps happen under one write lock, so readers never
//! observe a half-refreshed document.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    codec::scan_wikilinks,
    paths::{normalize_slashes, strip_markdown_extension},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WikilinkTargetInfo {
    pub target: String,
    pub matching_files: BTreeSet<String>,
    pub is_ambiguous: bool,
    pub referenced_by: BTreeSet<String>,
}

impl WikilinkTargetInfo {
    fn new(target: &str) -> Self {
        WikilinkTargetInfo {
            target: target.to_string(),
            ..Default::default()
        }
    }

    fn set_matches(&mut self, matches: BTreeSet<String>) {
        self.is_ambiguous = matches.len() > 1;
        self.matching_files = matches;
    }

    /// Referenced somewhere but resolving to no file.
    pub fn is_non_existent(&self) -> bool {
        self.matching_files.is_empty() && !self.referenced_by.is_empty()
    }
}

/// Normalise a target for matching. Returns `None` for targets climbing out of the workspace.
pub fn normalize_target(target: &str) -> Option<String> {
    let target = normalize_slashes(target.trim());
    let target = strip_markdown_extension(&target).to_string();
    if target.is_empty() || target.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(target)
}

/// Resolve `target` against workspace-relative file paths.
///
/// A file matches when its path, or its basename, equals the target once `.md` is removed.
/// The extension is matched case-insensitively, the rest of the path is not.
pub fn resolve_target<'a, I>(target: &str, files: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let Some(target) = normalize_target(target) else {
        return BTreeSet::new();
    };
    files
        .into_iter()
        .filter(|path| {
            let path = normalize_slashes(path);
            let stem = strip_markdown_extension(&path);
            let base = stem.rsplit('/').next().unwrap_or(stem);
            stem == target || base == target
        })
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
struct IndexState {
    targets: BTreeMap<String, WikilinkTargetInfo>,
    by_document: HashMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn drop_document(&mut self, uri: &str) {
        let Some(previous) = self.by_document.remove(uri) else {
            return;
        };
        for target in previous {
            if let Some(info) = self.targets.get_mut(&target) {
                info.referenced_by.remove(uri);
                if info.referenced_by.is_empty() {
                    self.targets.remove(&target);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct WikilinkIndex {
    state: RwLock<IndexState>,
}

impl WikilinkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every reference originating at `uri` with the ones found in `content`.
    pub fn refresh_document(&self, uri: &str, content: &str, workspace_files: &[String]) {
        let targets: BTreeSet<String> = scan_wikilinks(content)
            .into_iter()
            .map(|link| link.target)
            .collect();
        let mut state = self.state.write();
        state.drop_document(uri);
        for target in targets.iter() {
            let matches = resolve_target(target, workspace_files.iter());
            let info = state
                .targets
                .entry(target.clone())
                .or_insert_with(|| WikilinkTargetInfo::new(target));
            info.set_matches(matches);
            info.referenced_by.insert(uri.to_string());
        }
        if !targets.is_empty() {
            state.by_document.insert(uri.to_string(), targets);
        }
        tracing::trace!(
            "[WikilinkIndex] Refreshed {} ({} targets tracked)",
            uri,
            state.targets.len()
        );
    }

    /// Forget every reference originating at `uri`.
    pub fn remove_document(&self, uri: &str) {
        self.state.write().drop_document(uri);
    }

    /// Recompute `matching_files` of every tracked target after the file index changed.
    pub fn refresh_matches(&self, workspace_files: &[String]) {
        let mut state = self.state.write();
        for (target, info) in state.targets.iter_mut() {
            info.set_matches(resolve_target(target, workspace_files.iter()));
        }
    }

    pub fn get_target(&self, target: &str) -> Option<WikilinkTargetInfo> {
        self.state.read().targets.get(target).cloned()
    }

    /// Targets referenced by `uri`.
    pub fn targets_of(&self, uri: &str) -> BTreeSet<String> {
        self.state
            .read()
            .by_document
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_targets(&self) -> BTreeMap<String, WikilinkTargetInfo> {
        self.state.read().targets.clone()
    }

    pub fn non_existent_targets(&self) -> Vec<WikilinkTargetInfo> {
        self.state
            .read()
            .targets
            .values()
            .filter(|info| info.is_non_existent())
            .cloned()
            .collect()
    }
}
