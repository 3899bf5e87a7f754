//! Warnings published for open documents.
//!
//! Two kinds of problems are reported: wikilinks whose target resolves to more than one
//! workspace file, and list items that look like tasks but carry a state outside the configured
//! vocabulary.

use lsp_types::{Diagnostic, DiagnosticRelatedInformation, DiagnosticSeverity, Location, Url};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    codec::{scan_wikilinks, Document, LineIndex, NodeKind},
    config::TaskVocabulary,
    paths::path_to_uri,
    workspace::Workspace,
};

pub const DIAGNOSTIC_SOURCE: &str = "notedown";

/// A list marker followed by something shaped like a checkbox.
pub static TASK_CANDIDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*([-*+]|\d+\.)[ \t]*\[([^\]\n]*)\][ \t]").expect("valid task regex")
});

pub fn ambiguous_message(target: &str, files: &[String]) -> String {
    format!(
        "Ambiguous wikilink '{}' matches multiple files: {}",
        target,
        files.join(", ")
    )
}

pub fn invalid_task_message(state: &str, vocabulary: &TaskVocabulary) -> String {
    format!(
        "Invalid task state '{}'. Valid states: {}",
        state,
        vocabulary.describe_values()
    )
}

/// Every diagnostic for one document. `doc` must be the parse of `content`.
pub fn compute(
    content: &str,
    doc: &Document,
    workspace: &Workspace,
    vocabulary: &TaskVocabulary,
) -> Vec<Diagnostic> {
    let lines = LineIndex::new(content);
    let mut diagnostics = ambiguous_wikilinks(content, &lines, workspace);
    diagnostics.extend(invalid_tasks(content, &lines, doc, vocabulary));
    diagnostics
}

/// One warning per textual occurrence of an ambiguous target.
pub fn ambiguous_wikilinks(
    content: &str,
    lines: &LineIndex<'_>,
    workspace: &Workspace,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for link in scan_wikilinks(content) {
        let Some(info) = workspace.wikilinks().get_target(&link.target) else {
            continue;
        };
        if !info.is_ambiguous {
            continue;
        }
        let files: Vec<String> = info.matching_files.iter().cloned().collect();
        let related = files
            .iter()
            .filter_map(|path| {
                let uri = file_url(workspace, path)?;
                Some(DiagnosticRelatedInformation {
                    location: Location::new(uri, lsp_types::Range::default()),
                    message: format!("Matches {path}"),
                })
            })
            .collect::<Vec<_>>();
        diagnostics.push(Diagnostic {
            range: lines.lsp_range(link.range.start, link.range.end),
            severity: Some(DiagnosticSeverity::WARNING),
            source: Some(DIAGNOSTIC_SOURCE.to_string()),
            message: ambiguous_message(&link.target, &files),
            related_information: Some(related),
            ..Default::default()
        });
    }
    diagnostics
}

/// Checkbox-shaped list markers whose state is not part of the vocabulary.
///
/// A candidate is skipped when the AST has a task item starting inside it, or when it sits in
/// a code block.
pub fn invalid_tasks(
    content: &str,
    lines: &LineIndex<'_>,
    doc: &Document,
    vocabulary: &TaskVocabulary,
) -> Vec<Diagnostic> {
    let task_starts: Vec<usize> = doc
        .tasks()
        .map(|(_, node, _)| node.range.start.offset)
        .collect();
    let code_ranges: Vec<_> = doc
        .nodes()
        .filter(|(_, node)| matches!(node.kind, NodeKind::CodeBlock { .. }))
        .map(|(_, node)| node.range)
        .collect();

    let mut diagnostics = Vec::new();
    for caps in TASK_CANDIDATE_RE.captures_iter(content) {
        let (Some(whole), Some(state)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let span = whole.range();
        if task_starts.iter().any(|start| span.contains(start)) {
            continue;
        }
        if code_ranges.iter().any(|range| range.covers(&span)) {
            continue;
        }
        if vocabulary.contains(state.as_str()) {
            continue;
        }
        // The brackets around the state.
        let start = state.start() - 1;
        let end = state.end() + 1;
        diagnostics.push(Diagnostic {
            range: lines.lsp_range(start, end),
            severity: Some(DiagnosticSeverity::WARNING),
            source: Some(DIAGNOSTIC_SOURCE.to_string()),
            message: invalid_task_message(state.as_str(), vocabulary),
            ..Default::default()
        });
    }
    diagnostics
}

fn file_url(workspace: &Workspace, relative: &str) -> Option<Url> {
    let uri = match workspace.files().find_by_path(relative) {
        Some(info) => info.uri,
        None => path_to_uri(&workspace.absolute_path(relative)?).ok()?,
    };
    Url::parse(&uri).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::DocumentCache,
        codec::Parser,
        config::{NotedownConfig, TaskState},
        index::WorkspaceRoot,
    };
    use std::{fs, sync::Arc};
    use tempfile::TempDir;
    use test_log::test;

    fn workspace(files: &[&str]) -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        for rel in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "# note\n").unwrap();
        }
        let ws = Workspace::with_cache(
            Arc::new(NotedownConfig::default()),
            vec![WorkspaceRoot::from_path(dir.path()).unwrap()],
            Arc::new(DocumentCache::in_memory()),
        );
        ws.scan();
        (dir, ws)
    }

    fn vocabulary() -> TaskVocabulary {
        TaskVocabulary::new(vec![
            TaskState::new(" ", "todo"),
            TaskState::new("x", "done"),
            TaskState::new("wip", "in progress"),
        ])
        .unwrap()
    }

    #[test]
    fn test_ambiguous_wikilink() {
        let (_dir, ws) = workspace(&["docs/a.md", "notes/a.md", "b.md"]);
        let content = "See [[a]] and [[b]].\n\nAgain [[a|other]]\n";
        ws.refresh_document("file:///open.md", content);
        let doc = Parser::default().parse(content);

        let diagnostics = compute(content, &doc, &ws, &TaskVocabulary::default());
        assert_eq!(diagnostics.len(), 2);
        let first = &diagnostics[0];
        assert_eq!(
            first.message,
            "Ambiguous wikilink 'a' matches multiple files: docs/a.md, notes/a.md"
        );
        assert_eq!(first.severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(first.range.start, lsp_types::Position::new(0, 4));
        assert_eq!(first.range.end, lsp_types::Position::new(0, 9));
        let related = first.related_information.as_ref().unwrap();
        assert_eq!(related.len(), 2);
        assert!(related[0].location.uri.path().ends_with("docs/a.md"));
        assert!(related[1].location.uri.path().ends_with("notes/a.md"));
        assert_eq!(diagnostics[1].range.start.line, 2);
    }

    #[test]
    fn test_unambiguous_after_delete() {
        let (dir, ws) = workspace(&["docs/a.md", "notes/a.md"]);
        let content = "[[a]]\n";
        ws.refresh_document("file:///open.md", content);
        fs::remove_file(dir.path().join("notes/a.md")).unwrap();
        ws.scan();
        let doc = Parser::default().parse(content);
        assert!(compute(content, &doc, &ws, &TaskVocabulary::default()).is_empty());
    }

    #[test]
    fn test_invalid_task_states() {
        let (_dir, ws) = workspace(&[]);
        let vocabulary = vocabulary();
        let content = "- [x] ok\n- [done] bad\n[x] not-a-task\n- [wip] going\n";
        let doc = Parser::new(vocabulary.clone()).parse(content);

        let diagnostics = compute(content, &doc, &ws, &vocabulary);
        assert_eq!(diagnostics.len(), 1);
        let diagnostic = &diagnostics[0];
        assert_eq!(diagnostic.range.start, lsp_types::Position::new(1, 2));
        assert_eq!(diagnostic.range.end, lsp_types::Position::new(1, 8));
        assert_eq!(
            diagnostic.message,
            "Invalid task state 'done'. Valid states: ' ', 'x', 'wip'"
        );
    }

    #[test]
    fn test_nested_invalid_task_under_valid_parent() {
        let vocabulary = vocabulary();
        let content = "- [x] parent\n  - [nope] child\n";
        let doc = Parser::new(vocabulary.clone()).parse(content);
        let diagnostics = invalid_tasks(content, &LineIndex::new(content), &doc, &vocabulary);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].range.start.line, 1);
    }

    #[test]
    fn test_code_blocks_are_not_diagnosed() {
        let vocabulary = vocabulary();
        let content = "```md\n- [later] example\n```\n";
        let doc = Parser::new(vocabulary.clone()).parse(content);
        assert!(invalid_tasks(content, &LineIndex::new(content), &doc, &vocabulary).is_empty());
    }
}
