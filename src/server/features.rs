//! Request handlers that only read an open document and the workspace indices.

use lsp_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, CompletionItem, CompletionItemKind,
    CreateFile, CreateFileOptions, DocumentChangeOperation, DocumentChanges, FoldingRange,
    FoldingRangeKind, Location, Position as LspPosition, ResourceOp, Url, WorkspaceEdit,
};
use std::collections::BTreeMap;

use crate::{
    codec::{scan_wikilinks, Document, LineIndex, NodeKind, WikilinkMatch},
    paths::{basename, path_to_uri},
    workspace::Workspace,
};

/// The wikilink under `offset`, brackets included.
pub fn wikilink_at(content: &str, offset: usize) -> Option<WikilinkMatch> {
    scan_wikilinks(content)
        .into_iter()
        .find(|link| link.range.start <= offset && offset < link.range.end)
}

/// One location per file the wikilink under the cursor resolves to.
pub fn definition(content: &str, position: LspPosition, workspace: &Workspace) -> Vec<Location> {
    let lines = LineIndex::new(content);
    let Some(link) = wikilink_at(content, lines.offset(position)) else {
        return Vec::new();
    };
    workspace
        .resolve(&link.target)
        .iter()
        .filter_map(|path| {
            let uri = match workspace.files().find_by_path(path) {
                Some(info) => info.uri,
                None => path_to_uri(&workspace.absolute_path(path)?).ok()?,
            };
            Some(Location::new(Url::parse(&uri).ok()?, lsp_types::Range::default()))
        })
        .collect()
}

/// The partial target typed after an unclosed `[[` on the cursor line.
pub fn completion_prefix(line_before_cursor: &str) -> Option<&str> {
    let open = line_before_cursor.rfind("[[")?;
    let partial = &line_before_cursor[open + 2..];
    if partial.contains("]]") || partial.contains('|') {
        return None;
    }
    Some(partial)
}

/// Wikilink completions: one item per indexed file whose name or path starts with the prefix.
///
/// The inserted text is the bare name unless several files share it, in which case the path
/// without `.md` keeps the reference unambiguous.
pub fn completion(
    content: &str,
    position: LspPosition,
    workspace: &Workspace,
) -> Vec<CompletionItem> {
    let lines = LineIndex::new(content);
    let offset = lines.offset(position);
    let line_start = lines.line_start(lines.line_of(offset));
    let Some(prefix) = completion_prefix(&content[line_start..offset]) else {
        return Vec::new();
    };
    let prefix = prefix.trim_start().to_lowercase();

    let mut paths = workspace.files().relative_paths();
    paths.sort();
    let mut name_counts: BTreeMap<String, usize> = BTreeMap::new();
    for path in paths.iter() {
        *name_counts.entry(note_name(path).to_string()).or_default() += 1;
    }

    paths
        .iter()
        .filter(|path| {
            let stem = path.strip_suffix(".md").unwrap_or(path).to_lowercase();
            note_name(path).to_lowercase().starts_with(&prefix) || stem.starts_with(&prefix)
        })
        .map(|path| {
            let label = note_name(path).to_string();
            let insert = if name_counts.get(&label).copied().unwrap_or(0) > 1 {
                path.strip_suffix(".md").unwrap_or(path).to_string()
            } else {
                label.clone()
            };
            CompletionItem {
                label,
                kind: Some(CompletionItemKind::FILE),
                detail: Some(path.clone()),
                insert_text: Some(insert),
                ..Default::default()
            }
        })
        .collect()
}

fn note_name(path: &str) -> &str {
    let name = basename(path);
    name.strip_suffix(".md").unwrap_or(name)
}

/// Heading sections, fenced code blocks and multi-line list items, in 0-based lines.
pub fn folding_ranges(content: &str, doc: &Document) -> Vec<FoldingRange> {
    let lines = LineIndex::new(content);
    let last_line = lines.line_count().saturating_sub(1);
    let mut ranges = Vec::new();

    let headings: Vec<(usize, u8)> = doc
        .headings()
        .map(|(node, level, _)| (node.range.start.line - 1, level))
        .collect();
    for (idx, (start, level)) in headings.iter().enumerate() {
        let next = headings[idx + 1..]
            .iter()
            .find(|(_, other)| other <= level)
            .map(|(line, _)| *line);
        let mut end = match next {
            Some(line) => line.saturating_sub(1),
            None => last_line,
        };
        while end > *start && lines.line_text(end).trim().is_empty() {
            end -= 1;
        }
        push_range(&mut ranges, *start, end, FoldingRangeKind::Region);
    }

    for (_, node) in doc.nodes() {
        let fold = match &node.kind {
            NodeKind::CodeBlock { fenced: true, .. } => true,
            NodeKind::ListItem { .. } => true,
            _ => false,
        };
        if !fold || node.range.end.offset == 0 {
            continue;
        }
        let start = node.range.start.line - 1;
        let mut end = lines.line_of(node.range.end.offset - 1);
        while end > start && lines.line_text(end).trim().is_empty() {
            end -= 1;
        }
        push_range(&mut ranges, start, end, FoldingRangeKind::Region);
    }
    ranges.sort_by_key(|range| (range.start_line, range.end_line));
    ranges
}

fn push_range(ranges: &mut Vec<FoldingRange>, start: usize, end: usize, kind: FoldingRangeKind) {
    if end <= start {
        return;
    }
    ranges.push(FoldingRange {
        start_line: start as u32,
        start_character: None,
        end_line: end as u32,
        end_character: None,
        kind: Some(kind),
        collapsed_text: None,
    });
}

/// "Create note" for a wikilink under the cursor that resolves to no file.
pub fn code_actions(
    content: &str,
    position: LspPosition,
    workspace: &Workspace,
) -> Vec<CodeActionOrCommand> {
    let lines = LineIndex::new(content);
    let Some(link) = wikilink_at(content, lines.offset(position)) else {
        return Vec::new();
    };
    if !workspace.resolve(&link.target).is_empty() {
        return Vec::new();
    }
    let file_name = if link.target.ends_with(".md") {
        link.target.clone()
    } else {
        format!("{}.md", link.target)
    };
    let Some(uri) = workspace
        .absolute_path(&file_name)
        .and_then(|path| path_to_uri(&path).ok())
        .and_then(|uri| Url::parse(&uri).ok())
    else {
        return Vec::new();
    };
    let edit = WorkspaceEdit {
        document_changes: Some(DocumentChanges::Operations(vec![
            DocumentChangeOperation::Op(ResourceOp::Create(CreateFile {
                uri,
                options: Some(CreateFileOptions {
                    overwrite: Some(false),
                    ignore_if_exists: Some(true),
                }),
                annotation_id: None,
            })),
        ])),
        ..Default::default()
    };
    vec![CodeActionOrCommand::CodeAction(CodeAction {
        title: format!("Create note '{}'", link.target),
        kind: Some(CodeActionKind::QUICKFIX),
        edit: Some(edit),
        ..Default::default()
    })]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::DocumentCache, codec::Parser, config::NotedownConfig, index::WorkspaceRoot};
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

    #[test]
    fn test_definition() {
        let (_dir, ws) = workspace(&["docs/a.md", "notes/a.md", "b.md"]);
        let content = "link to [[a]] and [[b|bee]]\n";
        let locations = definition(content, LspPosition::new(0, 10), &ws);
        assert_eq!(locations.len(), 2);
        assert!(locations[0].uri.path().ends_with("docs/a.md"));

        let locations = definition(content, LspPosition::new(0, 21), &ws);
        assert_eq!(locations.len(), 1);
        assert!(locations[0].uri.path().ends_with("/b.md"));

        assert!(definition(content, LspPosition::new(0, 2), &ws).is_empty());
    }

    #[test]
    fn test_completion_prefix() {
        assert_eq!(completion_prefix("see [[pro"), Some("pro"));
        assert_eq!(completion_prefix("see [["), Some(""));
        assert_eq!(completion_prefix("see [[done]] then"), None);
        assert_eq!(completion_prefix("see [[a|dis"), None);
        assert_eq!(completion_prefix("no link"), None);
    }

    #[test]
    fn test_completion() {
        let (_dir, ws) = workspace(&["docs/a.md", "notes/a.md", "Project.md", "plan.md"]);
        let content = "[[p";
        let items = completion(content, LspPosition::new(0, 3), &ws);
        let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["Project", "plan"]);
        assert_eq!(items[0].detail.as_deref(), Some("Project.md"));

        let items = completion("[[a", LspPosition::new(0, 3), &ws);
        let inserts: Vec<&str> = items
            .iter()
            .filter_map(|i| i.insert_text.as_deref())
            .collect();
        assert_eq!(inserts, vec!["docs/a", "notes/a"]);

        assert!(completion("plain", LspPosition::new(0, 5), &ws).is_empty());
    }

    #[test]
    fn test_folding_ranges() {
        let content = "# One\ntext\n\n## Two\nmore\n\n# Three\n```rust\nfn a() {}\n```\n- item\n  continued\n";
        let doc = Parser::default().parse(content);
        let ranges: Vec<(u32, u32)> = folding_ranges(content, &doc)
            .iter()
            .map(|r| (r.start_line, r.end_line))
            .collect();
        assert!(ranges.contains(&(0, 4)));
        assert!(ranges.contains(&(3, 4)));
        assert!(ranges.contains(&(6, 11)));
        assert!(ranges.contains(&(7, 9)));
        assert!(ranges.contains(&(10, 11)));
    }

    #[test]
    fn test_create_note_action() {
        let (dir, ws) = workspace(&["b.md"]);
        let content = "[[b]] and [[ideas/new]]\n";
        assert!(code_actions(content, LspPosition::new(0, 2), &ws).is_empty());

        let actions = code_actions(content, LspPosition::new(0, 14), &ws);
        assert_eq!(actions.len(), 1);
        let CodeActionOrCommand::CodeAction(action) = &actions[0] else {
            panic!("expected a code action");
        };
        assert_eq!(action.title, "Create note 'ideas/new'");
        let Some(DocumentChanges::Operations(ops)) =
            action.edit.as_ref().and_then(|e| e.document_changes.as_ref())
        else {
            panic!("expected resource operations");
        };
        let DocumentChangeOperation::Op(ResourceOp::Create(create)) = &ops[0] else {
            panic!("expected a create operation");
        };
        let expected = Url::from_file_path(dir.path().join("ideas/new.md")).unwrap();
        assert_eq!(create.uri, expected);
    }
}
