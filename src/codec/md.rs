//! Builds the [`Document`] arena from pulldown-cmark events.
//!
//! pulldown-cmark runs with no extensions enabled: task checkboxes and wiki-style references are
//! recognised here so that both follow the configured vocabulary and the reference grammar
//! exactly. Tags without a node counterpart (images, html blocks) are transparent, their children
//! attach to the enclosing node.

use pulldown_cmark::{
    CodeBlockKind, Event as MdEvent, Options, Parser as MdParser, Tag as MdTag,
};
use std::ops::Range as ByteRange;

use crate::{
    codec::{
        frontmatter, scan_wikilinks, Document, LineIndex, Node, NodeId, NodeKind, Range,
        WikilinkNode,
    },
    config::TaskVocabulary,
};

pub use pulldown_cmark;

pub fn notedown_md_options() -> Options {
    Options::empty()
}

/// Adjacent text events, merged so references split across events are still found.
#[derive(Debug)]
struct PendingText {
    range: ByteRange<usize>,
    text: String,
}

struct TreeBuilder<'s, 'v> {
    source: &'s str,
    index: LineIndex<'s>,
    vocabulary: &'v TaskVocabulary,
    nodes: Vec<Node>,
    /// One entry per open start tag; `None` for transparent tags.
    open: Vec<Option<NodeId>>,
    parents: Vec<NodeId>,
    pending: Option<PendingText>,
    /// Text of the indented code block being read.
    code_text: Option<String>,
}

impl<'s, 'v> TreeBuilder<'s, 'v> {
    fn new(source: &'s str, vocabulary: &'v TaskVocabulary) -> Self {
        let index = LineIndex::new(source);
        let root = Node {
            kind: NodeKind::Document,
            range: Range::from_offsets(&index, 0, source.len()),
            parent: None,
            children: Vec::new(),
        };
        TreeBuilder {
            source,
            index,
            vocabulary,
            nodes: vec![root],
            open: Vec::new(),
            parents: vec![NodeId::ROOT],
            pending: None,
            code_text: None,
        }
    }

    fn current(&self) -> NodeId {
        self.parents.last().copied().unwrap_or(NodeId::ROOT)
    }

    fn add(&mut self, kind: NodeKind, range: ByteRange<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let parent = self.current();
        self.nodes.push(Node {
            kind,
            range: Range::from_offsets(&self.index, range.start, range.end),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    fn open_node(&mut self, kind: NodeKind, range: ByteRange<usize>) {
        self.flush_text();
        let id = self.add(kind, range);
        self.open.push(Some(id));
        self.parents.push(id);
    }

    fn open_transparent(&mut self) {
        self.flush_text();
        self.open.push(None);
    }

    fn push_text(&mut self, text: &str, range: ByteRange<usize>) {
        if let Some(code) = self.code_text.as_mut() {
            code.push_str(text);
            return;
        }
        match self.pending.as_mut() {
            Some(pending) if pending.range.end == range.start => {
                pending.range.end = range.end;
                pending.text.push_str(text);
            }
            _ => {
                self.flush_text();
                self.pending = Some(PendingText {
                    range,
                    text: text.to_string(),
                });
            }
        }
    }

    fn flush_text(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let slice = &self.source[pending.range.clone()];
        let links = scan_wikilinks(slice);
        if links.is_empty() {
            self.add(NodeKind::Text(pending.text), pending.range);
            return;
        }
        let base = pending.range.start;
        let mut cursor = 0;
        for link in links {
            if link.range.start > cursor {
                self.add(
                    NodeKind::Text(slice[cursor..link.range.start].to_string()),
                    base + cursor..base + link.range.start,
                );
            }
            self.add(
                NodeKind::Wikilink(WikilinkNode {
                    target: link.target,
                    display_text: link.display_text,
                    has_pipe: link.has_pipe,
                }),
                base + link.range.start..base + link.range.end,
            );
            cursor = link.range.end;
        }
        if cursor < slice.len() {
            self.add(
                NodeKind::Text(slice[cursor..].to_string()),
                base + cursor..pending.range.end,
            );
        }
    }

    fn close(&mut self) {
        self.flush_text();
        let Some(Some(id)) = self.open.pop() else {
            return;
        };
        self.parents.pop();
        let code_text = self.code_text.take();
        let node = &self.nodes[id.0];
        let finished = match &node.kind {
            NodeKind::Heading { level, .. } => {
                let mut text = String::new();
                for child in node.children.iter() {
                    inline_text(&self.nodes, *child, &mut text);
                }
                Some(NodeKind::Heading {
                    level: *level,
                    text: text.trim().to_string(),
                })
            }
            NodeKind::List { ordered, .. } => {
                let loose = node.children.iter().any(|item| {
                    self.nodes[item.0]
                        .children
                        .iter()
                        .any(|c| matches!(self.nodes[c.0].kind, NodeKind::Paragraph))
                });
                Some(NodeKind::List {
                    ordered: *ordered,
                    tight: !loose,
                })
            }
            NodeKind::CodeBlock {
                language, fenced, ..
            } => {
                let content = if *fenced {
                    fenced_content(self.source, node.range.bytes())
                } else {
                    code_text.unwrap_or_default()
                };
                Some(NodeKind::CodeBlock {
                    language: language.clone(),
                    content,
                    fenced: *fenced,
                })
            }
            _ => None,
        };
        if let Some(kind) = finished {
            self.nodes[id.0].kind = kind;
        }
    }

    fn handle(&mut self, event: MdEvent<'_>, range: ByteRange<usize>) {
        match event {
            MdEvent::Start(tag) => self.start(tag, range),
            MdEvent::End(_) => self.close(),
            MdEvent::Text(text) => self.push_text(&text, range),
            MdEvent::SoftBreak | MdEvent::HardBreak => self.push_text("\n", range),
            MdEvent::Code(code) => {
                self.flush_text();
                self.add(NodeKind::Code(code.to_string()), range);
            }
            MdEvent::Rule => {
                self.flush_text();
                self.add(NodeKind::ThematicBreak, range);
            }
            _ => self.flush_text(),
        }
    }

    fn start(&mut self, tag: MdTag<'_>, range: ByteRange<usize>) {
        match tag {
            MdTag::Paragraph => self.open_node(NodeKind::Paragraph, range),
            MdTag::Heading { level, .. } => self.open_node(
                NodeKind::Heading {
                    level: level as u8,
                    text: String::new(),
                },
                range,
            ),
            MdTag::BlockQuote(_) => self.open_node(NodeKind::BlockQuote, range),
            MdTag::CodeBlock(kind) => {
                let (language, fenced) = match kind {
                    CodeBlockKind::Fenced(info) => (
                        info.split_whitespace().next().map(|token| token.to_string()),
                        true,
                    ),
                    CodeBlockKind::Indented => (None, false),
                };
                self.open_node(
                    NodeKind::CodeBlock {
                        language,
                        content: String::new(),
                        fenced,
                    },
                    range,
                );
                self.code_text = Some(String::new());
            }
            MdTag::List(first) => self.open_node(
                NodeKind::List {
                    ordered: first.is_some(),
                    tight: true,
                },
                range,
            ),
            MdTag::Item => {
                let task_state = detect_task(&self.source[range.clone()], self.vocabulary);
                self.open_node(
                    NodeKind::ListItem {
                        task: task_state.is_some(),
                        task_state,
                    },
                    range,
                )
            }
            MdTag::Emphasis => self.open_node(NodeKind::Emphasis, range),
            MdTag::Strong => self.open_node(NodeKind::Strong, range),
            MdTag::Link {
                dest_url, title, ..
            } => self.open_node(
                NodeKind::Link {
                    url: dest_url.to_string(),
                    title: title.to_string(),
                },
                range,
            ),
            _ => self.open_transparent(),
        }
    }

    fn finish(mut self, fm: frontmatter::Frontmatter) -> Document {
        self.flush_text();
        Document::from_parts(self.nodes, fm.metadata, fm.error)
    }
}

fn inline_text(nodes: &[Node], id: NodeId, out: &mut String) {
    let node = &nodes[id.0];
    match &node.kind {
        NodeKind::Text(text) | NodeKind::Code(text) => out.push_str(text),
        NodeKind::Wikilink(link) => {
            out.push_str(link.display_text.as_deref().unwrap_or(&link.target))
        }
        _ => {
            for child in node.children.iter() {
                inline_text(nodes, *child, out);
            }
        }
    }
}

/// Returns the checkbox state of a list item when it is a valid task.
///
/// `item` is the item source starting at its list marker.
pub fn detect_task(item: &str, vocabulary: &TaskVocabulary) -> Option<String> {
    let state = checkbox_state(item)?;
    if vocabulary.contains(state) {
        Some(state.to_string())
    } else {
        None
    }
}

/// The raw `s` of a leading `[s] ` after a list marker, whether or not it is a valid state.
pub fn checkbox_state(item: &str) -> Option<&str> {
    let rest = item.trim_start_matches([' ', '\t']);
    let rest = if let Some(rest) = rest.strip_prefix(['-', '*', '+']) {
        rest
    } else {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        rest[digits..].strip_prefix(['.', ')'])?
    };
    let rest = rest.trim_start_matches([' ', '\t']);
    let rest = rest.strip_prefix('[')?;
    let close = rest.find(']')?;
    let state = &rest[..close];
    if state.contains('\n') {
        return None;
    }
    let after = &rest[close + 1..];
    if after.starts_with([' ', '\t']) {
        Some(state)
    } else {
        None
    }
}

/// Source between the opening fence line and the closing fence line of a fenced block.
fn fenced_content(source: &str, block: ByteRange<usize>) -> String {
    let block_text = &source[block.clone()];
    let Some(open_len) = block_text.find('\n').map(|idx| idx + 1) else {
        return String::new();
    };
    let fence_char = block_text
        .trim_start_matches([' ', '\t', '>'])
        .chars()
        .next()
        .unwrap_or('`');
    let inner = &block_text[open_len..];
    let trimmed = inner
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(inner);
    let last_line_start = trimmed.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    let last_line = trimmed[last_line_start..].trim_start_matches([' ', '\t', '>']);
    let is_closing = last_line.trim_end().len() >= 3
        && last_line.trim_end().chars().all(|c| c == fence_char);
    if is_closing {
        inner[..last_line_start].to_string()
    } else {
        inner.to_string()
    }
}

#[tracing::instrument(skip_all)]
pub fn build_document(source: &str, vocabulary: &TaskVocabulary) -> Document {
    let fm = frontmatter::split(source);
    if let Some(error) = fm.error.as_ref() {
        tracing::debug!("[md] Ignoring invalid frontmatter: {}", error);
    }
    let body_start = fm.body_start;
    let mut builder = TreeBuilder::new(source, vocabulary);
    let parser = MdParser::new_ext(&source[body_start..], notedown_md_options());
    for (event, range) in parser.into_offset_iter() {
        builder.handle(event, body_start + range.start..body_start + range.end);
    }
    builder.finish(fm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkbox_state() {
        assert_eq!(checkbox_state("- [x] done"), Some("x"));
        assert_eq!(checkbox_state("  12. [wip] going"), Some("wip"));
        assert_eq!(checkbox_state("* [ ] open"), Some(" "));
        assert_eq!(checkbox_state("- [x]"), None);
        assert_eq!(checkbox_state("- text [x] "), None);
        assert_eq!(checkbox_state("[x] not a list"), None);
    }

    #[test]
    fn test_fenced_content() {
        let src = "```\nA\n\nB\n```\n";
        assert_eq!(fenced_content(src, 0..src.len()), "A\n\nB\n");
        let src = "~~~sh\necho ```\n~~~";
        assert_eq!(fenced_content(src, 0..src.len()), "echo ```\n");
        let src = "```\nunclosed\n";
        assert_eq!(fenced_content(src, 0..src.len()), "unclosed\n");
        let src = "```\n```\n";
        assert_eq!(fenced_content(src, 0..src.len()), "");
    }

    #[test]
    fn test_task_state_aliases() {
        let vocab = TaskVocabulary::default();
        assert_eq!(detect_task("- [X] done", &vocab), Some("X".to_string()));
        assert_eq!(detect_task("- [?] what", &vocab), None);
    }
}
