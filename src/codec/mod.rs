//! Markdown parsing into an arena-backed document tree.
//!
//! [`Parser::parse`] is a pure function from source text to a [`Document`]. The document owns
//! every node in a flat arena; nodes refer to their parent and children by [`NodeId`], so the
//! tree carries back-references without shared ownership.
//!
//! ## Recognised syntax
//!
//! - YAML frontmatter between `---` lines at the start of the file (see [`frontmatter`])
//! - ATX headings, paragraphs, block quotes, thematic breaks
//! - fenced and indented code blocks; fenced content is kept verbatim
//! - ordered and unordered lists, with task items `- [s] text` where `s` is a value or alias of
//!   the configured [`TaskVocabulary`]
//! - wiki-style references `[[TARGET]]` and `[[TARGET|DISPLAY]]`
//! - emphasis, strong, inline code and links
//!
//! Every node carries a [`Range`] with 1-based line/column positions and byte offsets into the
//! original source (frontmatter included).
//!
//! ```rust
//! use notedown_core::codec::{parse, NodeKind};
//!
//! let doc = parse("# Title\n\n- [x] done, see [[notes/b]]\n");
//! let targets: Vec<_> = doc.wikilinks().map(|(_, w)| w.target.clone()).collect();
//! assert_eq!(targets, vec!["notes/b".to_string()]);
//! assert!(doc.nodes().any(|(_, n)| matches!(n.kind, NodeKind::ListItem { task: true, .. })));
//! ```

use lsp_types::Position as LspPosition;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range as ByteRange;

use crate::{config::TaskVocabulary, error::NotedownError};

pub mod frontmatter;
pub mod md;

pub use frontmatter::Metadata;

/// `[[TARGET]]` or `[[TARGET|DISPLAY]]`.
pub static WIKILINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]|]+)(?:\|([^\]]+))?\]\]").expect("valid wikilink regex"));

/// A point in the source. `line` and `column` are 1-based (column counts characters), `offset`
/// is a 0-based byte offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

/// Half-open source range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn from_offsets(index: &LineIndex<'_>, start: usize, end: usize) -> Range {
        Range {
            start: index.position(start),
            end: index.position(end),
        }
    }

    pub fn bytes(&self) -> ByteRange<usize> {
        self.start.offset..self.end.offset
    }

    pub fn contains_offset(&self, offset: usize) -> bool {
        self.start.offset <= offset && offset < self.end.offset
    }

    /// True when `other` lies completely within this range.
    pub fn covers(&self, other: &ByteRange<usize>) -> bool {
        self.start.offset <= other.start && other.end <= self.end.offset
    }

    /// Convert to a 0-based, UTF-16 LSP range.
    pub fn to_lsp(&self, index: &LineIndex<'_>) -> lsp_types::Range {
        index.lsp_range(self.start.offset, self.end.offset)
    }
}

/// Maps byte offsets to line/column positions for one text.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));
        LineIndex { text, line_starts }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn floor_boundary(&self, offset: usize) -> usize {
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset -= 1;
        }
        offset
    }

    /// 0-based line containing `offset`.
    pub fn line_of(&self, offset: usize) -> usize {
        self.line_starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1)
    }

    pub fn line_start(&self, line: usize) -> usize {
        self.line_starts
            .get(line)
            .copied()
            .unwrap_or(self.text.len())
    }

    /// Text of the 0-based `line` without its line terminator.
    pub fn line_text(&self, line: usize) -> &'a str {
        let start = self.line_start(line);
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.text.len());
        self.text[start..end].trim_end_matches(['\n', '\r'])
    }

    pub fn position(&self, offset: usize) -> Position {
        let offset = self.floor_boundary(offset);
        let line = self.line_of(offset);
        let start = self.line_starts[line];
        Position {
            line: line + 1,
            column: self.text[start..offset].chars().count() + 1,
            offset,
        }
    }

    pub fn lsp_position(&self, offset: usize) -> LspPosition {
        let offset = self.floor_boundary(offset);
        let line = self.line_of(offset);
        let start = self.line_starts[line];
        let character: usize = self.text[start..offset].chars().map(char::len_utf16).sum();
        LspPosition::new(line as u32, character as u32)
    }

    pub fn lsp_range(&self, start: usize, end: usize) -> lsp_types::Range {
        lsp_types::Range::new(self.lsp_position(start), self.lsp_position(end))
    }

    /// Byte offset of an LSP position. Positions past the end of a line clamp to the line end.
    pub fn offset(&self, position: LspPosition) -> usize {
        let line = position.line as usize;
        if line >= self.line_starts.len() {
            return self.text.len();
        }
        let start = self.line_starts[line];
        let line_text = self.line_text(line);
        let mut units = 0usize;
        for (idx, ch) in line_text.char_indices() {
            if units >= position.character as usize {
                return start + idx;
            }
            units += ch.len_utf16();
        }
        start + line_text.len()
    }
}

/// Index of a node in its document's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikilinkNode {
    pub target: String,
    pub display_text: Option<String>,
    pub has_pipe: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Document,
    Heading {
        level: u8,
        text: String,
    },
    Paragraph,
    CodeBlock {
        language: Option<String>,
        content: String,
        fenced: bool,
    },
    List {
        ordered: bool,
        tight: bool,
    },
    ListItem {
        task: bool,
        task_state: Option<String>,
    },
    Wikilink(WikilinkNode),
    Text(String),
    Emphasis,
    Strong,
    Code(String),
    BlockQuote,
    ThematicBreak,
    Link {
        url: String,
        title: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub range: Range,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Parsed document: node arena rooted at [`NodeId::ROOT`] plus frontmatter metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    nodes: Vec<Node>,
    pub metadata: Metadata,
    /// Set when a frontmatter prelude was present but unreadable.
    pub metadata_error: Option<String>,
}

impl Document {
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        metadata: Metadata,
        metadata_error: Option<String>,
    ) -> Self {
        Document {
            nodes,
            metadata,
            metadata_error,
        }
    }

    pub fn root(&self) -> &Node {
        &self.nodes[NodeId::ROOT.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    pub fn parent(&self, id: NodeId) -> Option<(NodeId, &Node)> {
        let parent = self.get(id)?.parent?;
        self.get(parent).map(|node| (parent, node))
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |child| self.get(*child).map(|node| (*child, node)))
    }

    /// Depth-first pre-order traversal of the whole tree, root included.
    pub fn nodes(&self) -> Descendants<'_> {
        self.descendants(NodeId::ROOT)
    }

    /// Depth-first pre-order traversal of the subtree rooted at `id`.
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        Descendants {
            doc: self,
            stack: if id.0 < self.nodes.len() {
                vec![id]
            } else {
                Vec::new()
            },
        }
    }

    pub fn wikilinks(&self) -> impl Iterator<Item = (&Node, &WikilinkNode)> + '_ {
        self.nodes().filter_map(|(_, node)| match &node.kind {
            NodeKind::Wikilink(link) => Some((node, link)),
            _ => None,
        })
    }

    pub fn headings(&self) -> impl Iterator<Item = (&Node, u8, &str)> + '_ {
        self.nodes().filter_map(|(_, node)| match &node.kind {
            NodeKind::Heading { level, text } => Some((node, *level, text.as_str())),
            _ => None,
        })
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = (&Node, Option<&str>, &str)> + '_ {
        self.nodes().filter_map(|(_, node)| match &node.kind {
            NodeKind::CodeBlock {
                language, content, ..
            } => Some((node, language.as_deref(), content.as_str())),
            _ => None,
        })
    }

    /// Task list items in document order.
    pub fn tasks(&self) -> impl Iterator<Item = (NodeId, &Node, &str)> + '_ {
        self.nodes().filter_map(|(id, node)| match &node.kind {
            NodeKind::ListItem {
                task: true,
                task_state: Some(state),
            } => Some((id, node, state.as_str())),
            _ => None,
        })
    }

    /// Concatenated inline text of a node, not descending into nested lists.
    pub fn plain_text(&self, id: NodeId) -> String {
        let mut out = String::new();
        match self.get(id).map(|node| &node.kind) {
            Some(NodeKind::Text(_) | NodeKind::Code(_) | NodeKind::Wikilink(_)) => {
                self.collect_text(id, &mut out)
            }
            Some(_) => {
                for (child, _) in self.children(id) {
                    self.collect_text(child, &mut out);
                }
            }
            None => {}
        }
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) | NodeKind::Code(text) => out.push_str(text),
            NodeKind::Wikilink(link) => {
                out.push_str(link.display_text.as_deref().unwrap_or(&link.target))
            }
            NodeKind::List { .. } | NodeKind::CodeBlock { .. } => {}
            _ => {
                for child in node.children.iter() {
                    self.collect_text(*child, out);
                }
            }
        }
    }
}

/// Finite pre-order traversal over a [`Document`]. Re-create it to traverse again.
pub struct Descendants<'a> {
    doc: &'a Document,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = (NodeId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.doc.get(id)?;
        self.stack.extend(node.children.iter().rev().copied());
        Some((id, node))
    }
}

/// Visit every node depth-first in pre-order. The first error returned by `visit` aborts the walk
/// and is returned.
pub fn walk<F>(doc: &Document, mut visit: F) -> Result<(), NotedownError>
where
    F: FnMut(NodeId, &Node) -> Result<(), NotedownError>,
{
    for (id, node) in doc.nodes() {
        visit(id, node)?;
    }
    Ok(())
}

/// A wiki-style reference found in raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikilinkMatch {
    /// Byte range of the whole `[[...]]`.
    pub range: ByteRange<usize>,
    /// Byte range of the untrimmed TARGET between `[[` and `|` or `]]`.
    pub target_range: ByteRange<usize>,
    pub target: String,
    pub display_text: Option<String>,
    pub has_pipe: bool,
}

/// Targets climbing out of the workspace are not references.
pub fn is_valid_target(target: &str) -> bool {
    !target.is_empty() && !target.starts_with("..") && !target.contains("/../")
}

/// Find every wiki-style reference in `text`, skipping rejected targets.
pub fn scan_wikilinks(text: &str) -> Vec<WikilinkMatch> {
    WIKILINK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let raw_target = caps.get(1)?;
            let target = raw_target.as_str().trim();
            if !is_valid_target(target) {
                return None;
            }
            let display = caps.get(2);
            Some(WikilinkMatch {
                range: whole.range(),
                target_range: raw_target.range(),
                target: target.to_string(),
                display_text: display.map(|d| d.as_str().trim().to_string()),
                has_pipe: display.is_some(),
            })
        })
        .collect()
}

/// Markdown parser parameterised by the task vocabulary.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    vocabulary: TaskVocabulary,
}

impl Parser {
    pub fn new(vocabulary: TaskVocabulary) -> Self {
        Parser { vocabulary }
    }

    pub fn vocabulary(&self) -> &TaskVocabulary {
        &self.vocabulary
    }

    pub fn parse(&self, source: &str) -> Document {
        md::build_document(source, &self.vocabulary)
    }

    /// Parse raw file bytes. Invalid UTF-8 sequences are replaced rather than rejected.
    pub fn parse_bytes(&self, bytes: &[u8]) -> Document {
        self.parse(&String::from_utf8_lossy(bytes))
    }
}

/// Parse with the default task vocabulary.
pub fn parse(source: &str) -> Document {
    Parser::default().parse(source)
}
