//! `workspace/executeCommand` commands specific to Notedown.

use lsp_types::{Position as LspPosition, Range as LspRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    codec::{scan_wikilinks, Document, LineIndex, NodeKind},
    error::NotedownError,
};

pub const GET_LIST_ITEM_BOUNDARIES: &str = "notedown.getListItemBoundaries";
pub const GET_CONCEAL_RANGES: &str = "notedown.getConcealRanges";
pub const EXECUTE_CODE_BLOCKS: &str = "notedown.executeCodeBlocks";

/// Commands advertised in the server capabilities.
pub const COMMANDS: [&str; 3] = [
    GET_LIST_ITEM_BOUNDARIES,
    GET_CONCEAL_RANGES,
    EXECUTE_CODE_BLOCKS,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListItemBoundaries { uri: String, position: LspPosition },
    ConcealRanges { uri: String },
    ExecuteCodeBlocks { uri: String, language: Option<String> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteCodeBlocksArgs {
    text_document: DocumentArg,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentArg {
    uri: String,
}

impl Command {
    pub fn parse(name: &str, arguments: Vec<Value>) -> Result<Command, NotedownError> {
        match name {
            GET_LIST_ITEM_BOUNDARIES => {
                let uri = uri_argument(&arguments, 0)?;
                let position = arguments.get(1).cloned().ok_or_else(|| {
                    NotedownError::Command(format!("{name} expects a position argument"))
                })?;
                let position: LspPosition = serde_json::from_value(position)?;
                Ok(Command::ListItemBoundaries { uri, position })
            }
            GET_CONCEAL_RANGES => Ok(Command::ConcealRanges {
                uri: uri_argument(&arguments, 0)?,
            }),
            EXECUTE_CODE_BLOCKS => {
                let arg = arguments.into_iter().next().ok_or_else(|| {
                    NotedownError::Command(format!("{name} expects {{textDocument, language?}}"))
                })?;
                let args: ExecuteCodeBlocksArgs = serde_json::from_value(arg)?;
                Ok(Command::ExecuteCodeBlocks {
                    uri: args.text_document.uri,
                    language: args.language.filter(|l| !l.trim().is_empty()),
                })
            }
            other => Err(NotedownError::Command(format!("Unknown command '{other}'"))),
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Command::ListItemBoundaries { uri, .. } => uri,
            Command::ConcealRanges { uri } => uri,
            Command::ExecuteCodeBlocks { uri, .. } => uri,
        }
    }
}

/// A document argument given as a bare uri string, `{uri}` or `{textDocument: {uri}}`.
fn uri_argument(arguments: &[Value], index: usize) -> Result<String, NotedownError> {
    let value = arguments
        .get(index)
        .ok_or_else(|| NotedownError::Command("missing document uri argument".to_string()))?;
    let uri = match value {
        Value::String(uri) => Some(uri.as_str()),
        Value::Object(object) => object
            .get("uri")
            .or_else(|| object.get("textDocument").and_then(|doc| doc.get("uri")))
            .and_then(Value::as_str),
        _ => None,
    };
    uri.map(str::to_string)
        .ok_or_else(|| NotedownError::Command(format!("invalid document uri argument: {value}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItemBoundaries {
    pub start: LspPosition,
    pub end: LspPosition,
}

/// Bounds of the innermost list item containing `position`, trailing whitespace excluded.
pub fn list_item_boundaries(
    content: &str,
    doc: &Document,
    position: LspPosition,
) -> Option<ListItemBoundaries> {
    let lines = LineIndex::new(content);
    let offset = lines.offset(position);
    let (_, item) = doc
        .nodes()
        .filter(|(_, node)| matches!(node.kind, NodeKind::ListItem { .. }))
        .filter(|(_, node)| node.range.contains_offset(offset))
        .min_by_key(|(_, node)| node.range.end.offset - node.range.start.offset)?;
    let start = item.range.start.offset;
    let end = start + content[start..item.range.end.offset].trim_end().len();
    Some(ListItemBoundaries {
        start: lines.lsp_position(start),
        end: lines.lsp_position(end),
    })
}

/// TARGET bytes of every `[[TARGET|DISPLAY]]`; pipeless references are left alone.
pub fn conceal_ranges(content: &str) -> Vec<LspRange> {
    let lines = LineIndex::new(content);
    scan_wikilinks(content)
        .into_iter()
        .filter(|link| link.has_pipe)
        .map(|link| lines.lsp_range(link.target_range.start, link.target_range.end))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Parser;
    use serde_json::json;

    #[test]
    fn test_parse_commands() {
        let command = Command::parse(
            GET_LIST_ITEM_BOUNDARIES,
            vec![json!("file:///a.md"), json!({"line": 1, "character": 2})],
        )
        .unwrap();
        assert_eq!(
            command,
            Command::ListItemBoundaries {
                uri: "file:///a.md".to_string(),
                position: LspPosition::new(1, 2)
            }
        );

        let command =
            Command::parse(GET_CONCEAL_RANGES, vec![json!({"uri": "file:///a.md"})]).unwrap();
        assert_eq!(command.uri(), "file:///a.md");

        let command = Command::parse(
            EXECUTE_CODE_BLOCKS,
            vec![json!({"textDocument": {"uri": "file:///a.md"}, "language": "python"})],
        )
        .unwrap();
        assert_eq!(
            command,
            Command::ExecuteCodeBlocks {
                uri: "file:///a.md".to_string(),
                language: Some("python".to_string())
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = Command::parse("notedown.nope", vec![]).unwrap_err();
        assert_eq!(err, NotedownError::Command("Unknown command 'notedown.nope'".to_string()));
        assert!(Command::parse(GET_CONCEAL_RANGES, vec![json!(3)]).is_err());
        assert!(Command::parse(GET_LIST_ITEM_BOUNDARIES, vec![json!("file:///a.md")]).is_err());
        assert!(Command::parse(EXECUTE_CODE_BLOCKS, vec![json!({})]).is_err());
    }

    #[test]
    fn test_conceal_ranges() {
        let content = "[[plain]] and [[ target |shown]]\n[[b|c]]";
        let ranges = conceal_ranges(content);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, LspPosition::new(0, 16));
        assert_eq!(ranges[0].end, LspPosition::new(0, 24));
        assert_eq!(ranges[1].start, LspPosition::new(1, 2));
        assert_eq!(ranges[1].end, LspPosition::new(1, 3));
    }

    #[test]
    fn test_list_item_boundaries() {
        let content = "intro\n\n- first\n- second\n  - nested child\n\nafter\n";
        let doc = Parser::default().parse(content);

        let outer = list_item_boundaries(content, &doc, LspPosition::new(3, 3)).unwrap();
        assert_eq!(outer.start, LspPosition::new(3, 0));
        assert_eq!(outer.end, LspPosition::new(4, 16));

        let inner = list_item_boundaries(content, &doc, LspPosition::new(4, 6)).unwrap();
        assert_eq!(inner.start, LspPosition::new(4, 2));
        assert_eq!(inner.end, LspPosition::new(4, 16));

        assert!(list_item_boundaries(content, &doc, LspPosition::new(0, 1)).is_none());
    }
}
