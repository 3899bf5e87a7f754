//! YAML frontmatter handling.
//!
//! A frontmatter prelude is a `---` line at the very start of the file, a YAML mapping, and a
//! closing `---` (or `...`) line. Only the metadata subset survives conversion: null, bool,
//! finite numbers, strings, homogeneous lists of those and nested maps. Tagged values and
//! anything else are dropped.

use serde_json::{Map, Number, Value};
use serde_yaml::Value as YamlValue;

/// Document metadata keyed by frontmatter field name.
pub type Metadata = Map<String, Value>;

/// Result of splitting a source text into frontmatter and body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    pub metadata: Metadata,
    /// Byte offset where the markdown body starts. Zero when there is no valid prelude.
    pub body_start: usize,
    /// Set when a prelude was present but could not be read as a YAML mapping.
    pub error: Option<String>,
}

/// Split `source` into metadata and the offset of the markdown body.
///
/// Invalid frontmatter never fails the parse: the error is recorded, the metadata is empty and
/// the whole text is treated as body.
pub fn split(source: &str) -> Frontmatter {
    let Some(open_end) = fence_line_end(source, 0) else {
        return Frontmatter::default();
    };

    let mut line_start = open_end;
    while line_start < source.len() {
        let line_end = source[line_start..]
            .find('\n')
            .map(|idx| line_start + idx + 1)
            .unwrap_or(source.len());
        let line = source[line_start..line_end].trim_end_matches(['\n', '\r']);
        if line.trim_end() == "---" || line.trim_end() == "..." {
            let yaml = &source[open_end..line_start];
            return match parse_metadata(yaml) {
                Ok(metadata) => Frontmatter {
                    metadata,
                    body_start: line_end,
                    error: None,
                },
                Err(error) => Frontmatter {
                    metadata: Metadata::new(),
                    body_start: 0,
                    error: Some(error),
                },
            };
        }
        line_start = line_end;
    }

    Frontmatter {
        metadata: Metadata::new(),
        body_start: 0,
        error: Some("unterminated frontmatter block".to_string()),
    }
}

/// Returns the end offset (after the newline) of an opening `---` line starting at `start`.
fn fence_line_end(source: &str, start: usize) -> Option<usize> {
    let rest = &source[start..];
    let newline = rest.find('\n')?;
    let line = rest[..newline].trim_end_matches('\r');
    if line.trim_end() == "---" {
        Some(start + newline + 1)
    } else {
        None
    }
}

fn parse_metadata(yaml: &str) -> Result<Metadata, String> {
    if yaml.trim().is_empty() {
        return Ok(Metadata::new());
    }
    let value: YamlValue = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
    match value {
        YamlValue::Null => Ok(Metadata::new()),
        YamlValue::Mapping(_) => match from_yaml(value) {
            Some(Value::Object(map)) => Ok(map),
            _ => Ok(Metadata::new()),
        },
        _ => Err("frontmatter is not a mapping".to_string()),
    }
}

/// Convert a YAML value into the metadata subset, or `None` when it has no representation.
pub fn from_yaml(value: YamlValue) -> Option<Value> {
    let converted = match value {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Number(u.into())
            } else {
                Value::Number(Number::from_f64(n.as_f64()?)?)
            }
        }
        YamlValue::String(s) => Value::String(s),
        YamlValue::Sequence(items) => {
            Value::Array(items.into_iter().filter_map(from_yaml).collect())
        }
        YamlValue::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, value) in mapping {
                let key = match key {
                    YamlValue::String(s) => s,
                    YamlValue::Bool(b) => b.to_string(),
                    YamlValue::Number(n) => n.to_string(),
                    _ => continue,
                };
                if let Some(value) = from_yaml(value) {
                    map.insert(key, value);
                }
            }
            Value::Object(map)
        }
        YamlValue::Tagged(_) => return None,
    };
    subset_value(&converted)
}

/// Restrict a JSON value to the metadata subset. Applying it twice is the same as once.
pub fn subset_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Some(value.clone()),
        Value::Number(n) => {
            if n.is_f64() && !n.as_f64().map(f64::is_finite).unwrap_or(false) {
                None
            } else {
                Some(value.clone())
            }
        }
        Value::Array(items) => {
            let items: Vec<Value> = items.iter().filter_map(subset_value).collect();
            if is_homogeneous(&items) {
                Some(Value::Array(items))
            } else {
                None
            }
        }
        Value::Object(map) => Some(Value::Object(subset(map))),
    }
}

/// Restrict every entry of `metadata` to the metadata subset.
pub fn subset(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter_map(|(key, value)| subset_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn kind_of(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn is_homogeneous(items: &[Value]) -> bool {
    match items.first() {
        None => true,
        Some(first) => {
            let kind = kind_of(first);
            items.iter().all(|item| kind_of(item) == kind)
        }
    }
}
