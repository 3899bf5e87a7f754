//! Path, URI and basepath helpers.
//!
//! Workspace-relative paths are always rendered with forward slashes regardless of the host
//! platform; OS paths only appear at the filesystem boundary.

use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf},
};
use url::Url;

use crate::error::NotedownError;

pub const MARKDOWN_EXTENSION: &str = "md";

/// Replace separators and convert to unicode (via to_string_lossy) on an os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .filter_map(|c| match c {
            Component::RootDir | Component::Prefix(_) => None,
            Component::CurDir => None,
            _ => Some(c.as_os_str().to_string_lossy()),
        })
        .collect::<Vec<Cow<'_, str>>>()
        .join("/")
}

/// Normalise a path-like string to forward slashes.
pub fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Path of `path` relative to `root`, with forward slashes.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, NotedownError> {
    Ok(os_path_to_string(path.strip_prefix(root)?))
}

/// Convert a `file://` URI into a filesystem path. Other schemes yield `None`.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Convert an absolute filesystem path into a `file://` URI string.
pub fn path_to_uri(path: &Path) -> Result<String, NotedownError> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| NotedownError::Serialization(format!("Not an absolute path: {path:?}")))
}

/// Filename of a file-scheme URI without its last extension.
///
/// Non-file URIs and URIs without a filename yield an empty string.
pub fn basepath_from_uri(uri: &str) -> String {
    if !uri.starts_with("file://") {
        return String::new();
    }
    let file_name = match Url::parse(uri) {
        Ok(url) => match url.to_file_path() {
            Ok(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Err(_) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
                .unwrap_or_default(),
        },
        Err(_) => basename(uri.trim_start_matches("file://")).to_string(),
    };
    strip_last_extension(&file_name).to_string()
}

/// `notes/today.md` -> `notes/today`; names without a dot (or dot-files) are unchanged.
pub fn strip_last_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// Drop a trailing `.md`, in any case.
pub fn strip_markdown_extension(name: &str) -> &str {
    let cut = name.len().saturating_sub(MARKDOWN_EXTENSION.len() + 1);
    match name.get(cut..) {
        Some(tail)
            if tail.len() == MARKDOWN_EXTENSION.len() + 1
                && tail.starts_with('.')
                && tail[1..].eq_ignore_ascii_case(MARKDOWN_EXTENSION) =>
        {
            &name[..cut]
        }
        _ => name,
    }
}

pub fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(MARKDOWN_EXTENSION))
        .unwrap_or(false)
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Last path segment of a forward-slash path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
