use std::{fmt, io, path::StripPrefixError};

use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use serde_yaml::Error as YamlError;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;
use url::ParseError as UrlParseError;

use crate::rpc::message::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum NotedownError {
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Notedown codec error: {0}")]
    Codec(String),
    #[error("Invalid Command: {0}")]
    Command(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Filter error: {0}")]
    Filter(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    OperationCancelled,
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Watcher error: {0}")]
    Watch(String),
}

impl NotedownError {
    /// JSON-RPC error code reported when this error escapes a request handler.
    pub fn rpc_code(&self) -> ErrorCode {
        match self {
            NotedownError::Protocol(_) => ErrorCode::InvalidRequest,
            NotedownError::Serialization(_) => ErrorCode::InvalidParams,
            NotedownError::Command(_) => ErrorCode::InvalidParams,
            NotedownError::Filter(_) => ErrorCode::InvalidParams,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NotedownError::OperationCancelled)
    }
}

impl From<StripPrefixError> for NotedownError {
    fn from(src: StripPrefixError) -> NotedownError {
        NotedownError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<JsonError> for NotedownError {
    fn from(src: JsonError) -> NotedownError {
        NotedownError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<YamlError> for NotedownError {
    fn from(src: YamlError) -> NotedownError {
        NotedownError::Serialization(format!("YAML (de)serialization error: {src}"))
    }
}

impl From<UrlParseError> for NotedownError {
    fn from(src: UrlParseError) -> NotedownError {
        NotedownError::Serialization(format!("Invalid URL: {src}"))
    }
}

impl From<io::Error> for NotedownError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => NotedownError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => NotedownError::PermissionDenied,
            _ => NotedownError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<fmt::Error> for NotedownError {
    fn from(x: fmt::Error) -> Self {
        NotedownError::Codec(format!("{x}"))
    }
}

impl From<RegexError> for NotedownError {
    fn from(x: RegexError) -> Self {
        NotedownError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl<T: fmt::Debug> From<TokioSendError<T>> for NotedownError {
    fn from(x: TokioSendError<T>) -> Self {
        NotedownError::Io(format!(
            "Channel send error, receiver dropped before accepting {:?}",
            x.0
        ))
    }
}

impl From<NotifyError> for NotedownError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => {
                NotedownError::Watch(format!("notify: {}, paths: {:?}", msg, notify_error.paths))
            }
            NotifyErrorKind::Io(io_error) => NotedownError::Watch(format!(
                "notify: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => NotedownError::NotFound(format!(
                "notify: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => NotedownError::NotFound(format!(
                "notify: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                NotedownError::Watch("notify: invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                NotedownError::Watch("notify: max file watch limit reached".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: NotedownError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, NotedownError::NotFound(_)));

        let err: NotedownError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(err, NotedownError::PermissionDenied);
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(NotedownError::OperationCancelled.to_string(), "cancelled");
        assert!(NotedownError::OperationCancelled.is_cancelled());
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(
            NotedownError::Serialization("bad".into()).rpc_code(),
            ErrorCode::InvalidParams
        );
        assert_eq!(
            NotedownError::Io("disk".into()).rpc_code(),
            ErrorCode::InternalError
        );
    }
}
