//! JSON-RPC 2.0 message model.
//!
//! Inbound bodies are classified from raw JSON with [`Message::from_value`] so that malformed
//! messages can still be answered with the right error code and, where known, the request id.
//! Outbound messages are built explicitly with [`Message::to_value`]; a success response always
//! carries a `result` member, even when it is `null`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

use crate::error::NotedownError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
        }
    }

    pub fn from_code(code: i64) -> Option<ErrorCode> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
        }
    }
}

/// Request id: a number, a string or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    fn from_value(value: &Value) -> Option<Id> {
        match value {
            Value::Null => Some(Id::Null),
            Value::String(s) => Some(Id::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Id::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Id::Number(n) => Value::from(*n),
            Id::String(s) => Value::String(s.clone()),
            Id::Null => Value::Null,
        }
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s:?}"),
            Id::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl From<&NotedownError> for RpcError {
    /// The error's display text is both the message and the data.
    fn from(err: &NotedownError) -> Self {
        let text = err.to_string();
        RpcError::new(err.rpc_code(), text.clone()).with_data(Value::String(text))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Id,
    pub result: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Response {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: Id, error: RpcError) -> Self {
        Response {
            id,
            result: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why an inbound body could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    /// The request id, when it could be recovered.
    pub id: Option<Id>,
    pub error: RpcError,
}

impl InvalidMessage {
    fn new(id: Option<Id>, code: ErrorCode, message: impl Into<String>) -> Self {
        InvalidMessage {
            id,
            error: RpcError::new(code, message),
        }
    }
}

impl Message {
    pub fn request(id: Id, method: &str, params: Value) -> Self {
        Message::Request(Request {
            id,
            method: method.to_string(),
            params: Some(params),
        })
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Message::Notification(Notification {
            method: method.to_string(),
            params: Some(params),
        })
    }

    /// Parse a framed body.
    pub fn from_slice(body: &[u8]) -> Result<Message, InvalidMessage> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| InvalidMessage::new(None, ErrorCode::ParseError, e.to_string()))?;
        Message::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Message, InvalidMessage> {
        let Value::Object(mut object) = value else {
            return Err(InvalidMessage::new(
                None,
                ErrorCode::InvalidRequest,
                "message is not a JSON object",
            ));
        };
        let id = match object.get("id") {
            Some(raw) => Some(Id::from_value(raw).ok_or_else(|| {
                InvalidMessage::new(None, ErrorCode::InvalidRequest, "invalid id")
            })?),
            None => None,
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(InvalidMessage::new(
                id,
                ErrorCode::InvalidRequest,
                "jsonrpc must be \"2.0\"",
            ));
        }
        let params = object.remove("params");
        if let Some(method) = object.get("method") {
            let Some(method) = method.as_str() else {
                return Err(InvalidMessage::new(
                    id,
                    ErrorCode::InvalidRequest,
                    "method must be a string",
                ));
            };
            return Ok(match id {
                Some(id) => Message::Request(Request {
                    id,
                    method: method.to_string(),
                    params,
                }),
                None => Message::Notification(Notification {
                    method: method.to_string(),
                    params,
                }),
            });
        }
        let Some(id) = id else {
            return Err(InvalidMessage::new(
                None,
                ErrorCode::InvalidRequest,
                "message has neither method nor id",
            ));
        };
        let result = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(serde_json::from_value::<RpcError>(error).map_err(|e| {
                InvalidMessage::new(Some(id.clone()), ErrorCode::InvalidRequest, e.to_string())
            })?),
            _ => {
                return Err(InvalidMessage::new(
                    Some(id),
                    ErrorCode::InvalidRequest,
                    "response must carry exactly one of result or error",
                ))
            }
        };
        Ok(Message::Response(Response { id, result }))
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Message::Request(request) => {
                object.insert("id".to_string(), request.id.to_value());
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = request.params.as_ref() {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Message::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::String(notification.method.clone()),
                );
                if let Some(params) = notification.params.as_ref() {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(response) => {
                object.insert("id".to_string(), response.id.to_value());
                match &response.result {
                    Ok(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        object.insert(
                            "error".to_string(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(object)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, NotedownError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }
}

/// Deserialize handler params; a missing params member reads as `null`.
pub fn params<P: DeserializeOwned>(value: Value) -> Result<P, NotedownError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        let request = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "method": "initialize", "params": {}
        }))
        .unwrap();
        assert!(matches!(request, Message::Request(Request { id: Id::Number(3), .. })));

        let null_id = Message::from_value(json!({"jsonrpc": "2.0", "id": null, "method": "x"}));
        assert!(matches!(null_id, Ok(Message::Request(Request { id: Id::Null, .. }))));

        let notification =
            Message::from_value(json!({"jsonrpc": "2.0", "method": "initialized"})).unwrap();
        assert!(matches!(notification, Message::Notification(_)));

        let response = Message::from_value(json!({"jsonrpc": "2.0", "id": "a", "result": null}));
        assert_eq!(
            response,
            Ok(Message::Response(Response::success(
                Id::String("a".to_string()),
                Value::Null
            )))
        );
    }

    #[test]
    fn test_invalid_messages() {
        let err = Message::from_slice(b"{not json").unwrap_err();
        assert_eq!(err.error.error_code(), Some(ErrorCode::ParseError));
        assert_eq!(err.id, None);

        let err = Message::from_value(json!({"jsonrpc": "1.0", "id": 7, "method": "x"})).unwrap_err();
        assert_eq!(err.error.error_code(), Some(ErrorCode::InvalidRequest));
        assert_eq!(err.id, Some(Id::Number(7)));

        let err = Message::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err.error.code, -32600);

        let err = Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {}}))
            .unwrap_err();
        assert_eq!(err.id, Some(Id::Number(1)));
    }

    #[test]
    fn test_to_value() {
        let ok = Message::Response(Response::success(Id::Number(1), Value::Null)).to_value();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 1, "result": null}));

        let err = NotedownError::Command("Unknown command 'x'".to_string());
        let response = Message::Response(Response::error(Id::Number(2), RpcError::from(&err)));
        assert_eq!(
            response.to_value(),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {
                    "code": -32602,
                    "message": "Invalid Command: Unknown command 'x'",
                    "data": "Invalid Command: Unknown command 'x'"
                }
            })
        );

        let note = Message::notification("window/logMessage", json!({"type": 3})).to_value();
        assert!(note.get("id").is_none());
    }
}
