//! JSON-RPC 2.0 over `Content-Length` framed byte streams.

pub mod framing;
pub mod message;
pub mod mux;

pub use framing::{encode_frame, MessageReader, MessageWriter};
pub use message::{params, ErrorCode, Id, Message, Notification, Request, Response, RpcError};
pub use mux::{Mux, Outbound};
