//! Request/notification multiplexer over a framed JSON-RPC stream.
//!
//! Every inbound request runs in its own task, so slow handlers never hold up the read loop.
//! Notifications also run in their own task but are started one after another in arrival order,
//! which keeps `didOpen`/`didChange`/`didClose` for a document in the order the client sent them.
//! All outbound traffic goes through [`Outbound`], whose single mutex keeps each header and body
//! together on the wire.

use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::NotedownError,
    rpc::{
        framing::{MessageReader, MessageWriter},
        message::{ErrorCode, Id, Message, Notification, Request, Response, RpcError},
    },
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<Value, NotedownError>> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(Value) -> BoxFuture<()> + Send + Sync>;

type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Cloneable handle for writing to the client.
#[derive(Clone)]
pub struct Outbound {
    writer: Arc<Mutex<MessageWriter<BoxWriter>>>,
    next_id: Arc<AtomicI64>,
}

impl Outbound {
    pub fn new<W: AsyncWrite + Send + 'static>(writer: W) -> Self {
        let writer: BoxWriter = Box::pin(writer);
        Outbound {
            writer: Arc::new(Mutex::new(MessageWriter::new(writer))),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), NotedownError> {
        let body = message.to_vec()?;
        self.writer.lock().await.write_frame(&body).await
    }

    /// Send a notification.
    pub async fn publish(&self, method: &str, params: Value) -> Result<(), NotedownError> {
        tracing::debug!("[Mux] -> {}", method);
        self.send(&Message::notification(method, params)).await
    }

    /// Send a request under a fresh id. Replies are not correlated; they are logged and dropped
    /// by the read loop.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Id, NotedownError> {
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!("[Mux] -> {} (id {})", method, id);
        self.send(&Message::request(id.clone(), method, params))
            .await?;
        Ok(id)
    }

    pub async fn respond(&self, response: Response) -> Result<(), NotedownError> {
        self.send(&Message::Response(response)).await
    }
}

pub struct Mux {
    requests: RwLock<HashMap<String, RequestHandler>>,
    notifications: RwLock<HashMap<String, NotificationHandler>>,
    outbound: Outbound,
}

impl Mux {
    pub fn new<W: AsyncWrite + Send + 'static>(writer: W) -> Self {
        Mux {
            requests: RwLock::new(HashMap::new()),
            notifications: RwLock::new(HashMap::new()),
            outbound: Outbound::new(writer),
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Register the handler for a request method, replacing any previous one.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NotedownError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| {
            Box::pin(handler(params)) as BoxFuture<Result<Value, NotedownError>>
        });
        self.requests.write().insert(method.to_string(), handler);
    }

    /// Register the handler for a notification method, replacing any previous one.
    pub fn on_notification<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler =
            Arc::new(move |params| Box::pin(handler(params)) as BoxFuture<()>);
        self.notifications.write().insert(method.to_string(), handler);
    }

    pub fn handles_request(&self, method: &str) -> bool {
        self.requests.read().contains_key(method)
    }

    pub fn handles_notification(&self, method: &str) -> bool {
        self.notifications.read().contains_key(method)
    }

    /// Read and dispatch messages until end of stream or until `cancel` fires.
    ///
    /// At end of stream in-flight handlers are awaited; on cancellation they are aborted.
    #[tracing::instrument(skip_all)]
    pub async fn serve<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        cancel: CancellationToken,
    ) -> Result<(), NotedownError> {
        let mut reader = MessageReader::new(reader);
        let mut in_flight = JoinSet::new();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<(NotificationHandler, Value, String)>();
        let notify_worker = tokio::spawn(run_notifications(notify_rx));

        let result = loop {
            while in_flight.try_join_next().is_some() {}
            let frame = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = reader.read_frame() => frame,
            };
            let body = match frame {
                Ok(Some(body)) => body,
                Ok(None) => break Ok(()),
                Err(NotedownError::Protocol(message)) => {
                    tracing::warn!("[Mux] Bad frame: {}", message);
                    continue;
                }
                Err(e) => break Err(e),
            };
            match Message::from_slice(&body) {
                Ok(Message::Request(request)) => {
                    let handler = self.requests.read().get(&request.method).cloned();
                    let outbound = self.outbound.clone();
                    in_flight.spawn(dispatch_request(request, handler, outbound));
                }
                Ok(Message::Notification(Notification { method, params })) => {
                    let handler = self.notifications.read().get(&method).cloned();
                    match handler {
                        Some(handler) => {
                            tracing::debug!("[Mux] <- {}", method);
                            let params = params.unwrap_or(Value::Null);
                            if notify_tx.send((handler, params, method)).is_err() {
                                tracing::error!("[Mux] Notification worker stopped");
                            }
                        }
                        None => tracing::warn!("[Mux] Unhandled notification {}", method),
                    }
                }
                Ok(Message::Response(response)) => {
                    tracing::debug!("[Mux] Ignoring client response to {}", response.id);
                }
                Err(invalid) => {
                    tracing::warn!("[Mux] Invalid message: {}", invalid.error.message);
                    let response = Response::error(invalid.id.unwrap_or(Id::Null), invalid.error);
                    if let Err(e) = self.outbound.respond(response).await {
                        break Err(e);
                    }
                }
            }
        };

        drop(notify_tx);
        if cancel.is_cancelled() {
            in_flight.abort_all();
            notify_worker.abort();
        } else if let Err(e) = notify_worker.await {
            tracing::error!("[Mux] Notification worker failed: {}", e);
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!("[Mux] Request task failed: {}", e);
                }
            }
        }
        tracing::debug!("[Mux] Read loop stopped");
        result
    }
}

async fn dispatch_request(request: Request, handler: Option<RequestHandler>, outbound: Outbound) {
    let Request { id, method, params } = request;
    let response = match handler {
        None => {
            tracing::debug!("[Mux] <- {} (id {}): no handler", method, id);
            Response::error(
                id,
                RpcError::new(ErrorCode::MethodNotFound, format!("Method not found: {method}")),
            )
        }
        Some(handler) => {
            tracing::debug!("[Mux] <- {} (id {})", method, id);
            // The handler runs in a task of its own so a panic is contained to this request.
            let outcome = tokio::spawn(handler(params.unwrap_or(Value::Null))).await;
            match outcome {
                Ok(Ok(result)) => Response::success(id, result),
                Ok(Err(e)) => {
                    tracing::debug!("[Mux] {} failed: {}", method, e);
                    Response::error(id, RpcError::from(&e))
                }
                Err(e) => {
                    tracing::error!("[Mux] {} handler panicked: {}", method, e);
                    Response::error(
                        id,
                        RpcError::new(ErrorCode::InternalError, format!("{method} handler failed")),
                    )
                }
            }
        }
    };
    if let Err(e) = outbound.respond(response).await {
        tracing::warn!("[Mux] Could not write response: {}", e);
    }
}

async fn run_notifications(mut rx: mpsc::UnboundedReceiver<(NotificationHandler, Value, String)>) {
    while let Some((handler, params, method)) = rx.recv().await {
        if let Err(e) = tokio::spawn(handler(params)).await {
            tracing::error!("[Mux] {} handler panicked: {}", method, e);
        }
    }
}
