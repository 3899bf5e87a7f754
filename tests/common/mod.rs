//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use notedown_core::{
    config::ConfigProvider,
    rpc::{encode_frame, MessageReader, Mux},
    server::Server,
};
use serde_json::{json, Value};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Write `files` (relative path, content) below `root`, creating directories as needed.
#[allow(dead_code)]
pub fn write_notes(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

#[allow(dead_code)]
pub fn file_uri(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

/// The client half of an in-memory connection to a running [`Server`].
#[allow(dead_code)]
pub struct TestClient {
    pub server: Arc<Server>,
    reader: MessageReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_id: i64,
    serve_task: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestClient {
    pub fn start() -> TestClient {
        TestClient::start_with(None)
    }

    /// Like [`TestClient::start`], with the configuration coming from `provider` when given.
    pub fn start_with(provider: Option<Arc<dyn ConfigProvider>>) -> TestClient {
        let (client, server_stream) = tokio::io::duplex(1024 * 1024);
        let (server_read, server_write) = tokio::io::split(server_stream);
        let mux = Mux::new(server_write);
        let mut server = Server::new(mux.outbound());
        if let Some(provider) = provider {
            server = server.with_config_provider(provider);
        }
        let server = Arc::new(server);
        server.register(&mux);
        let token = server.shutdown_token();
        let serve_task = tokio::spawn(async move {
            mux.serve(server_read, token).await.unwrap();
        });
        let (client_read, client_write) = tokio::io::split(client);
        TestClient {
            server,
            reader: MessageReader::new(client_read),
            writer: client_write,
            next_id: 1,
            serve_task,
        }
    }

    /// Start a server and initialize it with `root` as the only workspace folder, waiting for
    /// the initial scan.
    pub async fn initialized(root: &Path) -> TestClient {
        TestClient::initialized_with(root, None).await
    }

    pub async fn initialized_with(
        root: &Path,
        provider: Option<Arc<dyn ConfigProvider>>,
    ) -> TestClient {
        let mut client = TestClient::start_with(provider);
        let response = client
            .request(
                "initialize",
                json!({
                    "capabilities": {},
                    "workspaceFolders": [{"uri": file_uri(root), "name": "notes"}]
                }),
            )
            .await;
        assert!(response.get("result").is_some(), "{response}");
        client.notify("initialized", json!({})).await;
        client.server.wait_for_scan().await;
        client
    }

    pub async fn send(&mut self, message: Value) {
        let body = serde_json::to_vec(&message).unwrap();
        self.writer.write_all(&encode_frame(&body)).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Send a request and return its response, skipping interleaved notifications.
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        self.read_until(|msg| msg.get("id") == Some(&json!(id)))
            .await
    }

    pub async fn read(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(10), self.reader.read_frame())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_slice(&frame).unwrap()
    }

    pub async fn read_until<F: Fn(&Value) -> bool>(&mut self, matches: F) -> Value {
        for _ in 0..100 {
            let message = self.read().await;
            if matches(&message) {
                return message;
            }
        }
        panic!("no matching message from the server");
    }

    /// Next `publishDiagnostics` for `uri`.
    pub async fn diagnostics_for(&mut self, uri: &str) -> Vec<Value> {
        let message = self
            .read_until(|msg| {
                msg.get("method") == Some(&json!("textDocument/publishDiagnostics"))
                    && msg.pointer("/params/uri") == Some(&json!(uri))
            })
            .await;
        message
            .pointer("/params/diagnostics")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn open(&mut self, uri: &str, text: &str) -> Vec<Value> {
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {"uri": uri, "languageId": "markdown", "version": 1, "text": text}
            }),
        )
        .await;
        self.diagnostics_for(uri).await
    }

    /// Wait for the serve loop to end.
    pub async fn finished(self) {
        tokio::time::timeout(Duration::from_secs(10), self.serve_task)
            .await
            .expect("serve loop did not stop")
            .unwrap();
    }
}
