//! Language server coordinator.
//!
//! [`Server`] owns the long-lived state of one client connection: the open documents, the
//! workspace indices and the code runner. Its handlers are registered on a [`Mux`], which
//! decodes params and encodes results; the handlers themselves are plain async methods taking
//! typed `lsp_types` params.
//!
//! The workspace only exists after `initialize`, because the roots and the configuration come
//! from the client. Requests other than `initialize` fail with `InvalidRequest` until then.

use lsp_types::{
    CodeActionParams, CodeActionProviderCapability, CodeActionResponse, CompletionOptions,
    CompletionParams, CompletionResponse, DidChangeTextDocumentParams,
    DidChangeWatchedFilesParams, DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, ExecuteCommandOptions,
    ExecuteCommandParams, FoldingRange, FoldingRangeParams, FoldingRangeProviderCapability,
    GotoDefinitionParams, GotoDefinitionResponse, InitializeParams, InitializeResult, OneOf,
    PublishDiagnosticsParams, ServerCapabilities, ServerInfo, TextDocumentSyncCapability,
    TextDocumentSyncKind, Url, WorkDoneProgressOptions, WorkspaceFoldersServerCapabilities,
    WorkspaceServerCapabilities,
};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::CacheFlusher,
    codec::Parser,
    config::{ConfigProvider, DirConfigProvider, NotedownConfig},
    error::NotedownError,
    event::FileChangeKind,
    filter::FilterExpression,
    index::WorkspaceRoot,
    paths::uri_to_path,
    pipeline::{DocumentError, DocumentRecord},
    rpc::{params, Mux, Outbound},
    runner::{collect_blocks, CodeRunner},
    store::{DocumentStore, OpenDocument},
    workspace::Workspace,
};

pub mod commands;
pub mod diagnostics;
pub mod features;

use commands::Command;

pub const SERVER_NAME: &str = "notedown";
pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub const LIST_DOCUMENTS: &str = "notedown/listDocuments";

/// Capabilities returned from `initialize`.
pub fn capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec!["[".to_string()]),
            ..Default::default()
        }),
        definition_provider: Some(OneOf::Left(true)),
        folding_range_provider: Some(FoldingRangeProviderCapability::Simple(true)),
        code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: commands::COMMANDS.iter().map(|c| c.to_string()).collect(),
            work_done_progress_options: WorkDoneProgressOptions::default(),
        }),
        workspace: Some(WorkspaceServerCapabilities {
            workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                supported: Some(true),
                change_notifications: Some(OneOf::Left(true)),
            }),
            file_operations: None,
        }),
        ..ServerCapabilities::default()
    }
}

/// Workspace roots announced by the client: workspace folders win over the deprecated root uri,
/// which wins over the deprecated root path. Non-file folders are skipped.
#[allow(deprecated)]
pub fn workspace_roots(params: &InitializeParams) -> Vec<WorkspaceRoot> {
    if let Some(folders) = params.workspace_folders.as_ref().filter(|f| !f.is_empty()) {
        return folders
            .iter()
            .filter_map(|folder| {
                usable_root(WorkspaceRoot::from_uri(
                    folder.uri.as_str(),
                    Some(&folder.name),
                ))
            })
            .collect();
    }
    if let Some(uri) = params.root_uri.as_ref() {
        return usable_root(WorkspaceRoot::from_uri(uri.as_str(), None))
            .into_iter()
            .collect();
    }
    if let Some(path) = params.root_path.as_ref().filter(|p| !p.is_empty()) {
        return usable_root(WorkspaceRoot::from_path(path))
            .into_iter()
            .collect();
    }
    Vec::new()
}

fn usable_root(root: Result<WorkspaceRoot, NotedownError>) -> Option<WorkspaceRoot> {
    match root {
        Ok(root) => Some(root),
        Err(e) => {
            tracing::warn!("[Server] Skipping workspace root: {}", e);
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListDocumentsParams {
    #[serde(default)]
    pub filter: Option<FilterExpression>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListDocumentsResult {
    pub documents: Vec<DocumentRecord>,
    pub errors: Vec<DocumentError>,
}

/// State created by `initialize`.
struct Session {
    workspace: Arc<Workspace>,
    parser: Parser,
    runner: CodeRunner,
    flusher_cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    async fn stop_flusher(&self) {
        self.flusher_cancel.cancel();
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("[Server] Cache flusher failed: {}", e);
            }
        }
    }
}

pub struct Server {
    outbound: Outbound,
    provider: Option<Arc<dyn ConfigProvider>>,
    session: RwLock<Option<Arc<Session>>>,
    store: DocumentStore,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    scanned: watch::Sender<bool>,
}

impl Server {
    pub fn new(outbound: Outbound) -> Self {
        let (scanned, _) = watch::channel(true);
        Server {
            outbound,
            provider: None,
            session: RwLock::new(None),
            store: DocumentStore::new(),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            scanned,
        }
    }

    /// Use `provider` instead of the settings file below the first root.
    pub fn with_config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Fires on `exit`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// The workspace, once initialized.
    pub fn workspace(&self) -> Option<Arc<Workspace>> {
        self.session.read().as_ref().map(|s| s.workspace.clone())
    }

    fn session(&self) -> Result<Arc<Session>, NotedownError> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| NotedownError::Protocol("Server not initialized".to_string()))
    }

    /// Resolves once the scan started by `initialize` or a folder change has finished.
    pub async fn wait_for_scan(&self) {
        let mut scanned = self.scanned.subscribe();
        let _ = scanned.wait_for(|done| *done).await;
    }

    pub fn register(self: &Arc<Self>, mux: &Mux) {
        self.on_request(mux, "initialize", Server::initialize);
        self.on_request(mux, "shutdown", Server::shutdown);
        self.on_request(mux, "textDocument/definition", Server::definition);
        self.on_request(mux, "textDocument/completion", Server::completion);
        self.on_request(mux, "textDocument/foldingRange", Server::folding_range);
        self.on_request(mux, "textDocument/codeAction", Server::code_action);
        self.on_request(mux, "workspace/executeCommand", Server::execute_command);
        self.on_request(mux, LIST_DOCUMENTS, Server::list_documents);

        self.on_notification(mux, "initialized", Server::initialized);
        self.on_notification(mux, "exit", Server::exit);
        self.on_notification(mux, "textDocument/didOpen", Server::did_open);
        self.on_notification(mux, "textDocument/didChange", Server::did_change);
        self.on_notification(mux, "textDocument/didClose", Server::did_close);
        self.on_notification(mux, "textDocument/didSave", Server::did_save);
        self.on_notification(
            mux,
            "workspace/didChangeWatchedFiles",
            Server::did_change_watched_files,
        );
        self.on_notification(
            mux,
            "workspace/didChangeWorkspaceFolders",
            Server::did_change_workspace_folders,
        );
        self.on_notification(mux, "$/cancelRequest", Server::ignore);
        self.on_notification(mux, "$/progress", Server::ignore);
    }

    fn on_request<P, R, F, Fut>(self: &Arc<Self>, mux: &Mux, method: &'static str, handler: F)
    where
        P: DeserializeOwned,
        R: Serialize,
        F: Fn(Arc<Server>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, NotedownError>> + Send + 'static,
    {
        let server = self.clone();
        mux.on_request(method, move |value| {
            let call = server
                .accepting(method)
                .and_then(|_| params::<P>(value))
                .map(|p| handler(server.clone(), p));
            async move { Ok(serde_json::to_value(call?.await?)?) }
        });
    }

    fn on_notification<P, F, Fut>(self: &Arc<Self>, mux: &Mux, method: &'static str, handler: F)
    where
        P: DeserializeOwned,
        F: Fn(Arc<Server>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NotedownError>> + Send + 'static,
    {
        let server = self.clone();
        mux.on_notification(method, move |value| {
            let call = params::<P>(value).map(|p| handler(server.clone(), p));
            async move {
                let result = match call {
                    Ok(fut) => fut.await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!("[Server] {} failed: {}", method, e);
                }
            }
        });
    }

    fn accepting(&self, method: &str) -> Result<(), NotedownError> {
        if self.is_shutting_down() && method != "shutdown" {
            return Err(NotedownError::Protocol(format!(
                "Server is shutting down, refusing {method}"
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn initialize(
        self: Arc<Self>,
        params: InitializeParams,
    ) -> Result<InitializeResult, NotedownError> {
        let roots = workspace_roots(&params);
        let session = {
            let mut slot = self.session.write();
            if slot.is_some() {
                return Err(NotedownError::Protocol(
                    "initialize may only be sent once".to_string(),
                ));
            }
            let config = Arc::new(match (&self.provider, roots.first()) {
                (Some(provider), _) => provider.load_or_default(),
                (None, Some(root)) => DirConfigProvider::new(&root.path).load_or_default(),
                (None, None) => NotedownConfig::default(),
            });
            tracing::info!(
                "[Server] Initializing with roots {:?}",
                roots.iter().map(|r| r.uri.as_str()).collect::<Vec<_>>()
            );
            let workspace = Arc::new(Workspace::new(config.clone(), roots));
            let flusher_cancel = self.shutdown.child_token();
            let flusher = CacheFlusher::spawn(
                workspace.cache().clone(),
                config.cache_flush_interval,
                flusher_cancel.clone(),
            );
            let session = Arc::new(Session {
                workspace,
                parser: Parser::new(config.tasks.clone()),
                runner: CodeRunner::new(config.code_timeout),
                flusher_cancel,
                flusher: Mutex::new(Some(flusher)),
            });
            *slot = Some(session.clone());
            session
        };
        self.start_scan(session);
        Ok(InitializeResult {
            capabilities: capabilities(),
            server_info: Some(ServerInfo {
                name: SERVER_NAME.to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    /// Rescan every root in the background, then refresh the open documents.
    fn start_scan(self: &Arc<Self>, session: Arc<Session>) {
        self.scanned.send_replace(false);
        let server = self.clone();
        tokio::spawn(async move {
            match session.workspace.scan_async().await {
                Ok(count) => tracing::info!("[Server] Indexed {} files", count),
                Err(e) => tracing::error!("[Server] Scan task failed: {}", e),
            }
            server.refresh_open_documents(&session).await;
            server.scanned.send_replace(true);
        });
    }

    async fn initialized(self: Arc<Self>, _params: Value) -> Result<(), NotedownError> {
        tracing::debug!("[Server] Client initialized");
        Ok(())
    }

    async fn shutdown(self: Arc<Self>, _params: Value) -> Result<(), NotedownError> {
        tracing::info!("[Server] Shutdown requested");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.close().await;
        Ok(())
    }

    async fn exit(self: Arc<Self>, _params: Value) -> Result<(), NotedownError> {
        if !self.is_shutting_down() {
            tracing::warn!("[Server] Exit without a prior shutdown request");
        }
        self.shutdown.cancel();
        Ok(())
    }

    async fn ignore(self: Arc<Self>, _params: Value) -> Result<(), NotedownError> {
        tracing::debug!("[Server] Ignoring notification");
        Ok(())
    }

    /// Stop the cache flusher, which writes the cache one last time.
    pub async fn close(&self) {
        let session = self.session.read().clone();
        if let Some(session) = session {
            session.stop_flusher().await;
        }
    }

    async fn did_open(
        self: Arc<Self>,
        params: DidOpenTextDocumentParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        let item = params.text_document;
        let uri = item.uri.to_string();
        let doc = self.store.open(&uri, item.text, item.version);
        session.workspace.refresh_document(&uri, &doc.content);
        self.publish_diagnostics(&session, &doc).await
    }

    async fn did_change(
        self: Arc<Self>,
        params: DidChangeTextDocumentParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        let uri = params.text_document.uri.to_string();
        let version = params.text_document.version;
        // Full sync: the last change carries the whole text.
        let Some(change) = params.content_changes.into_iter().last() else {
            return Ok(());
        };
        let updated = match self.store.set(&uri, change.text.clone(), version) {
            Ok(updated) => updated,
            Err(NotedownError::NotFound(_)) => {
                tracing::warn!("[Server] didChange for unopened {}, opening it", uri);
                self.store.open(&uri, change.text, version);
                true
            }
            Err(e) => return Err(e),
        };
        if !updated {
            return Ok(());
        }
        let Some(doc) = self.store.get(&uri) else {
            return Ok(());
        };
        session.workspace.refresh_document(&uri, &doc.content);
        self.publish_diagnostics(&session, &doc).await
    }

    async fn did_close(
        self: Arc<Self>,
        params: DidCloseTextDocumentParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        let uri = params.text_document.uri;
        self.store.remove(uri.as_str());
        session.workspace.wikilinks().remove_document(uri.as_str());
        let cleared = PublishDiagnosticsParams::new(uri, Vec::new(), None);
        self.outbound
            .publish(PUBLISH_DIAGNOSTICS, serde_json::to_value(cleared)?)
            .await
    }

    async fn did_save(
        self: Arc<Self>,
        params: DidSaveTextDocumentParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        let uri = params.text_document.uri.to_string();
        if session
            .workspace
            .apply_file_change(&uri, FileChangeKind::Changed)?
        {
            self.refresh_open_documents(&session).await;
        }
        Ok(())
    }

    async fn did_change_watched_files(
        self: Arc<Self>,
        params: DidChangeWatchedFilesParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        for event in params.changes {
            let Ok(kind) = FileChangeKind::try_from(event.typ) else {
                tracing::warn!("[Server] Unknown file change type {:?}", event.typ);
                continue;
            };
            if let Err(e) = session.workspace.apply_file_change(event.uri.as_str(), kind) {
                tracing::warn!("[Server] Could not apply {:?} {}: {}", kind, event.uri, e);
            }
        }
        self.refresh_open_documents(&session).await;
        Ok(())
    }

    async fn did_change_workspace_folders(
        self: Arc<Self>,
        params: DidChangeWorkspaceFoldersParams,
    ) -> Result<(), NotedownError> {
        let session = self.session()?;
        for folder in params.event.removed {
            if session.workspace.remove_root(folder.uri.as_str()).is_none() {
                tracing::debug!("[Server] Removed folder {} was not a root", folder.uri);
            }
        }
        for folder in params.event.added {
            if let Some(root) = usable_root(WorkspaceRoot::from_uri(
                folder.uri.as_str(),
                Some(&folder.name),
            )) {
                session.workspace.add_root(root);
            }
        }
        self.start_scan(session);
        Ok(())
    }

    async fn definition(
        self: Arc<Self>,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>, NotedownError> {
        let session = self.session()?;
        let position = params.text_document_position_params;
        let Some(doc) = self.store.get(position.text_document.uri.as_str()) else {
            return Ok(None);
        };
        let locations = features::definition(&doc.content, position.position, &session.workspace);
        if locations.is_empty() {
            Ok(None)
        } else {
            Ok(Some(GotoDefinitionResponse::Array(locations)))
        }
    }

    async fn completion(
        self: Arc<Self>,
        params: CompletionParams,
    ) -> Result<Option<CompletionResponse>, NotedownError> {
        let session = self.session()?;
        let position = params.text_document_position;
        let Some(doc) = self.store.get(position.text_document.uri.as_str()) else {
            return Ok(None);
        };
        let items = features::completion(&doc.content, position.position, &session.workspace);
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn folding_range(
        self: Arc<Self>,
        params: FoldingRangeParams,
    ) -> Result<Option<Vec<FoldingRange>>, NotedownError> {
        let session = self.session()?;
        let Some(doc) = self.store.get(params.text_document.uri.as_str()) else {
            return Ok(None);
        };
        let parsed = session.parser.parse(&doc.content);
        Ok(Some(features::folding_ranges(&doc.content, &parsed)))
    }

    async fn code_action(
        self: Arc<Self>,
        params: CodeActionParams,
    ) -> Result<Option<CodeActionResponse>, NotedownError> {
        let session = self.session()?;
        let Some(doc) = self.store.get(params.text_document.uri.as_str()) else {
            return Ok(None);
        };
        let actions = features::code_actions(&doc.content, params.range.start, &session.workspace);
        Ok(Some(actions))
    }

    #[tracing::instrument(skip_all, fields(command = %params.command))]
    async fn execute_command(
        self: Arc<Self>,
        params: ExecuteCommandParams,
    ) -> Result<Value, NotedownError> {
        let session = self.session()?;
        let command = Command::parse(&params.command, params.arguments)?;
        let content = self.document_text(command.uri()).await?;
        match command {
            Command::ListItemBoundaries { position, .. } => {
                let parsed = session.parser.parse(&content);
                Ok(serde_json::to_value(commands::list_item_boundaries(
                    &content, &parsed, position,
                ))?)
            }
            Command::ConcealRanges { .. } => {
                Ok(serde_json::to_value(commands::conceal_ranges(&content))?)
            }
            Command::ExecuteCodeBlocks { uri, language } => {
                let parsed = session.parser.parse(&content);
                let Some((spec, blocks)) = collect_blocks(&parsed, language.as_deref()) else {
                    return Err(NotedownError::Command(match language {
                        Some(language) => format!("No runnable {language} code blocks in {uri}"),
                        None => format!("No runnable code blocks in {uri}"),
                    }));
                };
                let working_dir = self.working_dir(&session, &uri);
                tracing::info!(
                    "[Server] Running {} {} block(s) from {}",
                    blocks.len(),
                    spec.name,
                    uri
                );
                let result = session.runner.run(spec.name, &blocks, &working_dir).await?;
                Ok(serde_json::to_value(result)?)
            }
        }
    }

    async fn list_documents(
        self: Arc<Self>,
        params: Option<ListDocumentsParams>,
    ) -> Result<ListDocumentsResult, NotedownError> {
        let session = self.session()?;
        self.wait_for_scan().await;
        let filter = params.and_then(|p| p.filter);
        let output = session
            .workspace
            .list_documents(filter, self.shutdown.child_token())
            .await;
        output.status()?;
        for error in output.errors.iter() {
            tracing::warn!("[Server] Skipped {}: {}", error.path, error.message);
        }
        Ok(ListDocumentsResult {
            documents: output.records,
            errors: output.errors,
        })
    }

    /// Open document content, falling back to the file on disk.
    async fn document_text(&self, uri: &str) -> Result<String, NotedownError> {
        if let Some(doc) = self.store.get(uri) {
            return Ok(doc.content);
        }
        let path = uri_to_path(uri)
            .ok_or_else(|| NotedownError::NotFound(format!("Document is not open: {uri}")))?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    fn working_dir(&self, session: &Session, uri: &str) -> PathBuf {
        uri_to_path(uri)
            .and_then(|path| path.parent().map(|p| p.to_path_buf()))
            .filter(|dir| dir.is_dir())
            .or_else(|| session.workspace.roots().first().map(|r| r.path.clone()))
            .unwrap_or_else(std::env::temp_dir)
    }

    async fn refresh_open_documents(&self, session: &Session) {
        for doc in self.store.snapshot() {
            session.workspace.refresh_document(&doc.uri, &doc.content);
            if let Err(e) = self.publish_diagnostics(session, &doc).await {
                tracing::warn!("[Server] Could not publish diagnostics for {}: {}", doc.uri, e);
            }
        }
    }

    async fn publish_diagnostics(
        &self,
        session: &Session,
        doc: &OpenDocument,
    ) -> Result<(), NotedownError> {
        let parsed = session.parser.parse(&doc.content);
        let diagnostics = diagnostics::compute(
            &doc.content,
            &parsed,
            &session.workspace,
            session.parser.vocabulary(),
        );
        let params =
            PublishDiagnosticsParams::new(Url::parse(&doc.uri)?, diagnostics, Some(doc.version));
        self.outbound
            .publish(PUBLISH_DIAGNOSTICS, serde_json::to_value(params)?)
            .await
    }
}

/// Serve one client over `reader`/`writer` until `exit` or end of stream.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    provider: Option<Arc<dyn ConfigProvider>>,
) -> Result<(), NotedownError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + 'static,
{
    let mux = Mux::new(writer);
    let mut server = Server::new(mux.outbound());
    if let Some(provider) = provider {
        server = server.with_config_provider(provider);
    }
    let server = Arc::new(server);
    server.register(&mux);
    let result = mux.serve(reader, server.shutdown_token()).await;
    server.close().await;
    tracing::info!("[Server] Connection closed");
    result
}
