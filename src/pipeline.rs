//! Streaming parse → filter → extract pipeline.
//!
//! ```text
//!  FileInfo ──▶ parse × N ──▶ filter × 1 ──▶ extract × M ──▶ DocumentRecord
//! ```
//!
//! Stages are connected by capacity-1 channels so a slow consumer applies back-pressure all the
//! way to the input. Each worker owns a clone of its stage's output sender; the output channel
//! closes once the last worker of the stage finishes, which in turn lets the next stage drain
//! and stop. The supervisor joins the stages in topological order.
//!
//! Cancelling the token makes every stage stop at its next receive or send. Records emitted
//! before that point are still delivered, and [`PipelineOutput::status`] reports
//! [`NotedownError::OperationCancelled`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::DocumentCache,
    codec::{frontmatter, Document, Metadata, Parser},
    config::NotedownConfig,
    error::NotedownError,
    filter::{evaluate, FilterExpression},
    index::FileInfo,
};

pub const MAX_PARSERS: usize = 20;
pub const MAX_EXTRACTORS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WikilinkRecord {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    pub has_pipe: bool,
    /// 1-based source line.
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// State as written in the checkbox.
    pub state: String,
    /// Name of the vocabulary entry the state resolves to.
    pub name: String,
    pub text: String,
    pub line: usize,
}

/// Public summary of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub path: String,
    /// SHA-256 of the file content, lowercase hex.
    pub checksum: String,
    pub metadata: Metadata,
    pub wikilinks: Vec<WikilinkRecord>,
    pub tasks: Vec<TaskRecord>,
}

/// Output of the parse stage.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub file: FileInfo,
    pub checksum: String,
    pub metadata: Metadata,
    pub ast: Option<Document>,
    /// Set when the summary came from the cache and the file was not parsed.
    pub cached: Option<DocumentRecord>,
    pub error: Option<String>,
}

impl ParsedDocument {
    fn failed(file: FileInfo, error: String) -> Self {
        ParsedDocument {
            file,
            checksum: String::new(),
            metadata: Metadata::new(),
            ast: None,
            cached: None,
            error: Some(error),
        }
    }
}

/// A document dropped by the pipeline and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Records sorted by path.
    pub records: Vec<DocumentRecord>,
    pub errors: Vec<DocumentError>,
    pub cancelled: bool,
}

impl PipelineOutput {
    pub fn status(&self) -> Result<(), NotedownError> {
        if self.cancelled {
            Err(NotedownError::OperationCancelled)
        } else {
            Ok(())
        }
    }
}

/// A running pipeline: consume `records`, then await `finish` for the dropped documents.
pub struct PipelineRun {
    pub records: mpsc::Receiver<DocumentRecord>,
    supervisor: JoinHandle<Vec<DocumentError>>,
}

impl PipelineRun {
    pub async fn finish(self) -> Vec<DocumentError> {
        drop(self.records);
        match self.supervisor.await {
            Ok(errors) => errors,
            Err(e) => {
                tracing::error!("[Pipeline] Supervisor task failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    parser: Parser,
    cache: Option<Arc<DocumentCache>>,
    parsers: usize,
    extractors: usize,
}

impl Pipeline {
    pub fn new(config: &NotedownConfig) -> Self {
        Pipeline {
            parser: Parser::new(config.tasks.clone()),
            cache: None,
            parsers: MAX_PARSERS,
            extractors: MAX_EXTRACTORS,
        }
    }

    pub fn with_cache(mut self, cache: Arc<DocumentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Worker counts are clamped to `1..=MAX_PARSERS` and `1..=MAX_EXTRACTORS`.
    pub fn with_workers(mut self, parsers: usize, extractors: usize) -> Self {
        self.parsers = parsers.clamp(1, MAX_PARSERS);
        self.extractors = extractors.clamp(1, MAX_EXTRACTORS);
        self
    }

    /// Start the stages over a stream of files.
    pub fn spawn(
        &self,
        input: mpsc::Receiver<FileInfo>,
        filter: Option<FilterExpression>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let (parsed_tx, parsed_rx) = mpsc::channel::<ParsedDocument>(1);
        let (kept_tx, kept_rx) = mpsc::channel::<ParsedDocument>(1);
        let (out_tx, out_rx) = mpsc::channel::<DocumentRecord>(1);

        let input = Arc::new(Mutex::new(input));
        let mut parse_stage = JoinSet::new();
        for _ in 0..self.parsers {
            parse_stage.spawn(parse_worker(
                self.clone(),
                input.clone(),
                parsed_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(parsed_tx);

        let filter_stage = tokio::spawn(filter_worker(parsed_rx, kept_tx, filter, cancel.clone()));

        let kept_rx = Arc::new(Mutex::new(kept_rx));
        let mut extract_stage = JoinSet::new();
        for _ in 0..self.extractors {
            extract_stage.spawn(extract_worker(
                self.clone(),
                kept_rx.clone(),
                out_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(out_tx);

        let supervisor = tokio::spawn(async move {
            while let Some(joined) = parse_stage.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("[Pipeline] Parse worker failed: {}", e);
                }
            }
            let errors = filter_stage.await.unwrap_or_else(|e| {
                tracing::error!("[Pipeline] Filter stage failed: {}", e);
                Vec::new()
            });
            while let Some(joined) = extract_stage.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("[Pipeline] Extract worker failed: {}", e);
                }
            }
            errors
        });

        PipelineRun {
            records: out_rx,
            supervisor,
        }
    }

    /// Run the pipeline over `files` and collect every record.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        files: Vec<FileInfo>,
        filter: Option<FilterExpression>,
        cancel: CancellationToken,
    ) -> PipelineOutput {
        let total = files.len();
        let (input_tx, input_rx) = mpsc::channel::<FileInfo>(1);
        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for file in files {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    sent = input_tx.send(file) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut run = self.spawn(input_rx, filter, cancel.clone());
        let mut records = Vec::new();
        while let Some(record) = run.records.recv().await {
            records.push(record);
        }
        let errors = run.finish().await;
        if let Err(e) = feeder.await {
            tracing::error!("[Pipeline] Input feeder failed: {}", e);
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let cancelled = cancel.is_cancelled();
        tracing::debug!(
            "[Pipeline] {} of {} files produced records, {} errors{}",
            records.len(),
            total,
            errors.len(),
            if cancelled { " (cancelled)" } else { "" }
        );
        PipelineOutput {
            records,
            errors,
            cancelled,
        }
    }

    /// Parse stage body for one file.
    pub async fn parse_file(&self, file: FileInfo) -> ParsedDocument {
        if let Some(record) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&file.path, &file.uri, file.mtime))
        {
            return ParsedDocument {
                checksum: record.checksum.clone(),
                metadata: record.metadata.clone(),
                file,
                ast: None,
                cached: Some(record),
                error: None,
            };
        }
        let Some(path) = file.fs_path() else {
            let uri = file.uri.clone();
            return ParsedDocument::failed(file, format!("Not a file URI: {uri}"));
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let message = NotedownError::from(e).to_string();
                return ParsedDocument::failed(file, message);
            }
        };
        let checksum = checksum(&bytes);
        let ast = self.parser.parse_bytes(&bytes);
        ParsedDocument {
            file,
            checksum,
            metadata: ast.metadata.clone(),
            ast: Some(ast),
            cached: None,
            error: None,
        }
    }

    /// Extract stage body for one document.
    pub fn extract(&self, parsed: ParsedDocument) -> DocumentRecord {
        if let Some(mut record) = parsed.cached {
            record.path = parsed.file.path;
            return record;
        }
        let record = match parsed.ast.as_ref() {
            Some(ast) => extract_record(
                &parsed.file.path,
                &parsed.checksum,
                ast,
                &self.parser,
            ),
            None => DocumentRecord {
                path: parsed.file.path.clone(),
                checksum: parsed.checksum.clone(),
                metadata: frontmatter::subset(&parsed.metadata),
                ..Default::default()
            },
        };
        if let Some(cache) = self.cache.as_ref() {
            cache.insert(
                &parsed.file.path,
                &parsed.file.uri,
                parsed.file.mtime,
                record.clone(),
            );
        }
        record
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Strip the leading `[state]` checkbox from a task's text.
fn task_text(raw: &str, state: &str) -> String {
    let raw = raw.trim_start();
    raw.strip_prefix('[')
        .and_then(|rest| rest.strip_prefix(state))
        .and_then(|rest| rest.strip_prefix(']'))
        .unwrap_or(raw)
        .trim()
        .to_string()
}

pub fn extract_record(path: &str, checksum: &str, ast: &Document, parser: &Parser) -> DocumentRecord {
    let wikilinks = ast
        .wikilinks()
        .map(|(node, link)| WikilinkRecord {
            target: link.target.clone(),
            display_text: link.display_text.clone(),
            has_pipe: link.has_pipe,
            line: node.range.start.line,
        })
        .collect();
    let tasks = ast
        .tasks()
        .map(|(id, node, state)| TaskRecord {
            state: state.to_string(),
            name: parser
                .vocabulary()
                .resolve(state)
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            text: task_text(&ast.plain_text(id), state),
            line: node.range.start.line,
        })
        .collect();
    DocumentRecord {
        path: path.to_string(),
        checksum: checksum.to_string(),
        metadata: frontmatter::subset(&ast.metadata),
        wikilinks,
        tasks,
    }
}

/// Receive from a shared receiver unless cancelled first.
async fn recv_shared<T>(rx: &Mutex<mpsc::Receiver<T>>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = async { rx.lock().await.recv().await } => item,
    }
}

/// Send unless cancelled first. Returns false when the item could not be delivered.
async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn parse_worker(
    pipeline: Pipeline,
    input: Arc<Mutex<mpsc::Receiver<FileInfo>>>,
    output: mpsc::Sender<ParsedDocument>,
    cancel: CancellationToken,
) {
    while let Some(file) = recv_shared(&input, &cancel).await {
        let parsed = tokio::select! {
            _ = cancel.cancelled() => break,
            parsed = pipeline.parse_file(file) => parsed,
        };
        if !send_or_cancel(&output, parsed, &cancel).await {
            break;
        }
    }
}

async fn filter_worker(
    mut input: mpsc::Receiver<ParsedDocument>,
    output: mpsc::Sender<ParsedDocument>,
    filter: Option<FilterExpression>,
    cancel: CancellationToken,
) -> Vec<DocumentError> {
    let mut errors = Vec::new();
    loop {
        let parsed = tokio::select! {
            _ = cancel.cancelled() => break,
            parsed = input.recv() => match parsed {
                Some(parsed) => parsed,
                None => break,
            },
        };
        if let Some(message) = parsed.error.as_ref() {
            tracing::debug!("[Pipeline] Dropping {}: {}", parsed.file.path, message);
            errors.push(DocumentError {
                path: parsed.file.path.clone(),
                message: message.clone(),
            });
            continue;
        }
        let keep = match filter.as_ref() {
            None => true,
            Some(expr) => match evaluate(expr, &parsed.metadata) {
                Ok(keep) => keep,
                Err(e) => {
                    errors.push(DocumentError {
                        path: parsed.file.path.clone(),
                        message: e.to_string(),
                    });
                    false
                }
            },
        };
        if keep && !send_or_cancel(&output, parsed, &cancel).await {
            break;
        }
    }
    errors
}

async fn extract_worker(
    pipeline: Pipeline,
    input: Arc<Mutex<mpsc::Receiver<ParsedDocument>>>,
    output: mpsc::Sender<DocumentRecord>,
    cancel: CancellationToken,
) {
    while let Some(parsed) = recv_shared(&input, &cancel).await {
        let record = pipeline.extract(parsed);
        if !send_or_cancel(&output, record, &cancel).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterOp,
        index::WorkspaceRoot,
        scanner::Scanner,
    };
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use test_log::test;

    fn workspace(files: &[(&str, &str)]) -> (TempDir, Vec<FileInfo>) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let config = Arc::new(NotedownConfig::default());
        let root = WorkspaceRoot::from_path(dir.path()).unwrap();
        let found = Scanner::new(config).scan(&[root]);
        (dir, found)
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_task_text() {
        assert_eq!(task_text("[x] buy milk\n", "x"), "buy milk");
        assert_eq!(task_text("plain", "x"), "plain");
    }

    #[test(tokio::test)]
    async fn test_run_extracts_records() {
        let (_dir, files) = workspace(&[
            (
                "a.md",
                "---\nstatus: active\n---\n# A\n\n- [x] shipped\n- [ ] see [[b|Bee]]\n",
            ),
            ("b.md", "# B\n"),
        ]);
        let pipeline = Pipeline::new(&NotedownConfig::default());
        let output = pipeline.run(files, None, CancellationToken::new()).await;
        assert!(output.status().is_ok());
        assert_eq!(output.records.len(), 2);
        let a = &output.records[0];
        assert_eq!(a.path, "a.md");
        assert_eq!(a.metadata.get("status"), Some(&json!("active")));
        assert_eq!(a.checksum.len(), 64);
        assert_eq!(a.tasks.len(), 2);
        assert_eq!(a.tasks[0].name, "done");
        assert_eq!(a.tasks[0].text, "shipped");
        assert_eq!(a.tasks[0].line, 6);
        assert_eq!(a.wikilinks.len(), 1);
        assert_eq!(a.wikilinks[0].target, "b");
        assert_eq!(a.wikilinks[0].display_text.as_deref(), Some("Bee"));
    }

    #[test(tokio::test)]
    async fn test_filter_stage() {
        let (_dir, files) = workspace(&[
            ("a.md", "---\nstatus: active\n---\n"),
            ("b.md", "---\nstatus: done\n---\n"),
            ("c.md", "no metadata\n"),
        ]);
        let pipeline = Pipeline::new(&NotedownConfig::default()).with_workers(3, 2);
        let filter = FilterExpression::predicate("status", FilterOp::Eq, json!("active"));
        let output = pipeline
            .run(files, Some(filter), CancellationToken::new())
            .await;
        let paths: Vec<_> = output.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md"]);
    }

    #[test(tokio::test)]
    async fn test_unreadable_file_is_reported() {
        let (dir, mut files) = workspace(&[("a.md", "# A\n")]);
        let mut ghost = files[0].clone();
        ghost.uri = crate::paths::path_to_uri(&dir.path().join("ghost.md")).unwrap();
        ghost.path = "ghost.md".to_string();
        files.push(ghost);
        let output = Pipeline::new(&NotedownConfig::default())
            .run(files, None, CancellationToken::new())
            .await;
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].path, "ghost.md");
    }

    #[test(tokio::test)]
    async fn test_cancelled_before_start() {
        let (_dir, files) = workspace(&[("a.md", "# A\n"), ("b.md", "# B\n")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = Pipeline::new(&NotedownConfig::default())
            .run(files, None, cancel)
            .await;
        assert!(output.cancelled);
        assert_eq!(output.status(), Err(NotedownError::OperationCancelled));
        assert!(output.records.len() <= 2);
    }

    #[test(tokio::test)]
    async fn test_cache_hit_skips_parse() {
        let (_dir, files) = workspace(&[("a.md", "# A\n\n[[b]]\n")]);
        let cache = Arc::new(DocumentCache::in_memory());
        let pipeline = Pipeline::new(&NotedownConfig::default()).with_cache(cache.clone());
        let first = pipeline
            .run(files.clone(), None, CancellationToken::new())
            .await;
        assert_eq!(cache.len(), 1);

        let parsed = pipeline.parse_file(files[0].clone()).await;
        assert!(parsed.cached.is_some());
        assert!(parsed.ast.is_none());

        let second = pipeline.run(files, None, CancellationToken::new()).await;
        assert_eq!(first.records, second.records);
    }

    #[test(tokio::test)]
    async fn test_streaming_api() {
        let (_dir, files) = workspace(&[("a.md", "# A\n"), ("b.md", "# B\n"), ("c.md", "# C\n")]);
        let (tx, rx) = mpsc::channel(1);
        let pipeline = Pipeline::new(&NotedownConfig::default()).with_workers(1, 1);
        let mut run = pipeline.spawn(rx, None, CancellationToken::new());
        tokio::spawn(async move {
            for file in files {
                tx.send(file).await.unwrap();
            }
        });
        let mut seen = Vec::new();
        while let Some(record) = run.records.recv().await {
            seen.push(record.path);
        }
        seen.sort();
        assert_eq!(seen, vec!["a.md", "b.md", "c.md"]);
        assert!(run.finish().await.is_empty());
    }
}
