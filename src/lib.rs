//! # notedown-core
//!
//! Workspace engine and language server backend for Notedown flavoured Markdown: notes linked
//! with `[[wikilinks]]`, task checkboxes with a configurable state vocabulary, YAML frontmatter
//! and runnable code blocks.
//!
//! ## Overview
//!
//! The crate keeps two indices per workspace. The **file index** ([`index::FileIndex`]) tracks
//! every Markdown file below the workspace roots, fed by a full [`scanner::Scanner`] pass and
//! then by file events, either from the LSP client or from the local recursive watcher
//! ([`watch::RecursiveWatcher`]). The **wikilink index** ([`index::WikilinkIndex`]) records,
//! for every link target, which files it resolves to and which documents reference it, which is
//! what ambiguity diagnostics, go-to-definition and "create note" code actions are built on.
//!
//! Documents are parsed through a single facade ([`codec::Parser`]) into an arena-backed block
//! and inline tree ([`codec::Document`]). The [`pipeline`] module streams parsed documents
//! through a parse → filter → extract pipeline with bounded channels, filtering on frontmatter
//! with [`filter::FilterExpression`] and reusing summaries from the on-disk [`cache`].
//!
//! ## Language server
//!
//! [`server::Server`] speaks JSON-RPC 2.0 over `Content-Length` framed streams through the
//! [`rpc::Mux`]. It implements full document sync, diagnostics, completion, definition,
//! folding ranges, code actions and three custom commands:
//!
//! - `notedown.getListItemBoundaries`
//! - `notedown.getConcealRanges`
//! - `notedown.executeCodeBlocks` (see [`runner::CodeRunner`])
//!
//! ```no_run
//! # async fn run() -> Result<(), notedown_core::NotedownError> {
//! notedown_core::server::serve(tokio::io::stdin(), tokio::io::stdout(), None).await
//! # }
//! ```
//!
//! ## Listing documents
//!
//! ```no_run
//! use std::sync::Arc;
//! use notedown_core::{
//!     config::NotedownConfig, filter::FilterExpression, index::WorkspaceRoot,
//!     workspace::Workspace,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), notedown_core::NotedownError> {
//! let root = WorkspaceRoot::from_path("/home/me/notes")?;
//! let workspace = Workspace::new(Arc::new(NotedownConfig::default()), vec![root]);
//! workspace.scan();
//! let filter: FilterExpression =
//!     serde_json::from_str(r#"{"field": "status", "op": "eq", "value": "active"}"#)?;
//! let output = workspace
//!     .list_documents(Some(filter), CancellationToken::new())
//!     .await;
//! for record in output.records {
//!     println!("{} ({} tasks)", record.path, record.tasks.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Per-workspace settings live in `.notedown/settings.yaml` (or `settings.json`) below the
//! first workspace root. See [`config`] for the schema.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod index;
pub mod paths;
pub mod pipeline;
pub mod rpc;
pub mod runner;
pub mod scanner;
pub mod server;
pub mod store;
pub mod watch;
pub mod workspace;

pub use error::*;
