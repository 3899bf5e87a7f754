//! notedown CLI tool
//!
//! ## Commands
//!
//! - `serve`: language server over stdio
//! - `list <root>... [--filter JSON]`: print the document records of a workspace as JSON
//! - `scan <root>...`: print the indexed Markdown files and unresolved or ambiguous wikilinks
//! - `watch <root>`: keep the file index in sync and print every applied change
//! - `run <file.md> [--language L]`: execute the code blocks of one document

use clap::{Parser, Subcommand};
use notedown_core::{
    config::{ConfigProvider, DirConfigProvider, NotedownConfig},
    filter::FilterExpression,
    index::WorkspaceRoot,
    runner::{collect_blocks, CodeRunner},
    server,
    watch::WorkspaceWatcher,
    workspace::Workspace,
    NotedownError,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "notedown")]
#[command(author, version, about = "Notedown workspace tools and language server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the language server on stdin/stdout
    Serve,

    /// List the documents of a workspace as JSON
    List {
        /// Workspace roots; settings are read from the first one
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Frontmatter filter, e.g. '{"field":"status","op":"eq","value":"active"}'
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Index a workspace and report what was found
    Scan {
        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },

    /// Watch a workspace and print every change applied to the file index
    Watch {
        /// Path to the directory to watch
        root: PathBuf,
    },

    /// Execute the code blocks of a document
    Run {
        /// Markdown file
        file: PathBuf,

        /// Only run blocks of this language; defaults to the first runnable language
        #[arg(short, long)]
        language: Option<String>,
    },
}

fn main() -> ExitCode {
    // stdout carries the protocol in `serve`, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start the runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode, NotedownError> {
    match command {
        Commands::Serve => {
            server::serve(tokio::io::stdin(), tokio::io::stdout(), None).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::List { roots, filter } => {
            let filter = filter
                .map(|raw| serde_json::from_str::<FilterExpression>(&raw))
                .transpose()?;
            let workspace = workspace(&roots)?;
            workspace.scan();
            let output = workspace
                .list_documents(filter, CancellationToken::new())
                .await;
            for error in output.errors.iter() {
                eprintln!("skipped {}: {}", error.path, error.message);
            }
            println!("{}", serde_json::to_string_pretty(&output.records)?);
            workspace.cache().flush()?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Scan { roots } => {
            let workspace = workspace(&roots)?;
            let count = workspace.scan();
            let mut paths = workspace.files().relative_paths();
            paths.sort();
            for path in paths.iter() {
                println!("{path}");
            }
            println!("\n{count} Markdown files");

            for info in workspace.files().list() {
                let Some(path) = info.fs_path() else {
                    continue;
                };
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => workspace.refresh_document(&info.uri, &content),
                    Err(e) => eprintln!("could not read {}: {e}", info.path),
                }
            }
            for (target, info) in workspace.wikilinks().all_targets() {
                if info.is_non_existent() {
                    println!("unresolved [[{target}]] in {} file(s)", info.referenced_by.len());
                } else if info.is_ambiguous {
                    let files: Vec<String> = info.matching_files.into_iter().collect();
                    println!("ambiguous [[{target}]]: {}", files.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Watch { root } => {
            let workspace = Arc::new(workspace(&[root.clone()])?);
            let count = workspace.scan_async().await.unwrap_or_default();
            let (watcher, mut applied) = WorkspaceWatcher::spawn(workspace.clone())?;
            println!(
                "Watching {} ({} files). Press Ctrl-C to stop.",
                root.display(),
                count
            );

            let stop = CancellationToken::new();
            let on_signal = stop.clone();
            ctrlc::set_handler(move || on_signal.cancel())
                .map_err(|e| NotedownError::Custom(format!("Could not install Ctrl-C handler: {e}")))?;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    change = applied.recv() => match change {
                        Some(change) => println!("{:?} {}", change.kind, change.uri),
                        None => break,
                    },
                }
            }
            watcher.shutdown().await;
            workspace.cache().flush()?;
            println!("Shutdown complete");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run { file, language } => {
            let file = std::path::absolute(&file)?;
            let dir = file
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(std::env::temp_dir);
            let config = DirConfigProvider::new(&dir).load_or_default();
            let content = tokio::fs::read_to_string(&file).await?;
            let doc = notedown_core::codec::Parser::new(config.tasks.clone()).parse(&content);
            let Some((spec, blocks)) = collect_blocks(&doc, language.as_deref()) else {
                eprintln!("No runnable code blocks in {}", file.display());
                return Ok(ExitCode::FAILURE);
            };
            let result = CodeRunner::new(config.code_timeout)
                .run(spec.name, &blocks, &dir)
                .await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if let Some(message) = result.error_message.as_ref() {
                eprintln!("{message}");
            }
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(result.exit_code.clamp(1, 255) as u8)
            })
        }
    }
}

/// Workspace over `roots`, configured from the first root.
fn workspace(roots: &[PathBuf]) -> Result<Workspace, NotedownError> {
    let roots = roots
        .iter()
        .map(|root| WorkspaceRoot::from_path(std::path::absolute(root)?))
        .collect::<Result<Vec<_>, NotedownError>>()?;
    let config = match roots.first() {
        Some(root) => DirConfigProvider::new(&root.path).load_or_default(),
        None => NotedownConfig::default(),
    };
    Ok(Workspace::new(Arc::new(config), roots))
}
