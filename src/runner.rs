//! Execution of fenced code blocks.
//!
//! All blocks of one language are joined with a blank line, given a language preamble, written
//! to a fresh temporary directory and run with the language's toolchain under a deadline. The
//! temporary directory is removed when the run finishes.

use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::process::Command;

use crate::{codec::Document, config::DEFAULT_CODE_TIMEOUT, error::NotedownError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_nanos: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// How to run one language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub file_name: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl LanguageSpec {
    /// Program text for `blocks`, joined by a blank line.
    pub fn program_text(&self, blocks: &[String]) -> String {
        let body = blocks.join("\n\n");
        match self.name {
            "go" if !body.lines().any(|l| l.trim_start().starts_with("package ")) => {
                format!("package main\n\n{body}")
            }
            "bash" => format!("#!/usr/bin/env bash\n{body}"),
            _ => body,
        }
    }
}

pub const LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        name: "go",
        aliases: &["golang"],
        file_name: "main.go",
        program: "go",
        args: &["run"],
    },
    LanguageSpec {
        name: "python",
        aliases: &["python3", "py"],
        file_name: "main.py",
        program: "python3",
        args: &[],
    },
    LanguageSpec {
        name: "bash",
        aliases: &["sh", "shell"],
        file_name: "main.sh",
        program: "bash",
        args: &[],
    },
    LanguageSpec {
        name: "javascript",
        aliases: &["js", "node"],
        file_name: "main.js",
        program: "node",
        args: &[],
    },
];

pub fn language_spec(language: &str) -> Option<&'static LanguageSpec> {
    let language = language.trim().to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|spec| spec.name == language || spec.aliases.contains(&language.as_str()))
}

/// Gather the content of every fenced block in `language`.
///
/// Without an explicit language the first fenced block in a supported language decides. Returns
/// the canonical language name and the blocks in document order.
pub fn collect_blocks(
    doc: &Document,
    language: Option<&str>,
) -> Option<(&'static LanguageSpec, Vec<String>)> {
    let spec = match language {
        Some(language) => language_spec(language)?,
        None => doc
            .code_blocks()
            .filter_map(|(_, lang, _)| lang.and_then(language_spec))
            .next()?,
    };
    let blocks: Vec<String> = doc
        .code_blocks()
        .filter(|(_, lang, _)| lang.and_then(language_spec) == Some(spec))
        .map(|(_, _, content)| content.to_string())
        .collect();
    if blocks.is_empty() {
        None
    } else {
        Some((spec, blocks))
    }
}

#[derive(Debug, Clone)]
pub struct CodeRunner {
    timeout: Duration,
}

impl Default for CodeRunner {
    fn default() -> Self {
        CodeRunner {
            timeout: DEFAULT_CODE_TIMEOUT,
        }
    }
}

impl CodeRunner {
    pub fn new(timeout: Duration) -> Self {
        CodeRunner { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `blocks` of `language` with `working_dir` as the current directory.
    ///
    /// Only an unknown language or a failure to prepare the temporary directory is an error;
    /// everything that happens to the process is reported in the [`ExecutionResult`].
    #[tracing::instrument(skip(self, blocks, working_dir))]
    pub async fn run(
        &self,
        language: &str,
        blocks: &[String],
        working_dir: &Path,
    ) -> Result<ExecutionResult, NotedownError> {
        let spec = language_spec(language)
            .ok_or_else(|| NotedownError::Command(format!("Unsupported language '{language}'")))?;
        let scratch = tempfile::Builder::new()
            .prefix("notedown-run-")
            .tempdir()?;
        let source = scratch.path().join(spec.file_name);
        tokio::fs::write(&source, spec.program_text(blocks)).await?;

        let mut command = Command::new(spec.program);
        command
            .args(spec.args)
            .arg(&source)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("[CodeRunner] Could not start {}: {}", spec.program, e);
                return Ok(ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 1,
                    duration_nanos: started.elapsed().as_nanos() as u64,
                    error_message: Some(format!("failed to start {}: {e}", spec.program)),
                });
            }
        };

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(1);
                ExecutionResult {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code,
                    duration_nanos: started.elapsed().as_nanos() as u64,
                    error_message: None,
                }
            }
            Ok(Err(e)) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
                duration_nanos: started.elapsed().as_nanos() as u64,
                error_message: Some(NotedownError::from(e).to_string()),
            },
            Err(_) => {
                tracing::debug!("[CodeRunner] {} run exceeded {:?}", spec.name, self.timeout);
                ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 1,
                    duration_nanos: started.elapsed().as_nanos() as u64,
                    error_message: Some(NotedownError::Timeout(self.timeout).to_string()),
                }
            }
        };
        drop(scratch);
        Ok(result)
    }
}
