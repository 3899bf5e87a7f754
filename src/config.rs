//! Workspace configuration.
//!
//! The core is parameterised by a single [`NotedownConfig`] value carrying the task-state
//! vocabulary, the exclusion substrings and a handful of limits. It is built once at
//! initialisation (usually through [`DirConfigProvider`]) and shared as an
//! `Arc<NotedownConfig>` afterwards.
//!
//! On disk the configuration lives in `<root>/.notedown/settings.yaml`, falling back to
//! `<root>/.notedown/settings.json`:
//!
//! ```yaml
//! tasks:
//!   states:
//!     - value: " "
//!       name: todo
//!     - value: x
//!       name: done
//!       aliases: [X]
//!     - value: wip
//!       name: in progress
//!       conceal: "🚧"
//! workspace:
//!   exclude: [node_modules, archive]
//!   max_files: 5000
//! code:
//!   timeout_secs: 10
//! ```

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::NotedownError;

/// Directory holding per-workspace settings.
pub const CONFIG_DIR: &str = ".notedown";

/// Settings file names in order of preference.
pub const SETTINGS_FILES: [&str; 2] = ["settings.yaml", "settings.json"];

pub const DEFAULT_MAX_FILES: usize = 10_000;
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// One entry of the task vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub value: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conceal: Option<String>,
}

impl TaskState {
    pub fn new(value: &str, name: &str) -> Self {
        TaskState {
            value: value.to_string(),
            name: name.to_string(),
            description: None,
            aliases: Vec::new(),
            conceal: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.value == candidate || self.aliases.iter().any(|a| a == candidate)
    }
}

/// The ordered list of valid task states.
///
/// Values and aliases are unique across the whole vocabulary and never contain `]`, so a
/// checkbox `[s]` is a task exactly when `s` is one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskVocabulary {
    states: Vec<TaskState>,
}

impl TaskVocabulary {
    pub fn new(states: Vec<TaskState>) -> Result<Self, NotedownError> {
        if states.is_empty() {
            return Err(NotedownError::Config(
                "task vocabulary must define at least one state".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for state in states.iter() {
            if state.name.trim().is_empty() {
                return Err(NotedownError::Config(format!(
                    "task state '{}' has an empty name",
                    state.value
                )));
            }
            for token in std::iter::once(&state.value).chain(state.aliases.iter()) {
                if token.is_empty() {
                    return Err(NotedownError::Config(format!(
                        "task state '{}' declares an empty value or alias",
                        state.name
                    )));
                }
                if token.contains(']') {
                    return Err(NotedownError::Config(format!(
                        "task state value '{token}' may not contain ']'"
                    )));
                }
                if !seen.insert(token.clone()) {
                    return Err(NotedownError::Config(format!(
                        "task state value '{token}' is declared more than once"
                    )));
                }
            }
        }
        Ok(TaskVocabulary { states })
    }

    pub fn states(&self) -> &[TaskState] {
        &self.states
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.resolve(candidate).is_some()
    }

    /// Find the state a value or alias belongs to.
    pub fn resolve(&self, candidate: &str) -> Option<&TaskState> {
        self.states.iter().find(|state| state.matches(candidate))
    }

    /// Human readable list used in diagnostics: `' ', 'x', 'wip'`.
    pub fn describe_values(&self) -> String {
        self.states
            .iter()
            .map(|state| format!("'{}'", state.value))
            .collect::<Vec<String>>()
            .join(", ")
    }
}

impl Default for TaskVocabulary {
    fn default() -> Self {
        TaskVocabulary {
            states: vec![
                TaskState::new(" ", "todo"),
                TaskState::new("x", "done").with_aliases(&["X"]),
            ],
        }
    }
}

impl<'de> Deserialize<'de> for TaskVocabulary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let states = Vec::<TaskState>::deserialize(deserializer)?;
        TaskVocabulary::new(states).map_err(serde::de::Error::custom)
    }
}

/// Immutable configuration shared by every component of a running server.
#[derive(Debug, Clone, PartialEq)]
pub struct NotedownConfig {
    pub tasks: TaskVocabulary,
    /// Any path containing one of these substrings is skipped by the scanner and watcher.
    pub exclude: Vec<String>,
    pub max_files: usize,
    pub code_timeout: Duration,
    pub cache_flush_interval: Duration,
}

impl Default for NotedownConfig {
    fn default() -> Self {
        NotedownConfig {
            tasks: TaskVocabulary::default(),
            exclude: default_exclusions(),
            max_files: DEFAULT_MAX_FILES,
            code_timeout: DEFAULT_CODE_TIMEOUT,
            cache_flush_interval: DEFAULT_CACHE_FLUSH_INTERVAL,
        }
    }
}

fn default_exclusions() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        ".git".to_string(),
        CONFIG_DIR.to_string(),
    ]
}

impl NotedownConfig {
    pub fn with_tasks(mut self, tasks: TaskVocabulary) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude
            .iter()
            .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()))
    }

    fn from_settings(settings: SettingsFile) -> Self {
        let mut config = NotedownConfig::default();
        if let Some(tasks) = settings.tasks {
            config.tasks = tasks.states;
        }
        if let Some(workspace) = settings.workspace {
            if let Some(exclude) = workspace.exclude {
                let mut merged = default_exclusions();
                for pattern in exclude {
                    if !merged.contains(&pattern) {
                        merged.push(pattern);
                    }
                }
                config.exclude = merged;
            }
            if let Some(max_files) = workspace.max_files {
                config.max_files = max_files;
            }
        }
        if let Some(code) = settings.code {
            if let Some(timeout_secs) = code.timeout_secs {
                config.code_timeout = Duration::from_secs(timeout_secs);
            }
        }
        config
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    tasks: Option<TasksSection>,
    #[serde(default)]
    workspace: Option<WorkspaceSection>,
    #[serde(default)]
    code: Option<CodeSection>,
}

#[derive(Debug, Deserialize)]
struct TasksSection {
    states: TaskVocabulary,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceSection {
    exclude: Option<Vec<String>>,
    max_files: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeSection {
    timeout_secs: Option<u64>,
}

/// Source of a [`NotedownConfig`].
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<NotedownConfig, NotedownError>;

    /// Load the configuration, falling back to the defaults when it is missing or invalid.
    fn load_or_default(&self) -> NotedownConfig {
        match self.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("[Config] Falling back to default configuration: {}", e);
                NotedownConfig::default()
            }
        }
    }
}

/// Reads `.notedown/settings.{yaml,json}` below a workspace root.
#[derive(Debug, Clone)]
pub struct DirConfigProvider {
    root: PathBuf,
}

impl DirConfigProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        DirConfigProvider {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The settings file that would be read, if any exists.
    pub fn settings_path(&self) -> Option<PathBuf> {
        SETTINGS_FILES
            .iter()
            .map(|name| self.root.join(CONFIG_DIR).join(name))
            .find(|path| path.is_file())
    }
}

impl ConfigProvider for DirConfigProvider {
    fn load(&self) -> Result<NotedownConfig, NotedownError> {
        let Some(path) = self.settings_path() else {
            tracing::debug!(
                "[Config] No settings file below {:?}, using defaults",
                self.root
            );
            return Ok(NotedownConfig::default());
        };
        tracing::debug!("[Config] Reading settings from {:?}", path);
        let content = read_to_string(&path)?;
        let settings: SettingsFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| NotedownError::Config(format!("{}: {e}", path.display())))?,
            _ => {
                if content.trim().is_empty() {
                    SettingsFile::default()
                } else {
                    serde_yaml::from_str(&content)
                        .map_err(|e| NotedownError::Config(format!("{}: {e}", path.display())))?
                }
            }
        };
        Ok(NotedownConfig::from_settings(settings))
    }
}

/// A fixed configuration, mostly useful for tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider(pub NotedownConfig);

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<NotedownConfig, NotedownError> {
        Ok(self.0.clone())
    }
}
