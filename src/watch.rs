//! Recursive filesystem watching on top of a non-recursive notifier.
//!
//! ## Architecture
//!
//! [`RecursiveWatcher`] registers every directory below its root individually with
//! [`notify`] in [`RecursiveMode::NonRecursive`] and keeps the set of watched directories itself.
//! Two tasks cooperate:
//!
//! 1. **Initial registration** (blocking pool): walks the root once and registers each directory.
//! 2. **Event loop** (async): normalises raw notifier events into [`FsEvent`]s, registering
//!    directories as they appear and dropping them as they disappear.
//!
//! Registration is two-pass: after a directory is watched its entries are enumerated again and a
//! `Create` is synthesised for every regular file found. Files created inside a new directory
//! before its watch was installed are therefore never lost, at the price of the occasional
//! duplicate `Create`.
//!
//! Renames are reported as `Remove` of the old path followed by `Create` of the new one.
//!
//! Ignored paths only stay unwatched: an ignored directory is never registered, so nothing below
//! it is seen, but events for the ignored paths themselves are still reported.
//!
//! [`WorkspaceWatcher`] runs one recursive watcher per workspace root and applies the events to a
//! [`Workspace`].

use notify::{
    event::{MetadataKind, ModifyKind, RenameMode},
    Config, ErrorKind as NotifyErrorKind, Event, EventKind, RecommendedWatcher, RecursiveMode,
    Watcher,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::NotedownError,
    event::{FileChangeKind, FsEvent, FsEventKind},
    paths::{os_path_to_string, path_to_uri},
    workspace::Workspace,
};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
pub const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Receiving ends of a [`RecursiveWatcher`]. Both close once the watcher is closed.
pub struct WatchChannels {
    pub events: mpsc::Receiver<FsEvent>,
    pub errors: mpsc::Receiver<NotedownError>,
}

struct WatchState {
    root: PathBuf,
    ignored: Vec<String>,
    notifier: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<BTreeSet<PathBuf>>,
    errors: Mutex<Option<mpsc::Sender<NotedownError>>>,
    cancel: CancellationToken,
}

impl WatchState {
    fn is_ignored(&self, path: &Path) -> bool {
        let relative = match path.strip_prefix(&self.root) {
            Ok(relative) => os_path_to_string(relative),
            Err(_) => return true,
        };
        self.ignored
            .iter()
            .any(|pattern| !pattern.is_empty() && relative.contains(pattern.as_str()))
    }

    /// Errors never block event delivery: when the error channel is full the error is logged
    /// and dropped.
    fn report(&self, error: NotedownError) {
        match self.errors.lock().as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send(error) {
                    tracing::warn!("[RecursiveWatcher] Dropping watcher error: {}", e);
                }
            }
            None => tracing::debug!("[RecursiveWatcher] Error after close: {}", error),
        }
    }

    fn watch_dir(&self, dir: &Path) -> bool {
        if self.watched.lock().contains(dir) {
            return true;
        }
        let result = match self.notifier.lock().as_mut() {
            Some(notifier) => notifier.watch(dir, RecursiveMode::NonRecursive),
            None => return false,
        };
        match result {
            Ok(()) => {
                self.watched.lock().insert(dir.to_path_buf());
                tracing::trace!("[RecursiveWatcher] Watching {:?}", dir);
                true
            }
            Err(e) => {
                self.report(e.into());
                false
            }
        }
    }

    /// Register `dir` and everything below it, returning a synthesised `Create` for every file
    /// found by the second pass over each newly watched directory.
    fn register_tree(&self, dir: &Path) -> Vec<FsEvent> {
        let mut synthesized = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.is_ignored(&dir) || !self.watch_dir(&dir) {
                continue;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    // The directory may vanish between watch and enumeration.
                    tracing::debug!("[RecursiveWatcher] Could not enumerate {:?}: {}", dir, e);
                    continue;
                }
            };
            let mut children: Vec<(PathBuf, bool)> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let file_type = entry.file_type().ok()?;
                    Some((entry.path(), file_type.is_dir()))
                })
                .collect();
            children.sort();
            for (path, is_dir) in children.into_iter().rev() {
                if is_dir {
                    pending.push(path);
                } else {
                    synthesized.push(FsEvent::create(path));
                }
            }
        }
        synthesized.sort_by(|a, b| a.path.cmp(&b.path));
        synthesized
    }

    /// Stop watching `path` and every watched directory below it.
    fn unregister_tree(&self, path: &Path) -> bool {
        let doomed: Vec<PathBuf> = {
            let mut watched = self.watched.lock();
            let doomed: Vec<PathBuf> = watched
                .iter()
                .filter(|dir| dir.starts_with(path))
                .cloned()
                .collect();
            for dir in doomed.iter() {
                watched.remove(dir);
            }
            doomed
        };
        let mut notifier = self.notifier.lock();
        if let Some(notifier) = notifier.as_mut() {
            for dir in doomed.iter() {
                match notifier.unwatch(dir) {
                    Ok(()) => {}
                    // The OS drops watches of deleted directories on its own.
                    Err(e) if matches!(e.kind, NotifyErrorKind::WatchNotFound) => {}
                    Err(e) => self.report(e.into()),
                }
            }
        }
        !doomed.is_empty()
    }
}

/// Recursive watcher rooted at one directory. See the module documentation.
pub struct RecursiveWatcher {
    state: Arc<WatchState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecursiveWatcher {
    /// Start watching `root`. Directories whose root-relative form contains one of the `ignored`
    /// substrings are not watched.
    ///
    /// Must be called inside a tokio runtime.
    #[tracing::instrument(skip(ignored))]
    pub fn new(
        root: impl AsRef<Path> + std::fmt::Debug,
        ignored: Vec<String>,
    ) -> Result<(RecursiveWatcher, WatchChannels), NotedownError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(NotedownError::NotFound(format!(
                "Watch root is not a directory: {}",
                root.display()
            )));
        }
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let notifier = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Fails only once the event loop is gone.
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let state = Arc::new(WatchState {
            root: root.clone(),
            ignored,
            notifier: Mutex::new(Some(notifier)),
            watched: Mutex::new(BTreeSet::new()),
            errors: Mutex::new(Some(errors_tx)),
            cancel: CancellationToken::new(),
        });

        let registration = {
            let state = state.clone();
            let events = events_tx.clone();
            tokio::task::spawn_blocking(move || {
                for event in state.register_tree(&state.root) {
                    if state.cancel.is_cancelled() || events.blocking_send(event).is_err() {
                        break;
                    }
                }
                tracing::debug!(
                    "[RecursiveWatcher] Initial registration of {:?} done, {} directories watched",
                    state.root,
                    state.watched.lock().len()
                );
            })
        };
        let event_loop = tokio::spawn(event_loop(state.clone(), raw_rx, events_tx));

        Ok((
            RecursiveWatcher {
                state,
                tasks: Mutex::new(vec![registration, event_loop]),
            },
            WatchChannels {
                events: events_rx,
                errors: errors_rx,
            },
        ))
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    /// Snapshot of the watched directories.
    pub fn watched(&self) -> BTreeSet<PathBuf> {
        self.state.watched.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Release every OS watch and close both channels. Calling it again does nothing.
    pub fn close(&self) {
        if self.state.cancel.is_cancelled() {
            return;
        }
        self.state.cancel.cancel();
        // Dropping the notifier releases the OS watches and ends the raw event stream.
        self.state.notifier.lock().take();
        self.state.watched.lock().clear();
        self.state.errors.lock().take();
        tracing::debug!("[RecursiveWatcher] Closed {:?}", self.state.root);
    }

    /// Close and wait for both tasks to finish.
    pub async fn shutdown(self) {
        self.close();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("[RecursiveWatcher] Task failed: {}", e);
            }
        }
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Normalise one raw notifier event.
fn classify(event: &Event) -> Vec<(PathBuf, FsEventKind)> {
    let each = |kind: FsEventKind| -> Vec<(PathBuf, FsEventKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };
    match event.kind {
        EventKind::Create(_) => each(FsEventKind::Create),
        EventKind::Remove(_) => each(FsEventKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(FsEventKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(FsEventKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), FsEventKind::Remove));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), FsEventKind::Create));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    FsEventKind::Create
                } else {
                    FsEventKind::Remove
                };
                (p.clone(), kind)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => {
            each(FsEventKind::Write)
        }
        _ => Vec::new(),
    }
}

async fn emit(events: &mpsc::Sender<FsEvent>, event: FsEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

async fn event_loop(
    state: Arc<WatchState>,
    mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
    events: mpsc::Sender<FsEvent>,
) {
    loop {
        let next = tokio::select! {
            _ = state.cancel.cancelled() => break,
            next = raw.recv() => next,
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                state.report(e.into());
                continue;
            }
            None => break,
        };
        for (path, kind) in classify(&event) {
            let delivered = match kind {
                FsEventKind::Create if path.is_dir() && !state.is_ignored(&path) => {
                    let synthesized = {
                        let state = state.clone();
                        let dir = path.clone();
                        match tokio::task::spawn_blocking(move || state.register_tree(&dir)).await
                        {
                            Ok(synthesized) => synthesized,
                            Err(e) => {
                                tracing::warn!(
                                    "[RecursiveWatcher] Registering {:?} failed: {}",
                                    path,
                                    e
                                );
                                Vec::new()
                            }
                        }
                    };
                    let mut delivered = emit(&events, FsEvent::create(&path), &state.cancel).await;
                    for event in synthesized {
                        if !delivered {
                            break;
                        }
                        delivered = emit(&events, event, &state.cancel).await;
                    }
                    delivered
                }
                FsEventKind::Remove => {
                    if state.unregister_tree(&path) {
                        tracing::trace!("[RecursiveWatcher] Dropped watches below {:?}", path);
                    }
                    emit(&events, FsEvent::remove(&path), &state.cancel).await
                }
                kind => emit(&events, FsEvent::new(&path, kind), &state.cancel).await,
            };
            if !delivered {
                tracing::debug!("[RecursiveWatcher] Event receiver closed");
                return;
            }
        }
    }
    tracing::debug!("[RecursiveWatcher] Event loop for {:?} stopped", state.root);
}

/// A change the [`WorkspaceWatcher`] applied to its workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub uri: String,
    pub kind: FileChangeKind,
}

/// Keeps a [`Workspace`] in sync with the filesystem when no LSP client reports file changes.
pub struct WorkspaceWatcher {
    watchers: Vec<RecursiveWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkspaceWatcher {
    /// Watch every root of `workspace`. Changes that altered the file index are forwarded on the
    /// returned channel; dropping the receiver does not stop the watcher.
    pub fn spawn(
        workspace: Arc<Workspace>,
    ) -> Result<(WorkspaceWatcher, mpsc::Receiver<AppliedChange>), NotedownError> {
        let (applied_tx, applied_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watchers = Vec::new();
        let mut tasks = Vec::new();
        for root in workspace.roots() {
            let (watcher, channels) =
                RecursiveWatcher::new(&root.path, workspace.config().exclude.clone())?;
            tasks.push(tokio::spawn(apply_events(
                workspace.clone(),
                channels,
                applied_tx.clone(),
            )));
            watchers.push(watcher);
        }
        tracing::info!("[WorkspaceWatcher] Watching {} roots", watchers.len());
        Ok((WorkspaceWatcher { watchers, tasks }, applied_rx))
    }

    pub fn close(&self) {
        for watcher in self.watchers.iter() {
            watcher.close();
        }
    }

    pub async fn shutdown(self) {
        for watcher in self.watchers {
            watcher.shutdown().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("[WorkspaceWatcher] Task failed: {}", e);
            }
        }
    }
}

async fn apply_events(
    workspace: Arc<Workspace>,
    mut channels: WatchChannels,
    applied: mpsc::Sender<AppliedChange>,
) {
    let mut errors_open = true;
    loop {
        tokio::select! {
            event = channels.events.recv() => {
                let Some(event) = event else { break };
                let uri = match path_to_uri(&event.path) {
                    Ok(uri) => uri,
                    Err(e) => {
                        tracing::warn!("[WorkspaceWatcher] {}: {}", event, e);
                        continue;
                    }
                };
                let kind = FileChangeKind::from(event.kind);
                match workspace.apply_file_change(&uri, kind) {
                    Ok(true) => {
                        let _ = applied.try_send(AppliedChange { uri, kind });
                    }
                    Ok(false) => {}
                    // Files routinely disappear between the event and the stat.
                    Err(NotedownError::NotFound(_)) => {
                        if let Err(e) = workspace.apply_file_change(&uri, FileChangeKind::Deleted) {
                            tracing::debug!("[WorkspaceWatcher] {}: {}", event, e);
                        }
                    }
                    Err(e) => tracing::warn!("[WorkspaceWatcher] {}: {}", event, e),
                }
            }
            error = channels.errors.recv(), if errors_open => {
                match error {
                    Some(e) => tracing::warn!("[WorkspaceWatcher] {}", e),
                    None => errors_open = false,
                }
            }
        }
    }
}
