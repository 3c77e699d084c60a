//! # Directory Watcher
//!
//! Watches every directory below the label root and rebuilds the [`DefinitionStore`] whenever
//! something in the tree changes. Each successful rebuild asks the control loop for a refresh
//! of all nodes; a failed rebuild or a notification error is fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::definitions::DefinitionStore;
use crate::error::{Error, Result};

/// Structural change to the watched directory set
#[derive(Debug, Clone, PartialEq, Eq)]
enum DirChange {
    Created(PathBuf),
    Removed(PathBuf),
}

/// Filesystem watcher for the label definition tree
pub struct LabelWatcher {
    root: PathBuf,
    definitions: Arc<DefinitionStore>,
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    watched_dirs: HashSet<PathBuf>,
}

impl LabelWatcher {
    /// Register every directory below `root` (including `root`) for change notification
    pub fn new(root: impl Into<PathBuf>, definitions: Arc<DefinitionStore>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            error!(dir = %root.display(), "Invalid label directory specified");
            return Err(Error::InvalidRoot(root));
        }

        let (event_tx, events) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let watcher = notify::recommended_watcher(move |event| {
            if event_tx.send(event).is_err() {
                debug!("Watch event dropped because the watcher loop is gone");
            }
        })?;

        let mut label_watcher = Self {
            root,
            definitions,
            watcher,
            events,
            watched_dirs: HashSet::new(),
        };

        let root = label_watcher.root.clone();
        for dir in directories_under(&root)? {
            label_watcher.watch_dir(dir)?;
        }

        Ok(label_watcher)
    }

    /// Whether `dir` is currently registered
    #[cfg(test)]
    pub(crate) fn is_watching(&self, dir: &Path) -> bool {
        self.watched_dirs.contains(dir)
    }

    /// Number of registered directories
    #[cfg(test)]
    pub(crate) fn watched_count(&self) -> usize {
        self.watched_dirs.len()
    }

    /// Process notifications until shutdown or a fatal error.
    ///
    /// Fatal errors cancel `shutdown` so the rest of the process stops with this loop.
    pub async fn run(mut self, refresh: mpsc::Sender<()>, shutdown: CancellationToken) -> Result<()> {
        info!(dir = %self.root.display(), "Monitoring filesystem for events...");

        let result = self.watch_loop(&refresh, &shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Label watcher stopped");
            shutdown.cancel();
        }

        self.close();
        result
    }

    async fn watch_loop(
        &mut self,
        refresh: &mpsc::Sender<()>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Label watcher shutting down");
                    return Ok(());
                }
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                return Err(notify::Error::generic("notification source closed").into());
            };

            let mut rebuild = self.process(event)?;
            while let Ok(event) = self.events.try_recv() {
                rebuild |= self.process(event)?;
            }

            if !rebuild {
                continue;
            }

            // No retry on a failed rebuild, the caller treats it as fatal.
            let count = self.definitions.rebuild().await.inspect_err(|e| {
                error!(error = %e, "Failed to update label map");
            })?;
            info!(labels = count, "Label definitions changed");

            match refresh.try_send(()) {
                Ok(()) => debug!("Requested node label refresh"),
                Err(TrySendError::Full(())) => debug!("Node label refresh already pending"),
                Err(TrySendError::Closed(())) => {
                    info!("Refresh receiver closed, label watcher exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Apply one notification to the watched set. Returns whether it warrants a rebuild.
    fn process(&mut self, event: notify::Result<Event>) -> Result<bool> {
        let event = event.inspect_err(|e| {
            error!(error = %e, "Received filesystem watcher error");
        })?;

        for change in dir_changes(&event) {
            match change {
                DirChange::Created(path) => self.on_created(&path),
                DirChange::Removed(path) => self.unwatch_dir(&path),
            }
        }

        Ok(triggers_rebuild(&event.kind))
    }

    fn on_created(&mut self, path: &Path) {
        if !path.is_dir() {
            return;
        }

        // Subdirectories may already exist by the time the parent's event arrives.
        let dirs = match directories_under(path) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "Could not scan new directory");
                return;
            }
        };

        for dir in dirs {
            if let Err(e) = self.watch_dir(dir) {
                warn!(error = %e, "Could not watch new directory");
            }
        }
    }

    fn watch_dir(&mut self, dir: PathBuf) -> Result<()> {
        if self.watched_dirs.contains(&dir) {
            return Ok(());
        }

        info!(dir = %dir.display(), "Adding watcher");
        self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        self.watched_dirs.insert(dir);
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) {
        if !self.watched_dirs.remove(dir) {
            return;
        }

        info!(dir = %dir.display(), "Removing watcher");
        // The kernel usually drops the watch together with the directory.
        if let Err(e) = self.watcher.unwatch(dir) {
            debug!(dir = %dir.display(), error = %e, "Watch already released");
        }
    }

    /// Release every registered watch
    pub fn close(mut self) {
        let dirs: Vec<PathBuf> = self.watched_dirs.drain().collect();
        for dir in dirs {
            if let Err(e) = self.watcher.unwatch(&dir) {
                debug!(dir = %dir.display(), error = %e, "Watch already released");
            }
        }
        debug!(dir = %self.root.display(), "Label watcher closed");
    }
}

fn directories_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|source| Error::Scan {
            path: root.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

/// Creations and removals carried by a notification. Renames count as a removal of the old
/// path followed by a creation of the new one.
fn dir_changes(event: &Event) -> Vec<DirChange> {
    let paths = &event.paths;
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(DirChange::Created).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(DirChange::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = paths.first() {
                changes.push(DirChange::Removed(from.clone()));
            }
            if let Some(to) = paths.get(1) {
                changes.push(DirChange::Created(to.clone()));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|path| {
                if path.exists() {
                    DirChange::Created(path.clone())
                } else {
                    DirChange::Removed(path.clone())
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Reads and opens are not changes; everything else under the tree is.
fn triggers_rebuild(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}
