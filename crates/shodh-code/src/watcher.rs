//! Per-source filesystem watcher with debounced reindexing.
//!
//! Raw notifications are filtered on the watcher's event thread (extension
//! set + the scanner-equivalent exclusion patterns) and forwarded to a
//! per-source debounce task. Each accepted event restarts the debounce
//! timer; when it fires, the pending path set is snapshotted, cleared, and
//! handed to the coordinator as one incremental request. Timers never run
//! on the event thread.

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::coordinator::{ChangeKind, FileChange, IndexingCoordinator};
use crate::error::EngineError;
use crate::scanner::PatternSet;
use crate::types::{IndexKind, SourceRef};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Extensions to accept, with leading dot. Empty accepts every
    /// extension.
    pub extensions: HashSet<String>,
    /// Exclusion globs, equivalent to the source's scanner exclusions.
    pub exclude_patterns: Vec<String>,
    pub debounce_window: Duration,
    /// Index kinds to refresh on change.
    pub kinds: Vec<IndexKind>,
}

struct EventFilter {
    root: PathBuf,
    extensions: HashSet<String>,
    patterns: PatternSet,
}

impl EventFilter {
    fn accepts(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return false;
        };

        if !self.extensions.is_empty() {
            let extension = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            if !self.extensions.contains(&extension) {
                return false;
            }
        }

        let relative = path
            .strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| file_name.clone());
        !self.patterns.excludes_file(&relative, &file_name)
    }
}

/// Map one raw notification into coalescible per-path changes. Created and
/// modified become upserts, deleted becomes a removal, and a move is a
/// removal of the old path plus an upsert of the new one. Directory events
/// and pure access events map to nothing.
fn map_event(event: &notify::Event, filter: &EventFilter) -> Vec<(PathBuf, ChangeKind)> {
    let mut changes = Vec::new();
    let mut push = |path: &PathBuf, kind: ChangeKind| {
        if kind == ChangeKind::Upsert && path.is_dir() {
            return;
        }
        if filter.accepts(path) {
            changes.push((path.clone(), kind));
        }
    };

    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                push(path, ChangeKind::Upsert);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                push(path, ChangeKind::Remove);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                push(path, ChangeKind::Remove);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                push(path, ChangeKind::Upsert);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Both / Any: the first path is the origin, the last the
            // destination.
            if let Some(src) = event.paths.first() {
                push(src, ChangeKind::Remove);
            }
            if event.paths.len() > 1 {
                if let Some(dst) = event.paths.last() {
                    push(dst, ChangeKind::Upsert);
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                push(path, ChangeKind::Upsert);
            }
        }
        _ => {}
    }

    changes
}

struct WatcherHandle {
    // Held so the OS subscription stays alive; dropping it tears it down.
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

/// Manages one notify subscription and debounce task per watched source.
pub struct RepositoryWatcher {
    coordinator: Arc<IndexingCoordinator>,
    watchers: Mutex<HashMap<SourceRef, WatcherHandle>>,
}

impl RepositoryWatcher {
    pub fn new(coordinator: Arc<IndexingCoordinator>) -> Self {
        Self {
            coordinator,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a source root. Must be called inside a tokio
    /// runtime. Watching an already-watched source is a conflict.
    pub fn watch(
        &self,
        source: SourceRef,
        root: PathBuf,
        config: WatchConfig,
    ) -> Result<(), EngineError> {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&source) {
            return Err(EngineError::conflict(format!(
                "already watching source: {source}"
            )));
        }

        let filter = Arc::new(EventFilter {
            root: root.clone(),
            extensions: config.extensions.clone(),
            patterns: PatternSet::compile(&["**/*".to_string()], &config.exclude_patterns)
                .map_err(EngineError::Validation)?,
        });

        let (tx, rx) = mpsc::channel::<Vec<(PathBuf, ChangeKind)>>(256);
        let event_filter = Arc::clone(&filter);
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let changes = map_event(&event, &event_filter);
                    if !changes.is_empty() {
                        tx.blocking_send(changes).ok();
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "filesystem watch error");
                }
            },
        )
        .map_err(|e| EngineError::Permanent(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::Permanent(format!("failed to watch {}: {e}", root.display())))?;

        let task = tokio::spawn(debounce_loop(
            Arc::clone(&self.coordinator),
            source.clone(),
            config,
            rx,
        ));

        watchers.insert(
            source.clone(),
            WatcherHandle {
                _watcher: watcher,
                task,
            },
        );
        tracing::info!(source = %source, path = %root.display(), "started watching source");
        Ok(())
    }

    /// Tear down a source's subscription: the debounce timer is cancelled
    /// and pending work is dropped.
    pub fn unwatch(&self, source: &SourceRef) -> Result<(), EngineError> {
        let handle = self
            .watchers
            .lock()
            .remove(source)
            .ok_or_else(|| EngineError::not_found(format!("not watching source: {source}")))?;
        handle.task.abort();
        tracing::info!(source = %source, "stopped watching source");
        Ok(())
    }

    pub fn watched(&self) -> Vec<SourceRef> {
        self.watchers.lock().keys().cloned().collect()
    }

    pub fn stop_all(&self) {
        let mut watchers = self.watchers.lock();
        for (source, handle) in watchers.drain() {
            handle.task.abort();
            tracing::info!(source = %source, "stopped watching source");
        }
    }
}

async fn debounce_loop(
    coordinator: Arc<IndexingCoordinator>,
    source: SourceRef,
    config: WatchConfig,
    mut rx: mpsc::Receiver<Vec<(PathBuf, ChangeKind)>>,
) {
    let mut pending: HashMap<PathBuf, ChangeKind> = HashMap::new();
    let timer = tokio::time::sleep(Duration::from_secs(86_400));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(changes) => {
                    for (path, kind) in changes {
                        // Latest event wins per path within a window.
                        pending.insert(path, kind);
                    }
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + config.debounce_window);
                }
                // Subscription torn down; drop pending work.
                None => break,
            },
            () = &mut timer, if !pending.is_empty() => {
                let batch: Vec<FileChange> = pending
                    .drain()
                    .map(|(path, kind)| FileChange { path, kind })
                    .collect();
                tracing::info!(
                    source = %source,
                    changes = batch.len(),
                    "debounce window elapsed, applying changes"
                );
                if let Err(err) = coordinator
                    .apply_changes(&source, &batch, &config.kinds)
                    .await
                {
                    tracing::error!(source = %source, error = %err, "watcher reindex failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

    fn filter(root: &Path, extensions: &[&str]) -> EventFilter {
        EventFilter {
            root: root.to_path_buf(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            patterns: PatternSet::compile(
                &["**/*".to_string()],
                &["**/node_modules/**".to_string(), "**/.*".to_string()],
            )
            .unwrap(),
        }
    }

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn create_and_modify_map_to_upsert() {
        let filter = filter(Path::new("/repo"), &[".py"]);
        let changes = map_event(
            &event(EventKind::Create(CreateKind::File), &["/repo/a.py"]),
            &filter,
        );
        assert_eq!(changes, vec![(PathBuf::from("/repo/a.py"), ChangeKind::Upsert)]);

        let changes = map_event(
            &event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
                &["/repo/a.py"],
            ),
            &filter,
        );
        assert_eq!(changes, vec![(PathBuf::from("/repo/a.py"), ChangeKind::Upsert)]);
    }

    #[test]
    fn delete_maps_to_remove() {
        let filter = filter(Path::new("/repo"), &[".py"]);
        let changes = map_event(
            &event(EventKind::Remove(RemoveKind::File), &["/repo/a.py"]),
            &filter,
        );
        assert_eq!(changes, vec![(PathBuf::from("/repo/a.py"), ChangeKind::Remove)]);
    }

    #[test]
    fn move_maps_to_remove_plus_upsert() {
        let filter = filter(Path::new("/repo"), &[".py"]);
        let changes = map_event(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/repo/old.py", "/repo/new.py"],
            ),
            &filter,
        );
        assert_eq!(
            changes,
            vec![
                (PathBuf::from("/repo/old.py"), ChangeKind::Remove),
                (PathBuf::from("/repo/new.py"), ChangeKind::Upsert),
            ]
        );
    }

    #[test]
    fn unwatched_extensions_and_exclusions_are_dropped() {
        let filter = filter(Path::new("/repo"), &[".py"]);

        let changes = map_event(
            &event(EventKind::Create(CreateKind::File), &["/repo/a.js"]),
            &filter,
        );
        assert!(changes.is_empty());

        let changes = map_event(
            &event(
                EventKind::Create(CreateKind::File),
                &["/repo/node_modules/pkg/a.py"],
            ),
            &filter,
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn empty_extension_set_accepts_everything() {
        let filter = filter(Path::new("/repo"), &[]);
        let changes = map_event(
            &event(EventKind::Create(CreateKind::File), &["/repo/Makefile"]),
            &filter,
        );
        assert_eq!(changes.len(), 1);
    }
}
