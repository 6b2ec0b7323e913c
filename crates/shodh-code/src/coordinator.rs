//! Indexing coordinator: the sole writer into the metadata store and both
//! backend indexes.
//!
//! Runs are accepted over a bounded command queue and executed to
//! completion by a single dispatcher task; for one source the keyword pass
//! runs before the vector pass, and at most one writer exists per
//! (source, kind) at any instant. Cancellation is cooperative: `stop`
//! raises a flag that is checked between files, and the in-flight batch is
//! always flushed so metadata stays consistent with the backends.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::{MetadataStore, ObservabilityStore};
use crate::error::EngineError;
use crate::ids;
use crate::index::{KeywordIndex, VectorIndex};
use crate::registry::SourceRegistry;
use crate::types::{
    FileMetadataUpdate, IndexKind, KeywordDocument, ScannedFile, SourceRef,
};

/// How long to wait for the keyword backend to apply a run's batches.
const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Base delay for the single retry of a failed backend batch.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Incremental,
    FullRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
    Cancelled,
}

/// Snapshot handed back when a run is started.
#[derive(Debug, Clone)]
pub struct IndexRun {
    pub id: Uuid,
    pub sources: Vec<SourceRef>,
    pub kinds: Vec<IndexKind>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Live, inspectable view of a run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunProgress {
    pub id: Uuid,
    pub status: RunStatus,
    pub sources: Vec<String>,
    pub kinds: Vec<String>,
    pub files_processed: u64,
    pub files_unchanged: u64,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Remove,
}

/// A coalesced filesystem change handed over by the watcher.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

struct RunState {
    id: Uuid,
    sources: Vec<SourceRef>,
    kinds: Vec<IndexKind>,
    mode: IndexMode,
    status: RwLock<RunStatus>,
    files_processed: AtomicU64,
    files_unchanged: AtomicU64,
    error: Mutex<Option<String>>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl RunState {
    fn progress(&self) -> RunProgress {
        RunProgress {
            id: self.id,
            status: *self.status.read(),
            sources: self.sources.iter().map(|s| s.to_string()).collect(),
            kinds: self.kinds.iter().map(|k| k.to_string()).collect(),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_unchanged: self.files_unchanged.load(Ordering::Relaxed),
            error: self.error.lock().clone(),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock(),
        }
    }

    fn finish(&self, status: RunStatus, error: Option<String>) {
        *self.status.write() = status;
        *self.error.lock() = error;
        *self.finished_at.lock() = Some(chrono::Utc::now());
    }
}

#[derive(Default)]
struct CancelFlags {
    keyword: AtomicBool,
    vector: AtomicBool,
}

impl CancelFlags {
    fn flag(&self, kind: IndexKind) -> &AtomicBool {
        match kind {
            IndexKind::Keyword => &self.keyword,
            IndexKind::Vector => &self.vector,
        }
    }

    fn is_cancelled(&self, kind: IndexKind) -> bool {
        self.flag(kind).load(Ordering::Relaxed)
    }

    fn set(&self, kind: IndexKind) {
        self.flag(kind).store(true, Ordering::Relaxed);
    }

    fn clear(&self, kind: IndexKind) {
        self.flag(kind).store(false, Ordering::Relaxed);
    }
}

/// Per-(source, kind) write lock. Released on drop.
struct WriterGuard {
    active: Arc<Mutex<HashSet<(SourceRef, IndexKind)>>>,
    key: (SourceRef, IndexKind),
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

struct SourceKindOutcome {
    cancelled: bool,
}

pub struct IndexingCoordinator {
    registry: Arc<SourceRegistry>,
    metadata: Arc<MetadataStore>,
    keyword: Arc<KeywordIndex>,
    vector: Arc<VectorIndex>,
    observability: Option<Arc<ObservabilityStore>>,
    keyword_batch_size: usize,
    vector_batch_size: usize,
    cancel: CancelFlags,
    active: Arc<Mutex<HashSet<(SourceRef, IndexKind)>>>,
    runs: DashMap<Uuid, Arc<RunState>>,
    queue: mpsc::Sender<Arc<RunState>>,
}

impl IndexingCoordinator {
    /// Construct the coordinator and start its dispatcher task. Must be
    /// called inside a tokio runtime.
    pub fn start(
        registry: Arc<SourceRegistry>,
        metadata: Arc<MetadataStore>,
        keyword: Arc<KeywordIndex>,
        vector: Arc<VectorIndex>,
        observability: Option<Arc<ObservabilityStore>>,
        keyword_batch_size: usize,
        vector_batch_size: usize,
    ) -> Arc<Self> {
        let (queue, mut receiver) = mpsc::channel::<Arc<RunState>>(16);
        let coordinator = Arc::new(Self {
            registry,
            metadata,
            keyword,
            vector,
            observability,
            keyword_batch_size: keyword_batch_size.max(1),
            vector_batch_size: vector_batch_size.max(1),
            cancel: CancelFlags::default(),
            active: Arc::new(Mutex::new(HashSet::new())),
            runs: DashMap::new(),
            queue,
        });

        let dispatcher = Arc::clone(&coordinator);
        tokio::spawn(async move {
            while let Some(state) = receiver.recv().await {
                dispatcher.execute_run(state).await;
            }
        });

        coordinator
    }

    /// Start a background run over `sources` (all enabled sources when
    /// empty) and return its inspectable handle.
    pub async fn index(
        &self,
        sources: Vec<SourceRef>,
        kinds: Vec<IndexKind>,
        mode: IndexMode,
    ) -> Result<IndexRun, EngineError> {
        if kinds.is_empty() {
            return Err(EngineError::validation("no index kinds requested"));
        }
        let sources = if sources.is_empty() {
            self.registry.enabled_sources()?
        } else {
            sources
        };

        // Keyword runs before vector for each source.
        let mut kinds = kinds;
        kinds.sort_by_key(|k| match k {
            IndexKind::Keyword => 0,
            IndexKind::Vector => 1,
        });
        kinds.dedup();

        let state = Arc::new(RunState {
            id: Uuid::new_v4(),
            sources: sources.clone(),
            kinds: kinds.clone(),
            mode,
            status: RwLock::new(RunStatus::Running),
            files_processed: AtomicU64::new(0),
            files_unchanged: AtomicU64::new(0),
            error: Mutex::new(None),
            started_at: chrono::Utc::now(),
            finished_at: Mutex::new(None),
        });
        self.runs.insert(state.id, Arc::clone(&state));

        self.queue
            .send(Arc::clone(&state))
            .await
            .map_err(|_| EngineError::Transient("coordinator queue closed".into()))?;

        Ok(IndexRun {
            id: state.id,
            sources,
            kinds,
            started_at: state.started_at,
        })
    }

    /// Request cooperative cancellation for the given kinds. Pending work
    /// halts at the next checkpoint; in-flight batches complete.
    pub fn stop(&self, kinds: &[IndexKind]) -> Vec<IndexKind> {
        let mut stopped = Vec::new();
        for kind in kinds {
            self.cancel.set(*kind);
            stopped.push(*kind);
        }
        tracing::info!(?stopped, "indexing stop requested");
        stopped
    }

    pub fn is_indexing(&self) -> bool {
        if !self.active.lock().is_empty() {
            return true;
        }
        self.runs
            .iter()
            .any(|entry| *entry.value().status.read() == RunStatus::Running)
    }

    pub fn run_progress(&self, id: Uuid) -> Option<RunProgress> {
        self.runs.get(&id).map(|state| state.progress())
    }

    /// The most recently started run that is still running, if any.
    pub fn current_run(&self) -> Option<RunProgress> {
        self.runs
            .iter()
            .map(|entry| entry.value().progress())
            .filter(|p| p.status == RunStatus::Running)
            .max_by_key(|p| p.started_at)
    }

    pub fn runs(&self) -> Vec<RunProgress> {
        let mut runs: Vec<RunProgress> =
            self.runs.iter().map(|entry| entry.value().progress()).collect();
        runs.sort_by_key(|p| std::cmp::Reverse(p.started_at));
        runs
    }

    async fn execute_run(&self, state: Arc<RunState>) {
        // A new run supersedes stop flags raised against earlier runs.
        for kind in &state.kinds {
            self.cancel.clear(*kind);
        }

        tracing::info!(
            run_id = %state.id,
            sources = state.sources.len(),
            kinds = ?state.kinds,
            mode = ?state.mode,
            "indexing run started"
        );
        self.record_event(&state, "start");

        let mut cancelled = false;
        let mut failure: Option<String> = None;

        'sources: for source in &state.sources {
            for kind in &state.kinds {
                if self.cancel.is_cancelled(*kind) {
                    cancelled = true;
                    break 'sources;
                }
                let _guard = self.acquire_writer(source.clone(), *kind).await;
                match self.index_source_kind(&state, source, *kind).await {
                    Ok(outcome) => {
                        if outcome.cancelled {
                            cancelled = true;
                            break 'sources;
                        }
                    }
                    Err(err) => {
                        failure = Some(format!("{source} [{kind}]: {err:#}"));
                        break 'sources;
                    }
                }
            }
        }

        let status = if let Some(error) = failure {
            tracing::error!(run_id = %state.id, error = %error, "indexing run failed");
            if let Some(obs) = &self.observability {
                obs.record_error("coordinator", &error).ok();
            }
            state.finish(RunStatus::Failed, Some(error));
            RunStatus::Failed
        } else if cancelled {
            state.finish(RunStatus::Cancelled, None);
            RunStatus::Cancelled
        } else {
            self.metadata.set_last_index_time(None).ok();
            state.finish(RunStatus::Complete, None);
            RunStatus::Complete
        };

        tracing::info!(
            run_id = %state.id,
            status = ?status,
            files_processed = state.files_processed.load(Ordering::Relaxed),
            files_unchanged = state.files_unchanged.load(Ordering::Relaxed),
            "indexing run finished"
        );
        self.record_event(
            &state,
            match status {
                RunStatus::Complete => "complete",
                RunStatus::Failed => "failed",
                RunStatus::Cancelled => "cancelled",
                RunStatus::Running => "running",
            },
        );
    }

    async fn index_source_kind(
        &self,
        state: &RunState,
        source: &SourceRef,
        kind: IndexKind,
    ) -> anyhow::Result<SourceKindOutcome> {
        let scanner = self
            .registry
            .scanner_for(source)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let is_initial = self
            .metadata
            .get_source_stats(source, Some(kind))?
            .is_empty();

        if state.mode == IndexMode::FullRebuild {
            match kind {
                IndexKind::Keyword => {
                    self.keyword
                        .delete_by_source(source.source_type(), &source.source_id())?;
                }
                IndexKind::Vector => {
                    self.vector
                        .delete_by_source(source.source_type(), &source.source_id())
                        .await?;
                }
            }
            // Metadata rows are cleared once, with the first kind of the
            // run, so the second pass still sees its own fresh writes.
            if state.kinds.first() == Some(&kind) {
                self.metadata.remove_by_source(source)?;
            }
        }

        let start = Instant::now();
        let mut indexed: u64 = 0;
        let mut bytes: u64 = 0;
        let mut cancelled = false;

        let mut keyword_batch: Vec<KeywordDocument> = Vec::new();
        let mut file_batch: Vec<ScannedFile> = Vec::new();

        for file in scanner.scan() {
            if self.cancel.is_cancelled(kind) {
                cancelled = true;
                break;
            }

            if state.mode == IndexMode::Incremental {
                // Up to date only if the row covers THIS kind: a file the
                // keyword pass just stamped must still flow through the
                // vector pass of the same run.
                let path = file.file_path.to_string_lossy();
                if let Some(record) = self.metadata.get_record(&path)? {
                    if record.index_kind.covers(kind)
                        && record.last_indexed_at >= file.last_modified
                    {
                        state.files_unchanged.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }

            bytes += file.size_bytes;
            match kind {
                IndexKind::Keyword => {
                    keyword_batch.push(KeywordDocument::from_scanned(&file));
                    file_batch.push(file);
                    if keyword_batch.len() >= self.keyword_batch_size {
                        indexed += self
                            .flush_keyword(state, &mut keyword_batch, &mut file_batch)
                            .await?;
                    }
                }
                IndexKind::Vector => {
                    file_batch.push(file);
                    if file_batch.len() >= self.vector_batch_size {
                        indexed += self.flush_vector(state, &mut file_batch).await?;
                    }
                }
            }
        }

        // The in-flight batch completes even on cancellation, keeping the
        // metadata rows consistent with what the backends absorbed.
        match kind {
            IndexKind::Keyword => {
                indexed += self
                    .flush_keyword(state, &mut keyword_batch, &mut file_batch)
                    .await?;
                let keyword = Arc::clone(&self.keyword);
                tokio::task::spawn_blocking(move || keyword.await_quiescence(QUIESCENCE_TIMEOUT))
                    .await??;
            }
            IndexKind::Vector => {
                indexed += self.flush_vector(state, &mut file_batch).await?;
            }
        }

        self.metadata.record_source_indexing(
            source,
            kind,
            start.elapsed().as_secs_f64(),
            indexed,
            bytes,
            is_initial,
        )?;

        tracing::info!(
            run_id = %state.id,
            source = %source,
            kind = %kind,
            indexed,
            cancelled,
            elapsed_s = start.elapsed().as_secs_f64(),
            "source pass finished"
        );

        Ok(SourceKindOutcome { cancelled })
    }

    async fn flush_keyword(
        &self,
        state: &RunState,
        documents: &mut Vec<KeywordDocument>,
        files: &mut Vec<ScannedFile>,
    ) -> anyhow::Result<u64> {
        if documents.is_empty() {
            files.clear();
            return Ok(0);
        }
        let batch = Arc::new(std::mem::take(documents));

        let mut attempt: u32 = 0;
        loop {
            let keyword = Arc::clone(&self.keyword);
            let batch_ref = Arc::clone(&batch);
            let result = tokio::task::spawn_blocking(move || {
                keyword.upsert(&batch_ref)?;
                keyword.commit()
            })
            .await?;

            match result {
                Ok(()) => break,
                Err(err) if attempt == 0 => {
                    tracing::warn!(error = %err, "keyword batch failed, retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.context("keyword batch failed after retry")),
            }
        }

        self.commit_metadata(state, IndexKind::Keyword, files)
    }

    async fn flush_vector(
        &self,
        state: &RunState,
        files: &mut Vec<ScannedFile>,
    ) -> anyhow::Result<u64> {
        if files.is_empty() {
            return Ok(0);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.vector.upsert_files(files).await {
                Ok(_) => break,
                Err(err) if attempt == 0 => {
                    tracing::warn!(error = %err, "vector batch failed, retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.context("vector batch failed after retry")),
            }
        }

        self.commit_metadata(state, IndexKind::Vector, files)
    }

    /// After a successful backend flush, stamp the batch in the metadata
    /// store and release the buffers.
    fn commit_metadata(
        &self,
        state: &RunState,
        kind: IndexKind,
        files: &mut Vec<ScannedFile>,
    ) -> anyhow::Result<u64> {
        let updates: Vec<FileMetadataUpdate> =
            files.iter().map(FileMetadataUpdate::from_scanned).collect();
        self.metadata.upsert_batch(kind, &updates)?;
        let count = files.len() as u64;
        state.files_processed.fetch_add(count, Ordering::Relaxed);
        files.clear();
        Ok(count)
    }

    /// Watcher entry point: apply a coalesced set of per-file changes for
    /// one source, incrementally, for the given kinds.
    pub async fn apply_changes(
        &self,
        source: &SourceRef,
        changes: &[FileChange],
        kinds: &[IndexKind],
    ) -> Result<u64, EngineError> {
        if changes.is_empty() || kinds.is_empty() {
            return Ok(0);
        }
        let scanner = self.registry.scanner_for(source)?;

        let mut upserts: Vec<ScannedFile> = Vec::new();
        let mut removals: Vec<PathBuf> = Vec::new();
        for change in changes {
            match change.kind {
                ChangeKind::Upsert => {
                    if let Some(file) = scanner.process_path(&change.path) {
                        let path = file.file_path.to_string_lossy().to_string();
                        let unchanged = self
                            .metadata
                            .get_record(&path)
                            .ok()
                            .flatten()
                            .map_or(false, |record| {
                                kinds.iter().all(|k| record.index_kind.covers(*k))
                                    && record.last_indexed_at >= file.last_modified
                            });
                        if !unchanged {
                            upserts.push(file);
                        }
                    }
                }
                ChangeKind::Remove => removals.push(change.path.clone()),
            }
        }

        let mut processed = 0u64;
        for kind in kinds {
            let _guard = self.acquire_writer(source.clone(), *kind).await;
            match kind {
                IndexKind::Keyword => {
                    let documents: Vec<KeywordDocument> =
                        upserts.iter().map(KeywordDocument::from_scanned).collect();
                    let keyword = Arc::clone(&self.keyword);
                    let removal_ids: Vec<String> =
                        removals.iter().map(|p| ids::document_id(p)).collect();
                    tokio::task::spawn_blocking(move || {
                        for id in &removal_ids {
                            keyword.delete(id)?;
                        }
                        keyword.upsert(&documents)?;
                        keyword.commit()
                    })
                    .await
                    .map_err(|e| EngineError::Permanent(e.to_string()))?
                    .map_err(EngineError::from)?;
                }
                IndexKind::Vector => {
                    for path in &removals {
                        self.vector
                            .delete_by_file(path)
                            .await
                            .map_err(EngineError::from)?;
                    }
                    self.vector
                        .upsert_files(&upserts)
                        .await
                        .map_err(EngineError::from)?;
                }
            }

            let updates: Vec<FileMetadataUpdate> =
                upserts.iter().map(FileMetadataUpdate::from_scanned).collect();
            self.metadata
                .upsert_batch(*kind, &updates)
                .map_err(EngineError::from)?;
            processed += upserts.len() as u64;
        }

        for path in &removals {
            self.metadata
                .remove(&path.to_string_lossy())
                .map_err(EngineError::from)?;
        }

        if processed > 0 || !removals.is_empty() {
            self.metadata.set_last_index_time(None).ok();
            tracing::info!(
                source = %source,
                upserts = upserts.len(),
                removals = removals.len(),
                "watcher-driven incremental update applied"
            );
        }

        Ok(processed)
    }

    /// Synchronously purge a source from both backends and the metadata
    /// store. Used when a source is removed from the registry.
    pub async fn purge_source(&self, source: &SourceRef) -> Result<(usize, usize, usize), EngineError> {
        let _keyword_guard = self
            .acquire_writer(source.clone(), IndexKind::Keyword)
            .await;
        let _vector_guard = self.acquire_writer(source.clone(), IndexKind::Vector).await;

        let keyword = Arc::clone(&self.keyword);
        let source_type = source.source_type().to_string();
        let source_id = source.source_id();
        let keyword_deleted = tokio::task::spawn_blocking(move || {
            keyword.delete_by_source(&source_type, &source_id)
        })
        .await
        .map_err(|e| EngineError::Permanent(e.to_string()))?
        .map_err(EngineError::from)?;

        let chunks_deleted = self
            .vector
            .delete_by_source(source.source_type(), &source.source_id())
            .await
            .map_err(EngineError::from)?;

        let rows_deleted = self
            .metadata
            .remove_by_source(source)
            .map_err(EngineError::from)?;

        Ok((keyword_deleted, chunks_deleted, rows_deleted))
    }

    async fn acquire_writer(&self, source: SourceRef, kind: IndexKind) -> WriterGuard {
        let key = (source, kind);
        loop {
            {
                let mut active = self.active.lock();
                if !active.contains(&key) {
                    active.insert(key.clone());
                    return WriterGuard {
                        active: Arc::clone(&self.active),
                        key,
                    };
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn record_event(&self, state: &RunState, event: &str) {
        if let Some(obs) = &self.observability {
            let sources = state
                .sources
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            for kind in &state.kinds {
                obs.record_indexing_event(
                    &state.id.to_string(),
                    &sources,
                    kind.as_str(),
                    event,
                    state.files_processed.load(Ordering::Relaxed),
                )
                .ok();
            }
        }
    }

    /// Wait until a run reaches a terminal state, polling its status. Test
    /// and shutdown helper; the public contract is fire-and-forget.
    pub async fn wait_for_run(&self, id: Uuid, timeout: Duration) -> Option<RunProgress> {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self.run_progress(id)?;
            if progress.status != RunStatus::Running {
                return Some(progress);
            }
            if Instant::now() >= deadline {
                return Some(progress);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait for any in-flight writer to release, bounded by `timeout`.
    /// Called on shutdown after raising the stop flags.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.active.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::warn!("coordinator drain timed out with writers still active");
    }
}
