//! Process-wide lifecycle and the typed facade exposed to the boundary
//! layer.
//!
//! Start-up order: config → metadata store (migrations) → backend adapters
//! → coordinator → watchers for enabled sources (optional). Shutdown stops
//! watchers, signals the coordinator to halt at the next batch boundary,
//! and waits for in-flight writers to drain.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{Priority, RepositoryConfig, Settings};
use crate::coordinator::{IndexMode, IndexingCoordinator, RunProgress};
use crate::db::{MetadataStore, ObservabilityStore};
use crate::embeddings;
use crate::error::EngineError;
use crate::index::{KeywordIndex, VectorIndex};
use crate::registry::{CandidateSource, SourceRegistry};
use crate::search::fusion::DEFAULT_RRF_K;
use crate::search::{HybridSearchEngine, QueryRewriter, SearchRequest};
use crate::types::{HybridResult, IndexKind, MetadataStats, SourceRef, SourceStats};
use crate::watcher::{RepositoryWatcher, WatchConfig};

/// Both retrievals over-fetch by this factor before fusion.
const FETCH_MULTIPLIER: usize = 3;

const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStats {
    pub keyword_documents: usize,
    pub vector_chunks: usize,
    pub is_indexing: bool,
    pub last_index_time: Option<String>,
    pub total_searches: u64,
    pub total_search_time_ms: u64,
    pub metadata: MetadataStats,
    pub source_stats: Vec<SourceStats>,
    /// Progress fields for the in-flight run, while indexing.
    pub current_run: Option<RunProgress>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReindexResponse {
    pub status: String,
    pub run_id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StopResponse {
    pub status: String,
    pub stopped: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoverResponse {
    pub total_found: usize,
    pub new: usize,
    pub already_indexed: usize,
    pub items: Vec<CandidateSource>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AddSourcesResponse {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Supervisor {
    settings: Settings,
    metadata: Arc<MetadataStore>,
    observability: Option<Arc<ObservabilityStore>>,
    keyword: Arc<KeywordIndex>,
    vector: Arc<VectorIndex>,
    registry: Arc<SourceRegistry>,
    coordinator: Arc<IndexingCoordinator>,
    watchers: RepositoryWatcher,
    engine: HybridSearchEngine,
}

impl Supervisor {
    pub async fn start(settings: Settings) -> Result<Self, EngineError> {
        settings.validate().map_err(EngineError::Validation)?;
        std::fs::create_dir_all(&settings.data_dir).ok();

        let metadata = Arc::new(MetadataStore::open(&settings.metadata_db_path())?);

        let observability = match ObservabilityStore::open(&settings.observability_db_path()) {
            Ok(store) => {
                store.sweep_retention(settings.retention_days).ok();
                Some(Arc::new(store))
            }
            Err(err) => {
                tracing::warn!(error = %err, "observability store unavailable, continuing without it");
                None
            }
        };

        let registry = Arc::new(SourceRegistry::new(Arc::clone(&metadata)));
        let loaded = registry.load_config_file(&settings.repositories_config)?;
        tracing::info!(repositories = loaded, "loaded source configuration");

        let embedder = embeddings::load_embedder(&settings.embedding)?;
        let keyword = Arc::new(KeywordIndex::open(&settings.keyword_index_dir())?);
        let vector = Arc::new(
            VectorIndex::open(&settings.vector_index_dir(), embedder, settings.chunk_size).await?,
        );

        let rewriter = if settings.rewriter_enabled {
            Some(Arc::new(QueryRewriter::new(settings.rewriter_endpoint())))
        } else {
            None
        };

        let coordinator = IndexingCoordinator::start(
            Arc::clone(&registry),
            Arc::clone(&metadata),
            Arc::clone(&keyword),
            Arc::clone(&vector),
            observability.clone(),
            settings.keyword_batch_size,
            settings.vector_batch_size,
        );

        let watchers = RepositoryWatcher::new(Arc::clone(&coordinator));

        let engine = HybridSearchEngine::new(
            Arc::clone(&keyword),
            Arc::clone(&vector),
            rewriter,
            Arc::clone(&registry),
            DEFAULT_RRF_K,
            FETCH_MULTIPLIER,
        );

        let supervisor = Self {
            settings,
            metadata,
            observability,
            keyword,
            vector,
            registry,
            coordinator,
            watchers,
            engine,
        };

        if supervisor.settings.watch_enabled {
            for source in supervisor.registry.enabled_sources()? {
                if let Err(err) = supervisor.start_watching(&source) {
                    tracing::warn!(source = %source, error = %err, "failed to start watcher");
                }
            }
        }

        tracing::info!("shodh-code supervisor ready");
        Ok(supervisor)
    }

    /// Stop watchers, halt indexing at the next batch boundary, and wait
    /// for in-flight writers to finish.
    pub async fn shutdown(&self) {
        self.watchers.stop_all();
        self.coordinator
            .stop(&[IndexKind::Keyword, IndexKind::Vector]);
        self.coordinator.drain(Duration::from_secs(30)).await;
        tracing::info!("shodh-code supervisor stopped");
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &IndexingCoordinator {
        &self.coordinator
    }

    // ── Boundary operations ────────────────────────────────────────────

    pub async fn search(&self, request: SearchRequest) -> Result<Vec<HybridResult>, EngineError> {
        if request.limit == 0 || request.limit > MAX_SEARCH_LIMIT {
            return Err(EngineError::validation(format!(
                "limit must be in [1, {MAX_SEARCH_LIMIT}]"
            )));
        }

        let start = Instant::now();
        let results = self.engine.search(&request).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        self.metadata.record_search(elapsed_ms).ok();
        if let Some(obs) = &self.observability {
            let mode = match request.mode {
                crate::types::SearchMode::Hybrid => "hybrid",
                crate::types::SearchMode::Keyword => "keyword",
                crate::types::SearchMode::Semantic => "semantic",
            };
            obs.record_search_metric(mode, elapsed_ms, results.len()).ok();
        }

        Ok(results)
    }

    pub async fn stats(&self) -> Result<SystemStats, EngineError> {
        let keyword_documents = self.keyword.count().unwrap_or(0);
        let vector_chunks = self.vector.count().await.unwrap_or(0);
        let (total_searches, total_search_time_ms) = self.metadata.get_search_stats()?;

        Ok(SystemStats {
            keyword_documents,
            vector_chunks,
            is_indexing: self.coordinator.is_indexing(),
            last_index_time: self.metadata.get_last_index_time()?,
            total_searches,
            total_search_time_ms,
            metadata: self.metadata.stats()?,
            source_stats: self.metadata.all_source_stats()?,
            current_run: self.coordinator.current_run(),
        })
    }

    /// Fire-and-forget reindex; callers poll `stats()` for progress.
    pub async fn reindex(
        &self,
        sources: Option<Vec<String>>,
        kinds: Vec<IndexKind>,
        full_rebuild: bool,
    ) -> Result<ReindexResponse, EngineError> {
        let resolved = match sources {
            Some(selectors) => {
                let mut resolved = Vec::with_capacity(selectors.len());
                for selector in &selectors {
                    resolved.push(self.registry.resolve(selector).ok_or_else(|| {
                        EngineError::not_found(format!("unknown source: {selector}"))
                    })?);
                }
                resolved
            }
            None => Vec::new(),
        };

        let kinds = if kinds.is_empty() {
            vec![IndexKind::Keyword, IndexKind::Vector]
        } else {
            kinds
        };
        let mode = if full_rebuild {
            IndexMode::FullRebuild
        } else {
            IndexMode::Incremental
        };

        let run = self.coordinator.index(resolved, kinds, mode).await?;
        Ok(ReindexResponse {
            status: "started".into(),
            run_id: run.id,
            started_at: run.started_at,
            sources: run.sources.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn stop_indexing(&self, kinds: Vec<IndexKind>) -> StopResponse {
        let kinds = if kinds.is_empty() {
            vec![IndexKind::Keyword, IndexKind::Vector]
        } else {
            kinds
        };
        let stopped = self.coordinator.stop(&kinds);
        StopResponse {
            status: "stopping".into(),
            stopped: stopped.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn discover(&self, root: &Path, max_depth: usize) -> Result<DiscoverResponse, EngineError> {
        let items = self.registry.discover(root, max_depth, &[])?;
        let already_indexed = items.iter().filter(|c| c.already_indexed).count();
        Ok(DiscoverResponse {
            total_found: items.len(),
            new: items.len() - already_indexed,
            already_indexed,
            items,
        })
    }

    /// Register new sources by path: a path containing `.git` becomes a
    /// repository, anything else a managed directory. Duplicates are
    /// skipped, not errors.
    pub async fn add_sources(
        &self,
        paths: Vec<PathBuf>,
        priority: Priority,
        enabled: bool,
    ) -> Result<AddSourcesResponse, EngineError> {
        let mut added = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            let display = path.display().to_string();
            if !path.is_dir() {
                return Err(EngineError::validation(format!(
                    "path is not a directory: {display}"
                )));
            }

            if path.join(".git").is_dir() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| display.clone());
                let config = RepositoryConfig {
                    name: name.clone(),
                    path: path.clone(),
                    enabled,
                    priority,
                    locked: false,
                    file_patterns: crate::config::FilePatterns::standard(),
                };
                match self.registry.add_repository(config) {
                    Ok(()) => added.push(name),
                    Err(EngineError::Conflict(_)) => skipped.push(display),
                    Err(err) => return Err(err),
                }
            } else {
                let directory_priority = match priority {
                    Priority::High => 2,
                    Priority::Medium => 1,
                    Priority::Low => 0,
                };
                match self
                    .registry
                    .add_directory(&path, directory_priority, enabled, None)
                {
                    Ok(record) => added.push(format!("directory:{}", record.id)),
                    Err(EngineError::Conflict(_)) => skipped.push(display),
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(AddSourcesResponse { added, skipped })
    }

    pub fn enable_source(&self, selector: &str) -> Result<(), EngineError> {
        let source = self.resolve(selector)?;
        match &source {
            SourceRef::Repository(name) => self.registry.set_repository_enabled(name, true)?,
            SourceRef::Directory(id) => self.registry.set_directory_enabled(*id, true)?,
        }
        if self.settings.watch_enabled {
            if let Err(err) = self.start_watching(&source) {
                tracing::warn!(source = %source, error = %err, "failed to start watcher");
            }
        }
        Ok(())
    }

    pub fn disable_source(&self, selector: &str) -> Result<(), EngineError> {
        let source = self.resolve(selector)?;
        self.watchers.unwatch(&source).ok();
        match &source {
            SourceRef::Repository(name) => self.registry.set_repository_enabled(name, false),
            SourceRef::Directory(id) => self.registry.set_directory_enabled(*id, false),
        }
    }

    /// Remove a source from the catalogue and synchronously purge its
    /// documents from both backend indexes and the metadata store.
    pub async fn remove_source(&self, selector: &str) -> Result<(), EngineError> {
        let source = self.resolve(selector)?;
        self.watchers.unwatch(&source).ok();

        match &source {
            SourceRef::Repository(name) => {
                self.registry.remove_repository(name)?;
            }
            SourceRef::Directory(id) => {
                self.registry.remove_directory(*id)?;
            }
        }

        let (keyword_docs, vector_chunks, metadata_rows) =
            self.coordinator.purge_source(&source).await?;
        tracing::info!(
            source = %source,
            keyword_docs,
            vector_chunks,
            metadata_rows,
            "source removed and purged"
        );
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────────

    fn resolve(&self, selector: &str) -> Result<SourceRef, EngineError> {
        self.registry
            .resolve(selector)
            .ok_or_else(|| EngineError::not_found(format!("unknown source: {selector}")))
    }

    fn start_watching(&self, source: &SourceRef) -> Result<(), EngineError> {
        let root = self.registry.source_root(source)?;
        let config = WatchConfig {
            extensions: self.registry.watch_extensions(source)?,
            exclude_patterns: self.registry.exclude_patterns(source)?,
            debounce_window: self.settings.debounce_window(),
            kinds: vec![IndexKind::Keyword, IndexKind::Vector],
        };
        self.watchers.watch(source.clone(), root, config)
    }
}
