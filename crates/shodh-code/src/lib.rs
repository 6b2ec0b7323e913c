//! shodh-code: local hybrid code & documentation search.
//!
//! Two independent indexes over a set of source repositories and managed
//! directories: a Tantivy inverted index and a LanceDB dense-vector index,
//! kept consistent with the filesystem by an incremental indexing
//! coordinator and per-source watchers, and queried in parallel with
//! Reciprocal Rank Fusion merging the two rankings.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod ids;
pub mod index;
pub mod registry;
pub mod scanner;
pub mod search;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use config::{Priority, RepositoriesConfig, RepositoryConfig, Settings};
pub use coordinator::{IndexMode, IndexingCoordinator, RunStatus};
pub use error::EngineError;
pub use search::{HybridSearchEngine, SearchRequest};
pub use supervisor::Supervisor;
pub use types::{HybridResult, IndexKind, SearchFilters, SearchMode, SourceRef};
