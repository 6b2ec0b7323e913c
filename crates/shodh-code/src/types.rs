use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// A unit of indexed content: a named repository or an id-identified
/// managed directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Repository(String),
    Directory(i64),
}

impl SourceRef {
    pub fn source_type(&self) -> &'static str {
        match self {
            SourceRef::Repository(_) => "repository",
            SourceRef::Directory(_) => "directory",
        }
    }

    /// The id used in backend filter fields: repository name or the
    /// directory id rendered as a string.
    pub fn source_id(&self) -> String {
        match self {
            SourceRef::Repository(name) => name.clone(),
            SourceRef::Directory(id) => id.to_string(),
        }
    }

    /// Legacy mirror field kept for keyword-index compatibility: the
    /// repository name, or empty for directories.
    pub fn repository(&self) -> &str {
        match self {
            SourceRef::Repository(name) => name.as_str(),
            SourceRef::Directory(_) => "",
        }
    }

    pub fn from_parts(source_type: &str, source_id: &str) -> Option<Self> {
        match source_type {
            "repository" => Some(SourceRef::Repository(source_id.to_string())),
            "directory" => source_id.parse().ok().map(SourceRef::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Repository(name) => write!(f, "repository:{name}"),
            SourceRef::Directory(id) => write!(f, "directory:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Keyword,
    Vector,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Keyword => "keyword",
            IndexKind::Vector => "vector",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which indexes currently cover a file, as recorded in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCoverage {
    Keyword,
    Vector,
    Both,
}

impl IndexCoverage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexCoverage::Keyword => "keyword",
            IndexCoverage::Vector => "vector",
            IndexCoverage::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(IndexCoverage::Keyword),
            "vector" => Some(IndexCoverage::Vector),
            "both" => Some(IndexCoverage::Both),
            _ => None,
        }
    }

    pub fn covers(&self, kind: IndexKind) -> bool {
        matches!(
            (self, kind),
            (IndexCoverage::Both, _)
                | (IndexCoverage::Keyword, IndexKind::Keyword)
                | (IndexCoverage::Vector, IndexKind::Vector)
        )
    }
}

/// A discovered file ready for indexing.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Absolute path.
    pub file_path: PathBuf,
    /// Path relative to the source root.
    pub relative_path: String,
    pub source: SourceRef,
    /// Extension including the leading dot (e.g. `.py`), empty if none.
    pub file_type: String,
    pub size_bytes: u64,
    /// Mtime as unix seconds, captured at scan time.
    pub last_modified: i64,
    /// Decoded text content.
    pub content: String,
}

impl ScannedFile {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn folder_name(&self) -> String {
        self.file_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn directory_path(&self) -> String {
        self.file_path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Maximum content length stored in the keyword index; longer files are
/// truncated for indexing only.
pub const KEYWORD_CONTENT_LIMIT: usize = 100_000;

/// Document shape written to the keyword index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordDocument {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub folder_name: String,
    pub directory_path: String,
    pub relative_path: String,
    pub extension: String,
    pub source_type: String,
    pub source_id: String,
    pub repository: String,
    pub content: String,
    pub last_modified: i64,
    pub size: u64,
}

impl KeywordDocument {
    pub fn from_scanned(file: &ScannedFile) -> Self {
        let mut content = file.content.clone();
        if content.len() > KEYWORD_CONTENT_LIMIT {
            let mut cut = KEYWORD_CONTENT_LIMIT;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
        }

        Self {
            id: crate::ids::document_id(&file.file_path),
            file_path: file.file_path.to_string_lossy().to_string(),
            file_name: file.file_name(),
            folder_name: file.folder_name(),
            directory_path: file.directory_path(),
            relative_path: file.relative_path.clone(),
            extension: file.file_type.clone(),
            source_type: file.source.source_type().to_string(),
            source_id: file.source.source_id(),
            repository: file.source.repository().to_string(),
            content,
            last_modified: file.last_modified,
            size: file.size_bytes,
        }
    }
}

/// A hit from the keyword index adapter.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub relative_path: String,
    pub folder_name: String,
    pub repository: String,
    pub source_type: String,
    pub source_id: String,
    pub file_type: String,
    /// Relevance in [0, 1].
    pub score: f32,
    /// Cropped, highlighted content preview (<= 600 chars).
    pub snippet: String,
}

/// Per-chunk metadata stored alongside each embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_path: String,
    pub source_type: String,
    pub source_id: String,
    pub repository: String,
    pub file_type: String,
    pub relative_path: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

/// A hit from the vector index adapter, already deduplicated to the best
/// chunk per file. `distance` is the engine's raw distance; the fusion
/// layer consumes ranks only.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub doc_id: String,
    pub distance: f32,
    pub metadata: ChunkMetadata,
    pub chunk_text: String,
}

/// Shared filter set applied to both retrieval backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub repository: Option<String>,
    pub directory_ids: Option<Vec<i64>>,
    pub folder_name: Option<String>,
    pub extension: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.repository.is_none()
            && self.directory_ids.as_ref().map_or(true, |d| d.is_empty())
            && self.folder_name.is_none()
            && self.extension.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    Keyword,
    Semantic,
}

/// Fused result returned by the hybrid engine.
#[derive(Debug, Clone, Serialize)]
pub struct HybridResult {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub relative_path: String,
    pub source_type: String,
    pub source_id: String,
    pub repository: String,
    /// Priority-weighted RRF score in hybrid mode; backend-native score in
    /// the single-backend modes.
    pub score: f32,
    pub keyword_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
    pub keyword_score: Option<f32>,
    pub semantic_distance: Option<f32>,
    pub snippet: String,
    pub file_type: String,
}

/// Durable per-file record owned by the metadata store.
#[derive(Debug, Clone)]
pub struct FileMetadataRecord {
    pub file_path: String,
    pub source: SourceRef,
    pub last_indexed_at: i64,
    pub last_modified: i64,
    pub content_hash: Option<String>,
    pub size: u64,
    pub index_kind: IndexCoverage,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Pending metadata write produced by the coordinator after a successful
/// backend flush.
#[derive(Debug, Clone)]
pub struct FileMetadataUpdate {
    pub file_path: String,
    pub source: SourceRef,
    pub last_modified: i64,
    pub content_hash: Option<String>,
    pub size: u64,
}

impl FileMetadataUpdate {
    pub fn from_scanned(file: &ScannedFile) -> Self {
        Self {
            file_path: file.file_path.to_string_lossy().to_string(),
            source: file.source.clone(),
            last_modified: file.last_modified,
            content_hash: Some(crate::ids::content_hash(file.content.as_bytes())),
            size: file.size_bytes,
        }
    }
}

/// Per (source, index kind) indexing statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_type: String,
    pub source_id: String,
    pub index_kind: String,
    pub initial_index_time_seconds: Option<f64>,
    pub initial_index_timestamp: Option<i64>,
    pub last_reindex_time_seconds: Option<f64>,
    pub last_reindex_timestamp: Option<i64>,
    pub total_files_indexed: u64,
    pub total_bytes_indexed: u64,
}

/// Aggregate metadata-store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataStats {
    pub total_files: u64,
    pub by_source: HashMap<String, u64>,
    pub by_index_kind: HashMap<String, u64>,
}

/// A managed directory record from the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub notes: Option<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}
