//! Vector (dense) index adapter over LanceDB.
//!
//! Chunks file content, embeds in small batches, and stores one row per
//! chunk keyed `doc_id::chunk_N` with the filterable metadata fields.
//! Queries return raw distances and deduplicate to the best-scoring chunk
//! per file; the fusion layer consumes ranks only.

use anyhow::{Context, Result};
use arrow_array::{
    Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
    FixedSizeListArray,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::embeddings::EmbeddingModel;
use crate::ids;
use crate::index::chunker::TextChunker;
use crate::types::{ChunkMetadata, ScannedFile, SearchFilters, VectorHit};

struct ChunkRow {
    id: String,
    doc_id: String,
    chunk_index: u32,
    total_chunks: u32,
    text: String,
    file_path: String,
    relative_path: String,
    source_type: String,
    source_id: String,
    repository: String,
    file_type: String,
    vector: Vec<f32>,
}

pub struct VectorIndex {
    db: lancedb::Connection,
    embedder: Arc<dyn EmbeddingModel>,
    chunker: TextChunker,
    dimension: usize,
    table_name: String,
}

impl VectorIndex {
    pub async fn open(
        dir: &Path,
        embedder: Arc<dyn EmbeddingModel>,
        chunk_size: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir).ok();
        let db = lancedb::connect(&dir.to_string_lossy())
            .execute()
            .await
            .context("failed to connect to LanceDB")?;

        let index = Self {
            db,
            dimension: embedder.dimension(),
            embedder,
            chunker: TextChunker::new(chunk_size),
            table_name: "chunks".to_string(),
        };
        index.ensure_table().await?;
        Ok(index)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("total_chunks", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("file_path", DataType::Utf8, false),
            Field::new("relative_path", DataType::Utf8, false),
            Field::new("source_type", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("repository", DataType::Utf8, false),
            Field::new("file_type", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        // Create with a seed record to fix the schema, then delete it.
        let seed = ChunkRow {
            id: "__seed__".into(),
            doc_id: "__seed__".into(),
            chunk_index: 0,
            total_chunks: 0,
            text: String::new(),
            file_path: String::new(),
            relative_path: String::new(),
            source_type: String::new(),
            source_id: String::new(),
            repository: String::new(),
            file_type: String::new(),
            vector: vec![0.0; self.dimension],
        };
        let schema = self.schema();
        let batch = self.build_batch(&[seed])?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(&self.table_name, Box::new(batches))
            .execute()
            .await
            .context("failed to create chunks table")?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    fn build_batch(&self, rows: &[ChunkRow]) -> Result<RecordBatch> {
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let doc_ids: Vec<&str> = rows.iter().map(|r| r.doc_id.as_str()).collect();
        let chunk_indices: Vec<u32> = rows.iter().map(|r| r.chunk_index).collect();
        let total_chunks: Vec<u32> = rows.iter().map(|r| r.total_chunks).collect();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
        let file_paths: Vec<&str> = rows.iter().map(|r| r.file_path.as_str()).collect();
        let relative_paths: Vec<&str> = rows.iter().map(|r| r.relative_path.as_str()).collect();
        let source_types: Vec<&str> = rows.iter().map(|r| r.source_type.as_str()).collect();
        let source_ids: Vec<&str> = rows.iter().map(|r| r.source_id.as_str()).collect();
        let repositories: Vec<&str> = rows.iter().map(|r| r.repository.as_str()).collect();
        let file_types: Vec<&str> = rows.iter().map(|r| r.file_type.as_str()).collect();

        let flat_vectors: Vec<f32> = rows.iter().flat_map(|r| r.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(UInt32Array::from(total_chunks)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(file_paths)),
                Arc::new(StringArray::from(relative_paths)),
                Arc::new(StringArray::from(source_types)),
                Arc::new(StringArray::from(source_ids)),
                Arc::new(StringArray::from(repositories)),
                Arc::new(StringArray::from(file_types)),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("failed to build chunk RecordBatch")
    }

    /// Chunk, embed, and store a batch of files. Existing chunks for each
    /// file are removed first, so reindexing is a clean replacement.
    /// Returns the number of chunks written.
    pub async fn upsert_files(&self, files: &[ScannedFile]) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }

        let mut rows: Vec<ChunkRow> = Vec::new();
        let mut texts: Vec<String> = Vec::new();

        for file in files {
            let doc_id = ids::document_id(&file.file_path);
            let chunks = self.chunker.chunk(&file.content);
            let total = chunks.len() as u32;
            for (i, chunk) in chunks.into_iter().enumerate() {
                texts.push(chunk.clone());
                rows.push(ChunkRow {
                    id: ids::chunk_id(&doc_id, i as u32),
                    doc_id: doc_id.clone(),
                    chunk_index: i as u32,
                    total_chunks: total,
                    text: chunk,
                    file_path: file.file_path.to_string_lossy().to_string(),
                    relative_path: file.relative_path.clone(),
                    source_type: file.source.source_type().to_string(),
                    source_id: file.source.source_id(),
                    repository: file.source.repository().to_string(),
                    file_type: file.file_type.clone(),
                    vector: Vec::new(),
                });
            }
        }

        if rows.is_empty() {
            return Ok(0);
        }

        let text_refs: Vec<&str> = texts.iter().map(|t| t.as_str()).collect();
        let embeddings = self
            .embedder
            .embed_documents(&text_refs)
            .context("embedding batch failed")?;
        for (row, embedding) in rows.iter_mut().zip(embeddings.into_iter()) {
            row.vector = embedding;
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("failed to open chunks table")?;

        // Replace any previously indexed chunks for these files.
        let unique_doc_ids: Vec<&str> = rows
            .iter()
            .map(|r| r.doc_id.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for chunk in unique_doc_ids.chunks(50) {
            let list = chunk
                .iter()
                .map(|id| format!("'{}'", escape(id)))
                .collect::<Vec<_>>()
                .join(", ");
            table.delete(&format!("doc_id IN ({list})")).await.ok();
        }

        let count = rows.len();
        let schema = self.schema();
        let batch = self.build_batch(&rows)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("failed to insert chunks")?;

        tracing::debug!(chunks = count, files = files.len(), "vector index: inserted chunks");
        Ok(count)
    }

    /// Nearest-neighbour query, deduplicated to one hit (the best-scoring
    /// chunk) per file. Never raises on adapter-level failures.
    pub async fn query(&self, text: &str, filters: &SearchFilters, limit: usize) -> Vec<VectorHit> {
        if text.trim().is_empty() || limit == 0 {
            return Vec::new();
        }
        match self.query_inner(text, filters, limit).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "vector search failed");
                Vec::new()
            }
        }
    }

    async fn query_inner(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let embedding = self.embedder.embed_query(text)?;
        let table = self.db.open_table(&self.table_name).execute().await?;

        // Over-fetch chunks, then keep the best chunk per file.
        let mut query = table
            .query()
            .nearest_to(embedding.as_slice())?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(limit * 3);

        if let Some(predicate) = filter_predicate(filters) {
            query = query.only_if(predicate);
        }

        let results = query
            .execute()
            .await
            .context("vector search failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut seen_files = HashSet::new();
        let mut hits = Vec::new();
        for hit in extract_hits(&batches) {
            if !seen_files.insert(hit.metadata.file_path.clone()) {
                continue;
            }
            hits.push(hit);
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    pub async fn delete_by_file(&self, path: &Path) -> Result<usize> {
        let doc_id = ids::document_id(path);
        let table = self.db.open_table(&self.table_name).execute().await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table
            .delete(&format!("doc_id = '{}'", escape(&doc_id)))
            .await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    pub async fn delete_by_source(&self, source_type: &str, source_id: &str) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table
            .delete(&format!(
                "source_type = '{}' AND source_id = '{}'",
                escape(source_type),
                escape(source_id)
            ))
            .await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        let deleted = before.saturating_sub(after);
        if deleted > 0 {
            tracing::info!(source_type, source_id, deleted, "vector index: deleted chunks for source");
        }
        Ok(deleted)
    }

    pub async fn delete_all(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            self.db.drop_table(&self.table_name, &[]).await?;
        }
        self.ensure_table().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Translate the shared filter set into a Lance SQL predicate. Folder-name
/// filtering is keyword-side only; the chunk metadata does not carry it.
fn filter_predicate(filters: &SearchFilters) -> Option<String> {
    let mut predicates = Vec::new();

    if let Some(repository) = &filters.repository {
        predicates.push(format!("repository = '{}'", escape(repository)));
    }
    if let Some(extension) = &filters.extension {
        predicates.push(format!(
            "file_type = '{}'",
            escape(&super::keyword::normalize_extension(extension))
        ));
    }
    if let Some(directory_ids) = &filters.directory_ids {
        if !directory_ids.is_empty() {
            let clauses: Vec<String> = directory_ids
                .iter()
                .map(|id| format!("source_id = '{id}'"))
                .collect();
            predicates.push(format!("({})", clauses.join(" OR ")));
        }
    }

    if predicates.is_empty() {
        None
    } else {
        Some(predicates.join(" AND "))
    }
}

fn extract_hits(batches: &[RecordBatch]) -> Vec<VectorHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let string_col = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let u32_col = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        };

        let doc_ids = string_col("doc_id");
        let texts = string_col("text");
        let file_paths = string_col("file_path");
        let relative_paths = string_col("relative_path");
        let source_types = string_col("source_type");
        let source_ids = string_col("source_id");
        let repositories = string_col("repository");
        let file_types = string_col("file_type");
        let chunk_indices = u32_col("chunk_index");
        let total_chunks = u32_col("total_chunks");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(doc_ids), Some(texts), Some(file_paths)) = (doc_ids, texts, file_paths) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let doc_id = doc_ids.value(i);
            if doc_id.is_empty() || doc_id == "__seed__" {
                continue;
            }
            hits.push(VectorHit {
                doc_id: doc_id.to_string(),
                distance: distances.map(|d| d.value(i)).unwrap_or(f32::MAX),
                metadata: ChunkMetadata {
                    file_path: file_paths.value(i).to_string(),
                    source_type: source_types.map(|c| c.value(i).to_string()).unwrap_or_default(),
                    source_id: source_ids.map(|c| c.value(i).to_string()).unwrap_or_default(),
                    repository: repositories.map(|c| c.value(i).to_string()).unwrap_or_default(),
                    file_type: file_types.map(|c| c.value(i).to_string()).unwrap_or_default(),
                    relative_path: relative_paths
                        .map(|c| c.value(i).to_string())
                        .unwrap_or_default(),
                    chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                    total_chunks: total_chunks.map(|c| c.value(i)).unwrap_or(0),
                },
                chunk_text: texts.value(i).to_string(),
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::hashed::HashedEmbedder;
    use crate::types::SourceRef;
    use std::path::PathBuf;

    fn scanned(path: &str, source: SourceRef, content: &str) -> ScannedFile {
        ScannedFile {
            file_path: PathBuf::from(path),
            relative_path: path.trim_start_matches('/').to_string(),
            source,
            file_type: ".md".into(),
            size_bytes: content.len() as u64,
            last_modified: 1_700_000_000,
            content: content.to_string(),
        }
    }

    async fn fresh_index(dir: &Path) -> VectorIndex {
        let embedder = Arc::new(HashedEmbedder::new(64));
        VectorIndex::open(dir, embedder, 100).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_query_and_dedup_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = fresh_index(dir.path()).await;

        let long_doc = "token stream parser ".repeat(30);
        let files = vec![
            scanned(
                "/docs/parser.md",
                SourceRef::Repository("proj".into()),
                &long_doc,
            ),
            scanned(
                "/docs/other.md",
                SourceRef::Repository("proj".into()),
                "completely unrelated cooking recipe",
            ),
        ];
        let chunks = index.upsert_files(&files).await.unwrap();
        assert!(chunks > 2, "long doc should produce multiple chunks");

        let hits = index
            .query("token stream parser", &SearchFilters::default(), 5)
            .await;
        assert!(!hits.is_empty());
        // Deduplicated: at most one hit per file.
        let mut seen = HashSet::new();
        for hit in &hits {
            assert!(seen.insert(hit.metadata.file_path.clone()));
        }
        assert_eq!(hits[0].metadata.file_path, "/docs/parser.md");
    }

    #[tokio::test]
    async fn reindexing_replaces_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let index = fresh_index(dir.path()).await;

        let file = scanned(
            "/docs/a.md",
            SourceRef::Repository("proj".into()),
            "first version",
        );
        index.upsert_files(&[file.clone()]).await.unwrap();
        index.upsert_files(&[file]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_source_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = fresh_index(dir.path()).await;

        index
            .upsert_files(&[
                scanned("/a/one.md", SourceRef::Repository("a".into()), "alpha text"),
                scanned("/b/two.md", SourceRef::Directory(3), "beta text"),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete_by_source("directory", "3").await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 1);

        assert_eq!(
            index
                .delete_by_file(&PathBuf::from("/a/one.md"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn directory_filter_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let index = fresh_index(dir.path()).await;

        index
            .upsert_files(&[
                scanned("/a/doc.md", SourceRef::Directory(1), "shared banana words"),
                scanned("/b/doc.md", SourceRef::Directory(2), "shared banana words"),
            ])
            .await
            .unwrap();

        let filters = SearchFilters {
            directory_ids: Some(vec![2]),
            ..Default::default()
        };
        let hits = index.query("banana", &filters, 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.source_id, "2");
    }
}
