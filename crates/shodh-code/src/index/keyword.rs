//! Keyword (inverted) index adapter over Tantivy.
//!
//! Searchable fields, in attribute-priority order: file_name,
//! relative_path, folder_name, directory_path, content. Equality filters
//! run against untokenized companion fields. The adapter returns the
//! engine's raw ranking score normalised to [0, 1] plus a highlighted
//! snippet; search failures degrade to an empty hit list so the hybrid
//! engine can keep serving the other backend.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    self, IndexRecordOption, Schema, Value as TantivyValue, FAST, INDEXED, STORED, STRING, TEXT,
};
use tantivy::snippet::SnippetGenerator;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::types::{KeywordDocument, KeywordHit, SearchFilters};

/// Maximum characters in a highlighted snippet.
const SNIPPET_MAX_CHARS: usize = 600;

struct Fields {
    id: schema::Field,
    file_path: schema::Field,
    file_name: schema::Field,
    relative_path: schema::Field,
    relative_path_raw: schema::Field,
    folder_name: schema::Field,
    folder_name_raw: schema::Field,
    directory_path: schema::Field,
    directory_path_raw: schema::Field,
    extension: schema::Field,
    source_type: schema::Field,
    source_id: schema::Field,
    repository: schema::Field,
    content: schema::Field,
    last_modified: schema::Field,
    size: schema::Field,
}

pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
}

impl KeywordIndex {
    /// `id` and the filter companions must be STRING (indexed, untokenized)
    /// so `delete_term` and equality filters work.
    fn build_schema() -> (Schema, Fields) {
        let mut sb = Schema::builder();
        let fields = Fields {
            id: sb.add_text_field("id", STRING | STORED),
            file_path: sb.add_text_field("file_path", STRING | STORED),
            file_name: sb.add_text_field("file_name", TEXT | STORED),
            relative_path: sb.add_text_field("relative_path", TEXT | STORED),
            relative_path_raw: sb.add_text_field("relative_path_raw", STRING),
            folder_name: sb.add_text_field("folder_name", TEXT | STORED),
            folder_name_raw: sb.add_text_field("folder_name_raw", STRING),
            directory_path: sb.add_text_field("directory_path", TEXT | STORED),
            directory_path_raw: sb.add_text_field("directory_path_raw", STRING),
            extension: sb.add_text_field("extension", STRING | STORED),
            source_type: sb.add_text_field("source_type", STRING | STORED),
            source_id: sb.add_text_field("source_id", STRING | STORED),
            repository: sb.add_text_field("repository", STRING | STORED),
            content: sb.add_text_field("content", TEXT | STORED),
            last_modified: sb.add_i64_field("last_modified", INDEXED | STORED | FAST),
            size: sb.add_u64_field("size", INDEXED | STORED | FAST),
        };
        (sb.build(), fields)
    }

    /// An existing index whose schema lacks any of the current fields was
    /// written by an older layout and is rebuilt from scratch; documents
    /// re-enter on the next reindex.
    fn needs_rebuild(index: &Index) -> bool {
        let schema = index.schema();
        [
            "id",
            "file_path",
            "file_name",
            "relative_path",
            "relative_path_raw",
            "folder_name",
            "folder_name_raw",
            "directory_path",
            "directory_path_raw",
            "extension",
            "source_type",
            "source_id",
            "repository",
            "content",
            "last_modified",
            "size",
        ]
        .iter()
        .any(|name| schema.get_field(name).is_err())
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let index_path: PathBuf = dir.to_path_buf();
        std::fs::create_dir_all(&index_path).ok();

        let (schema, _) = Self::build_schema();

        let needs_rebuild = {
            let mmap_dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&mmap_dir)? {
                let existing = Index::open_in_dir(&index_path)?;
                let rebuild = Self::needs_rebuild(&existing);
                drop(existing);
                rebuild
            } else {
                false
            }
        };

        let index = if needs_rebuild {
            tracing::warn!(
                path = %index_path.display(),
                "keyword index schema is outdated, rebuilding"
            );
            std::fs::remove_dir_all(&index_path).ok();
            std::fs::create_dir_all(&index_path)?;
            Index::create_in_dir(&index_path, schema.clone())?
        } else {
            let mmap_dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&mmap_dir)? {
                Index::open_in_dir(&index_path)?
            } else {
                Index::create_in_dir(&index_path, schema.clone())?
            }
        };

        // Re-resolve fields against the opened index's schema.
        let opened_schema = index.schema();
        let field = |name: &str| -> Result<schema::Field> {
            opened_schema
                .get_field(name)
                .with_context(|| format!("keyword index missing field {name}"))
        };
        let fields = Fields {
            id: field("id")?,
            file_path: field("file_path")?,
            file_name: field("file_name")?,
            relative_path: field("relative_path")?,
            relative_path_raw: field("relative_path_raw")?,
            folder_name: field("folder_name")?,
            folder_name_raw: field("folder_name_raw")?,
            directory_path: field("directory_path")?,
            directory_path_raw: field("directory_path_raw")?,
            extension: field("extension")?,
            source_type: field("source_type")?,
            source_id: field("source_id")?,
            repository: field("repository")?,
            content: field("content")?,
            last_modified: field("last_modified")?,
            size: field("size")?,
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create keyword index reader")?;

        let writer = index
            .writer(100_000_000)
            .context("failed to create keyword index writer")?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    /// Add or replace a batch of documents. Changes become visible after
    /// the next commit (see [`await_quiescence`](Self::await_quiescence)).
    pub fn upsert(&self, documents: &[KeywordDocument]) -> Result<()> {
        let writer = self.writer.lock();
        for document in documents {
            writer.delete_term(Term::from_field_text(self.fields.id, &document.id));
            writer.add_document(doc!(
                self.fields.id => document.id.as_str(),
                self.fields.file_path => document.file_path.as_str(),
                self.fields.file_name => document.file_name.as_str(),
                self.fields.relative_path => document.relative_path.as_str(),
                self.fields.relative_path_raw => document.relative_path.as_str(),
                self.fields.folder_name => document.folder_name.as_str(),
                self.fields.folder_name_raw => document.folder_name.as_str(),
                self.fields.directory_path => document.directory_path.as_str(),
                self.fields.directory_path_raw => document.directory_path.as_str(),
                self.fields.extension => document.extension.as_str(),
                self.fields.source_type => document.source_type.as_str(),
                self.fields.source_id => document.source_id.as_str(),
                self.fields.repository => document.repository.as_str(),
                self.fields.content => document.content.as_str(),
                self.fields.last_modified => document.last_modified,
                self.fields.size => document.size,
            ))?;
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.id, id));
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("keyword index commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Commit pending writes and wait until the reader observes them. With
    /// an embedded engine, durability is established by the commit itself;
    /// the timeout bounds the reader reload.
    pub fn await_quiescence(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        {
            let mut writer = self.writer.lock();
            writer.commit().context("keyword index commit failed")?;
        }
        loop {
            match self.reader.reload() {
                Ok(()) => return Ok(()),
                Err(err) if Instant::now() < deadline => {
                    tracing::debug!(error = %err, "keyword reader reload pending");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Delete every document belonging to a source. Commits immediately so
    /// subsequent searches never return the deleted documents.
    pub fn delete_by_source(&self, source_type: &str, source_id: &str) -> Result<usize> {
        self.reader.reload().ok();
        let searcher = self.reader.searcher();
        let mut writer = self.writer.lock();
        let mut deleted = 0usize;

        for segment_reader in searcher.segment_readers() {
            let store_reader = segment_reader.get_store_reader(64)?;
            for doc_id in 0..segment_reader.max_doc() {
                if segment_reader.is_deleted(doc_id) {
                    continue;
                }
                let Ok(document) = store_reader.get::<TantivyDocument>(doc_id) else {
                    continue;
                };
                let doc_source_type = document
                    .get_first(self.fields.source_type)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let doc_source_id = document
                    .get_first(self.fields.source_id)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if doc_source_type == source_type && doc_source_id == source_id {
                    if let Some(id) = document
                        .get_first(self.fields.id)
                        .and_then(|v| v.as_str())
                    {
                        writer.delete_term(Term::from_field_text(self.fields.id, id));
                        deleted += 1;
                    }
                }
            }
        }

        if deleted > 0 {
            writer
                .commit()
                .context("keyword commit after delete failed")?;
            self.reader.reload()?;
            tracing::info!(
                source_type,
                source_id,
                deleted,
                "keyword index: deleted documents for source"
            );
        }

        Ok(deleted)
    }

    pub fn delete_all(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let searcher = self.reader.searcher();
        Ok(searcher.num_docs() as usize)
    }

    /// Keyword search with filters. Never raises: adapter-level failures
    /// are logged and surfaced as an empty hit list.
    pub fn search(&self, query: &str, filters: &SearchFilters, limit: usize) -> Vec<KeywordHit> {
        if query.trim().is_empty() || limit == 0 {
            return Vec::new();
        }
        match self.search_inner(query, filters, limit) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, query, "keyword search failed");
                Vec::new()
            }
        }
    }

    fn search_inner(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<KeywordHit>> {
        let searcher = self.reader.searcher();

        let searchable = vec![
            self.fields.file_name,
            self.fields.relative_path,
            self.fields.folder_name,
            self.fields.directory_path,
            self.fields.content,
        ];
        let parser = QueryParser::for_index(&self.index, searchable);
        let text_query: Box<dyn Query> = match parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped = query.replace('"', "");
                let fallback = QueryParser::for_index(&self.index, vec![self.fields.content]);
                fallback.parse_query(&format!("\"{escaped}\""))?
            }
        };

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
        for clause in self.filter_clauses(filters) {
            clauses.push((Occur::Must, clause));
        }
        let full_query: Box<dyn Query> = if clauses.len() == 1 {
            clauses.pop().expect("one clause").1
        } else {
            Box::new(BooleanQuery::new(clauses))
        };

        let top_docs = searcher.search(&full_query, &TopDocs::with_limit(limit))?;
        if top_docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut snippets = SnippetGenerator::create(&searcher, &*full_query, self.fields.content)
            .ok();
        if let Some(generator) = snippets.as_mut() {
            generator.set_max_num_chars(SNIPPET_MAX_CHARS);
        }

        // Normalise the engine's raw BM25 scores into [0, 1] by the top
        // score of this result set.
        let max_score = top_docs
            .iter()
            .map(|(score, _)| *score)
            .fold(f32::MIN, f32::max)
            .max(f32::EPSILON);

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let Ok(document) = searcher.doc::<TantivyDocument>(address) else {
                continue;
            };
            let get_str = |field: schema::Field| -> String {
                document
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };

            let mut snippet = snippets
                .as_ref()
                .map(|generator| generator.snippet_from_doc(&document).to_html())
                .unwrap_or_default();
            if snippet.is_empty() {
                snippet = get_str(self.fields.content)
                    .chars()
                    .take(SNIPPET_MAX_CHARS)
                    .collect();
            }

            hits.push(KeywordHit {
                id: get_str(self.fields.id),
                file_path: get_str(self.fields.file_path),
                file_name: get_str(self.fields.file_name),
                relative_path: get_str(self.fields.relative_path),
                folder_name: get_str(self.fields.folder_name),
                repository: get_str(self.fields.repository),
                source_type: get_str(self.fields.source_type),
                source_id: get_str(self.fields.source_id),
                file_type: get_str(self.fields.extension),
                score: score / max_score,
                snippet,
            });
        }

        Ok(hits)
    }

    /// Translate the shared filter set into the engine's native language:
    /// AND over field equalities, with multi-valued directory ids grouped
    /// as OR.
    fn filter_clauses(&self, filters: &SearchFilters) -> Vec<Box<dyn Query>> {
        let mut clauses: Vec<Box<dyn Query>> = Vec::new();

        let term = |field: schema::Field, value: &str| -> Box<dyn Query> {
            Box::new(TermQuery::new(
                Term::from_field_text(field, value),
                IndexRecordOption::Basic,
            ))
        };

        if let Some(repository) = &filters.repository {
            clauses.push(term(self.fields.repository, repository));
        }
        if let Some(folder) = &filters.folder_name {
            clauses.push(term(self.fields.folder_name_raw, folder));
        }
        if let Some(extension) = &filters.extension {
            clauses.push(term(self.fields.extension, &normalize_extension(extension)));
        }
        if let Some(directory_ids) = &filters.directory_ids {
            if !directory_ids.is_empty() {
                let sub_queries: Vec<Box<dyn Query>> = directory_ids
                    .iter()
                    .map(|id| term(self.fields.source_id, &id.to_string()))
                    .collect();
                clauses.push(Box::new(BooleanQuery::union(sub_queries)));
            }
        }

        clauses
    }
}

/// Filters may arrive as `py` or `.py`; documents always store the dotted
/// form.
pub fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}
