//! Hybrid query engine: optional query rewrite, parallel keyword + vector
//! retrieval over a shared filter set, Reciprocal Rank Fusion, source
//! priority re-weighting, and hydration of the fused results.
//!
//! Either backend returning empty (or failing) still yields a ranked
//! answer from the other; both failing yields an empty list, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::index::{KeywordIndex, VectorIndex};
use crate::registry::SourceRegistry;
use crate::search::fusion::reciprocal_rank_fusion;
use crate::search::rewriter::{QueryRewriter, RewrittenQuery};
use crate::types::{HybridResult, KeywordHit, SearchFilters, SearchMode, VectorHit};

/// Deadline for the advisory rewrite call.
const REWRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Snippet length when hydrating from the vector side.
const VECTOR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub min_score: f32,
    pub mode: SearchMode,
    pub rewrite: bool,
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 10,
            min_score: 0.0,
            mode: SearchMode::Hybrid,
            rewrite: false,
            filters: SearchFilters::default(),
        }
    }
}

pub struct HybridSearchEngine {
    keyword: Arc<KeywordIndex>,
    vector: Arc<VectorIndex>,
    rewriter: Option<Arc<QueryRewriter>>,
    registry: Arc<SourceRegistry>,
    rrf_k: usize,
    fetch_multiplier: usize,
}

impl HybridSearchEngine {
    pub fn new(
        keyword: Arc<KeywordIndex>,
        vector: Arc<VectorIndex>,
        rewriter: Option<Arc<QueryRewriter>>,
        registry: Arc<SourceRegistry>,
        rrf_k: usize,
        fetch_multiplier: usize,
    ) -> Self {
        Self {
            keyword,
            vector,
            rewriter,
            registry,
            rrf_k,
            fetch_multiplier: fetch_multiplier.max(1),
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Vec<HybridResult> {
        if request.query.trim().is_empty() || request.limit == 0 {
            return Vec::new();
        }

        // Step 1: advisory rewrite. Caller-supplied filters win over
        // anything the rewriter suggests.
        let mut filters = request.filters.clone();
        let rewritten = match (&self.rewriter, request.rewrite) {
            (Some(rewriter), true) => {
                let rewritten = rewriter.rewrite(&request.query, REWRITE_TIMEOUT).await;
                if filters.folder_name.is_none() {
                    filters.folder_name = rewritten.filters.folder_name.clone();
                }
                if filters.extension.is_none() {
                    filters.extension = rewritten.filters.extensions.first().cloned();
                }
                rewritten
            }
            _ => RewrittenQuery::passthrough(&request.query),
        };

        match request.mode {
            SearchMode::Hybrid => {
                self.search_hybrid(&rewritten, &filters, request).await
            }
            SearchMode::Keyword => {
                let hits = self
                    .keyword_retrieval(rewritten.keywords.clone(), filters, request.limit)
                    .await;
                let mut results: Vec<HybridResult> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| keyword_result(hit, i + 1, hit.score))
                    .collect();
                results.retain(|r| r.score >= request.min_score);
                results
            }
            SearchMode::Semantic => {
                let hits = self
                    .vector
                    .query(&rewritten.semantic_intent, &filters, request.limit)
                    .await;
                let mut results: Vec<HybridResult> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| vector_result(hit, i + 1, 1.0 / (1.0 + hit.distance)))
                    .collect();
                results.retain(|r| r.score >= request.min_score);
                results
            }
        }
    }

    async fn search_hybrid(
        &self,
        rewritten: &RewrittenQuery,
        filters: &SearchFilters,
        request: &SearchRequest,
    ) -> Vec<HybridResult> {
        // Step 2: both retrievals run concurrently, each over-fetching so
        // the fusion has enough candidates.
        let fetch = request.limit * self.fetch_multiplier;

        let keyword_future =
            self.keyword_retrieval(rewritten.keywords.clone(), filters.clone(), fetch);
        let vector_future = self.vector.query(&rewritten.semantic_intent, filters, fetch);
        let (keyword_hits, vector_hits) = tokio::join!(keyword_future, vector_future);

        tracing::debug!(
            keyword_hits = keyword_hits.len(),
            vector_hits = vector_hits.len(),
            fetch,
            "hybrid retrieval complete"
        );

        // Step 3: rank-only fusion.
        let keyword_ids: Vec<String> = keyword_hits.iter().map(|h| h.id.clone()).collect();
        let vector_ids: Vec<String> = vector_hits.iter().map(|h| h.doc_id.clone()).collect();
        let rrf_scores = reciprocal_rank_fusion(&keyword_ids, &vector_ids, self.rrf_k);

        let keyword_lookup: HashMap<&str, (usize, &KeywordHit)> = keyword_hits
            .iter()
            .enumerate()
            .map(|(i, hit)| (hit.id.as_str(), (i + 1, hit)))
            .collect();
        let vector_lookup: HashMap<&str, (usize, &VectorHit)> = vector_hits
            .iter()
            .enumerate()
            .map(|(i, hit)| (hit.doc_id.as_str(), (i + 1, hit)))
            .collect();

        // Steps 4-5: priority re-weighting and hydration, preferring the
        // keyword hit's values.
        let mut results = Vec::with_capacity(rrf_scores.len());
        for (doc_id, rrf_score) in rrf_scores {
            let keyword = keyword_lookup.get(doc_id.as_str());
            let vector = vector_lookup.get(doc_id.as_str());

            let mut result = match (keyword, vector) {
                (Some((rank, hit)), _) => {
                    let mut result = keyword_result(hit, *rank, hit.score);
                    if let Some((semantic_rank, vector_hit)) = vector {
                        result.semantic_rank = Some(*semantic_rank);
                        result.semantic_distance = Some(vector_hit.distance);
                    }
                    result
                }
                (None, Some((rank, hit))) => vector_result(hit, *rank, 0.0),
                (None, None) => continue,
            };

            let weight = self
                .registry
                .priority_weight(&result.source_type, &result.source_id);
            result.score = rrf_score * weight;
            result.keyword_score = keyword.map(|(_, hit)| hit.score);
            results.push(result);
        }

        // Step 6: order by weighted fused score and truncate.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.retain(|r| r.score >= request.min_score);
        results.truncate(request.limit);
        results
    }

    /// The keyword adapter is synchronous; run it off the async workers so
    /// the two retrievals genuinely overlap.
    async fn keyword_retrieval(
        &self,
        query: String,
        filters: SearchFilters,
        limit: usize,
    ) -> Vec<KeywordHit> {
        let keyword = Arc::clone(&self.keyword);
        match tokio::task::spawn_blocking(move || keyword.search(&query, &filters, limit)).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "keyword retrieval task failed");
                Vec::new()
            }
        }
    }
}

fn keyword_result(hit: &KeywordHit, rank: usize, score: f32) -> HybridResult {
    HybridResult {
        id: hit.id.clone(),
        file_path: hit.file_path.clone(),
        file_name: hit.file_name.clone(),
        relative_path: hit.relative_path.clone(),
        source_type: hit.source_type.clone(),
        source_id: hit.source_id.clone(),
        repository: hit.repository.clone(),
        score,
        keyword_rank: Some(rank),
        semantic_rank: None,
        keyword_score: Some(hit.score),
        semantic_distance: None,
        snippet: hit.snippet.clone(),
        file_type: hit.file_type.clone(),
    }
}

fn vector_result(hit: &VectorHit, rank: usize, score: f32) -> HybridResult {
    let metadata = &hit.metadata;
    let file_name = std::path::Path::new(&metadata.file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    HybridResult {
        id: hit.doc_id.clone(),
        file_path: metadata.file_path.clone(),
        file_name,
        relative_path: metadata.relative_path.clone(),
        source_type: metadata.source_type.clone(),
        source_id: metadata.source_id.clone(),
        repository: metadata.repository.clone(),
        score,
        keyword_rank: None,
        semantic_rank: Some(rank),
        keyword_score: None,
        semantic_distance: Some(hit.distance),
        snippet: hit.chunk_text.chars().take(VECTOR_SNIPPET_CHARS).collect(),
        file_type: metadata.file_type.clone(),
    }
}
