//! Query rewriter backed by a small local LLM.
//!
//! Transforms a natural-language query into clean keywords (for the
//! inverted index), a semantic intent sentence (for the vector index), and
//! structured filters. The rewriter is advisory and never fails the query:
//! any transport error, timeout, or malformed response falls back to the
//! raw query with empty filters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = r#"You are a search optimization engine. Transform the user's natural language request into a structured search schema for a dual-index (keyword + semantic) file search system.

Return ONLY a valid JSON object, no introductory text, no markdown fences:
{
  "keywords": "3-5 space-separated terms for keyword matching",
  "semantic_intent": "a descriptive natural language sentence for vector search",
  "filters": {
    "extensions": ["list", "of", "extensions"],
    "folder_name": "specific_folder_if_mentioned"
  }
}

Rules:
1. keywords: extract 3-5 core nouns, technical terms, or identifiers. Remove conversational fluff ("find", "where", "can you", "please").
2. semantic_intent: expand the query into a full sentence describing the kind of content wanted; expand abbreviations.
3. filters.extensions: file extensions if mentioned (e.g. [".py", ".md"]), else [].
4. filters.folder_name: folder/directory if mentioned, else null.

Example:
Input: "Can you find that cleanup script in my Projects folder?"
Output: {"keywords": "cleanup script Projects", "semantic_intent": "scripts or code related to cleanup operations and maintenance tasks in the Projects directory", "filters": {"extensions": [".py", ".sh"], "folder_name": "Projects"}}

Return ONLY the JSON object."#;

/// Structured filters extracted from the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default, alias = "extension")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenQuery {
    pub keywords: String,
    pub semantic_intent: String,
    pub filters: QueryFilters,
}

impl RewrittenQuery {
    /// Identity fallback: the raw query on both sides, no filters.
    pub fn passthrough(query: &str) -> Self {
        Self {
            keywords: query.to_string(),
            semantic_intent: query.to_string(),
            filters: QueryFilters::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: String,
    temperature: f32,
    max_tokens: u32,
    stop: [&'a str; 2],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RewritePayload {
    keywords: String,
    semantic_intent: String,
    #[serde(default)]
    filters: QueryFilters,
}

pub struct QueryRewriter {
    client: reqwest::Client,
    endpoint: String,
}

impl QueryRewriter {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Rewrite a query within `timeout`. Never errors; the fallback is the
    /// identity rewrite.
    pub async fn rewrite(&self, query: &str, timeout: Duration) -> RewrittenQuery {
        match self.rewrite_inner(query, timeout).await {
            Ok(rewritten) => {
                tracing::debug!(
                    keywords = %rewritten.keywords,
                    semantic = %rewritten.semantic_intent,
                    "query rewritten"
                );
                rewritten
            }
            Err(err) => {
                tracing::warn!(error = %err, "query rewrite failed, using original query");
                RewrittenQuery::passthrough(query)
            }
        }
    }

    async fn rewrite_inner(&self, query: &str, timeout: Duration) -> anyhow::Result<RewrittenQuery> {
        let payload = CompletionRequest {
            prompt: format!("{SYSTEM_PROMPT}\n\nUser query: {query}\n\nJSON output:"),
            temperature: 0.1,
            max_tokens: 300,
            stop: ["\n\n", "User query:"],
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let completion: CompletionResponse = response.json().await?;
        let text = completion
            .choices
            .first()
            .map(|c| c.text.as_str())
            .unwrap_or_default();

        let parsed: RewritePayload = serde_json::from_str(strip_fences(text))?;
        Ok(RewrittenQuery {
            keywords: non_empty_or(parsed.keywords, query),
            semantic_intent: non_empty_or(parsed.semantic_intent, query),
            filters: parsed.filters,
        })
    }

    /// Probe whether the rewrite endpoint is reachable and serving.
    pub async fn check_health(&self) -> bool {
        let payload = CompletionRequest {
            prompt: "test".into(),
            temperature: 0.0,
            max_tokens: 1,
            stop: ["\n\n", "User query:"],
            stream: false,
        };
        matches!(
            self.client
                .post(&self.endpoint)
                .timeout(Duration::from_secs(2))
                .json(&payload)
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

/// Some models wrap the JSON in markdown fences despite instructions.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_falls_back_to_identity() {
        // Nothing listens on this port.
        let rewriter = QueryRewriter::new("http://127.0.0.1:1/v1/completions".into());
        let result = rewriter
            .rewrite("find the cleanup script", Duration::from_millis(300))
            .await;
        assert_eq!(result, RewrittenQuery::passthrough("find the cleanup script"));
        assert!(result.filters.extensions.is_empty());
        assert!(result.filters.folder_name.is_none());
    }

    #[tokio::test]
    async fn health_check_is_false_when_unreachable() {
        let rewriter = QueryRewriter::new("http://127.0.0.1:1/v1/completions".into());
        assert!(!rewriter.check_health().await);
    }

    #[test]
    fn payload_parsing_accepts_legacy_extension_key() {
        let parsed: RewritePayload = serde_json::from_str(
            r#"{"keywords": "database migrations", "semantic_intent": "code about schema migrations", "filters": {"extension": [".py"], "folder_name": null}}"#,
        )
        .unwrap();
        assert_eq!(parsed.filters.extensions, [".py"]);
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
    }
}
