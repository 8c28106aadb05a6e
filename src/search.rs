//! Semantic search collaborator
//!
//! The document index lives behind an HTTP service. The retrieval worker
//! only depends on the [`SemanticSearch`] trait.

use crate::error::OrchestrationError;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub snippet: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Map<String, Value>>,
    pub k: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            filters: None,
            k,
        }
    }
}

#[async_trait::async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Ranked hits, best first. Errors mean the backend is unavailable.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

/// HTTP client for the search service (`POST {base}/search`)
#[derive(Clone)]
pub struct HttpSemanticSearch {
    client: Client,
    base_url: String,
}

impl HttpSemanticSearch {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::SearchError(format!("Search request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::SearchError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::SearchError(format!(
                "Search service returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

#[async_trait::async_trait]
impl SemanticSearch for HttpSemanticSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        debug!(query = %query.query, k = query.k, "Semantic search");

        let body = self.post_json("/search", query).await?;
        let parsed: SearchResponse = serde_json::from_value(body)?;

        info!(hits = parsed.hits.len(), "Semantic search completed");
        Ok(parsed.hits.into_iter().take(query.k).collect())
    }
}

/// Fixed-result search for tests and offline runs
#[derive(Debug, Clone)]
pub struct StaticSearch {
    hits: Option<Vec<SearchHit>>,
}

impl StaticSearch {
    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self { hits: Some(hits) }
    }

    pub fn empty() -> Self {
        Self::with_hits(Vec::new())
    }

    /// Every call fails as if the backend were down
    pub fn unavailable() -> Self {
        Self { hits: None }
    }
}

#[async_trait::async_trait]
impl SemanticSearch for StaticSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        match &self.hits {
            Some(hits) => Ok(hits.iter().take(query.k).cloned().collect()),
            None => Err(OrchestrationError::SearchError(
                "search backend unavailable".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_tolerates_missing_fields() {
        let raw = serde_json::json!({
            "hits": [
                { "snippet": "WACC is the weighted average cost of capital", "source": "reading_20.pdf" },
                { "snippet": "Second", "metadata": { "cfa_level": "II" } }
            ]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.hits.len(), 2);
        assert_eq!(parsed.hits[1].metadata["cfa_level"], "II");
        assert!(parsed.hits[1].source.is_none());
    }

    #[tokio::test]
    async fn test_static_search_respects_k() {
        let hit = SearchHit {
            snippet: "x".to_string(),
            source: None,
            score: None,
            metadata: Map::new(),
        };
        let search = StaticSearch::with_hits(vec![hit.clone(), hit.clone(), hit]);
        let hits = search.search(&SearchQuery::new("wacc", 2)).await.unwrap();
        assert_eq!(hits.len(), 2);

        assert!(StaticSearch::unavailable()
            .search(&SearchQuery::new("wacc", 2))
            .await
            .is_err());
    }
}
