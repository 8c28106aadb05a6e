//! Documentation retrieval worker (terminal)

use super::guardrails::check_query;
use super::{Worker, WorkerOutput, WorkerRequest};
use crate::error::OrchestrationError;
use crate::models::{Message, MessageRole, OutcomeKind, WorkerId, WorkerSpec};
use crate::search::{SearchHit, SearchQuery, SemanticSearch};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_TOP_K: usize = 3;

/// Label prefixed to the answer when the search backend is down
pub const UNAVAILABLE_LABEL: &str = "[documentation unavailable]";

pub struct RetrievalWorker {
    spec: WorkerSpec,
    search: Arc<dyn SemanticSearch>,
    top_k: usize,
}

impl RetrievalWorker {
    pub fn new(search: Arc<dyn SemanticSearch>) -> Self {
        Self {
            spec: WorkerSpec {
                id: WorkerId::Retrieval,
                description: "Answers conceptual and theory questions from the indexed financial documentation".to_string(),
                tools: Vec::new(),
                terminal: true,
            },
            search,
            top_k: DEFAULT_TOP_K,
        }
    }

    fn reply(&self, text: String, signal: OutcomeKind) -> WorkerOutput {
        WorkerOutput::answer(Message::worker(WorkerId::Retrieval, text), signal)
    }
}

fn format_hits(hits: &[SearchHit]) -> String {
    let fragments: Vec<String> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let source = hit
                .source
                .as_deref()
                .map(|s| {
                    Path::new(s)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| s.to_string())
                })
                .unwrap_or_else(|| "unknown".to_string());

            let level = hit
                .metadata
                .get("cfa_level")
                .and_then(|v| v.as_str())
                .unwrap_or("n/a");

            format!(
                "--- Fragment {} ---\nSource: {}\nLevel: {}\n{}",
                i + 1,
                source,
                level,
                hit.snippet.trim()
            )
        })
        .collect();

    format!(
        "Relevant passages from the documentation:\n\n{}",
        fragments.join("\n\n")
    )
}

#[async_trait::async_trait]
impl Worker for RetrievalWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let query = request
            .history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if let Some(refusal) = check_query(&query) {
            return Ok(self.reply(refusal.message().to_string(), OutcomeKind::Unknown));
        }

        let search_query = SearchQuery::new(query.clone(), self.top_k);
        let result = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            result = self.search.search(&search_query) => result,
        };

        match result {
            Ok(hits) if hits.is_empty() => {
                warn!(%query, "No documentation matched");
                Ok(self.reply(
                    "I found no relevant information in the indexed documentation. The topic may \
                     not be covered or the question may need rephrasing; for calculations, ask \
                     the corresponding specialist directly."
                        .to_string(),
                    OutcomeKind::Unknown,
                ))
            }
            Ok(hits) => {
                info!(session_id = %request.session_id, hits = hits.len(), "Retrieval answered");
                Ok(self.reply(format_hits(&hits), OutcomeKind::Success))
            }
            Err(e) => {
                warn!(error = %e, "Search backend unavailable, returning fallback");
                Ok(self.reply(
                    format!(
                        "{} The documentation search is temporarily unavailable ({}). \
                         Calculations are still available: NPV, WACC, bond value, CAPM, \
                         Sharpe ratio, Gordon growth and call options.",
                        UNAVAILABLE_LABEL, e
                    ),
                    OutcomeKind::BlockingError,
                ))
            }
        }
    }
}
