//! Narrow interfaces to external collaborators.
//!
//! The runtime consumes retrieval, entity cards, and result summarization
//! through these traits; the stores themselves (vector DBs, card databases)
//! live outside this crate. No-op implementations keep managers runnable
//! without any of them wired up.

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::ToolResult;

/// One hit from the retrieval store.
#[derive(Debug, Clone)]
pub struct RagHit {
    pub document: String,
    pub source: String,
    pub scope: String,
    pub similarity: f64,
    pub timestamp: Option<String>,
}

/// Semantic retrieval store.
#[async_trait]
pub trait RagStore: Send + Sync {
    async fn query(
        &self,
        text: &str,
        scopes: &[String],
        top_k: usize,
        threshold: f64,
    ) -> Vec<RagHit>;
}

/// Entity detection + card lookup. No cycles back into agents.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Canonical entity names detected in free text.
    async fn detect_entities(&self, text: &str) -> Vec<String>;

    /// One field of an entity card; empty string when absent.
    async fn entity_field(&self, name: &str, field: &str) -> String;
}

/// Compacts a full tool result into the small structured form stored on the
/// `tool_result` message.
pub trait ResultSummarizer: Send + Sync {
    fn summarize(&self, result: &ToolResult) -> Value;
}

/// Default collaborators: no retrieval, no entities, identity-ish summary.
pub struct NoopRag;

#[async_trait]
impl RagStore for NoopRag {
    async fn query(&self, _text: &str, _scopes: &[String], _top_k: usize, _threshold: f64) -> Vec<RagHit> {
        Vec::new()
    }
}

pub struct NoopEntities;

#[async_trait]
impl EntityStore for NoopEntities {
    async fn detect_entities(&self, _text: &str) -> Vec<String> {
        Vec::new()
    }

    async fn entity_field(&self, _name: &str, _field: &str) -> String {
        String::new()
    }
}

/// Keeps the result's content and type; truncates content to a sane cap so
/// summaries never balloon history.
pub struct PassthroughSummarizer {
    pub max_chars: usize,
}

impl Default for PassthroughSummarizer {
    fn default() -> Self {
        Self { max_chars: 2_000 }
    }
}

impl ResultSummarizer for PassthroughSummarizer {
    fn summarize(&self, result: &ToolResult) -> Value {
        let mut content: String = result.content.chars().take(self.max_chars).collect();
        if content.len() < result.content.len() {
            content.push_str("...[truncated]");
        }
        serde_json::json!({
            "tool_result": content,
            "result_type": result.result_type.as_str(),
        })
    }
}

/// Formats RAG hits the way prompt contexts expect them.
pub fn format_rag_hits(hits: &[RagHit]) -> Option<String> {
    if hits.is_empty() {
        return None;
    }
    let mut lines = vec!["### Semantic Retrieved Documents:".to_string()];
    for hit in hits {
        lines.push(format!(
            "- {} (source: {}, similarity: {:.2})",
            hit.document, hit.source, hit.similarity
        ));
    }
    Some(lines.join("\n"))
}
