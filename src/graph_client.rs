//! HTTP client for knowledge-graph expansion

use crate::error::{classify_status, LaneError};
use crate::retrievers::GraphStore;
use crate::types::{Document, LaneId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct ExpandRequest<'a> {
    entities: &'a [String],
    depth: usize,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct ExpandResponse {
    results: Vec<GraphHit>,
}

#[derive(Debug, Deserialize)]
struct GraphHit {
    url: String,
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    score: f32,
    /// Entity names on the traversal path to this document
    #[serde(default)]
    path: Vec<String>,
}

impl GraphHit {
    fn into_document(self) -> Document {
        let mut metadata = HashMap::new();
        if !self.path.is_empty() {
            metadata.insert("graph_path".to_string(), self.path.join(" -> "));
        }
        let snippet = if self.snippet.is_empty() {
            self.content.chars().take(240).collect()
        } else {
            self.snippet
        };
        Document {
            id: String::new(),
            url: self.url,
            domain: String::new(),
            title: self.title,
            content: self.content,
            snippet,
            published_at: None,
            author: None,
            score: self.score,
            lane_id: LaneId::KnowledgeGraph,
            content_hash: String::new(),
            metadata,
        }
    }
}

/// HTTP knowledge-graph client. The store owns traversal state; this
/// client only caps depth and fan-out.
pub struct HttpGraphStore {
    provider: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpGraphStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .build()
            .unwrap_or_default();
        Self { provider: "knowledge_graph".to_string(), base_url: base_url.into(), client }
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn expand(
        &self,
        entities: &[String],
        depth: usize,
        k: usize,
    ) -> Result<Vec<Document>, LaneError> {
        let body = ExpandRequest { entities, depth, k };
        let response = self
            .client
            .post(format!("{}/graph/expand", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LaneError::new(
                classify_status(status.as_u16()),
                format!("graph store returned {}", status),
            ));
        }
        let parsed: ExpandResponse = response.json().await?;
        Ok(parsed.results.into_iter().map(GraphHit::into_document).collect())
    }

    async fn healthy(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content: &str, snippet: &str, path: Vec<&str>) -> GraphHit {
        GraphHit {
            url: "https://example.org/node".to_string(),
            title: "Node".to_string(),
            content: content.to_string(),
            snippet: snippet.to_string(),
            score: 0.5,
            path: path.into_iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn hit_without_snippet_takes_content_prefix() {
        let doc = hit(&"x".repeat(500), "", vec![]).into_document();
        assert_eq!(doc.snippet.len(), 240);
        assert_eq!(doc.lane_id, LaneId::KnowledgeGraph);
    }

    #[test]
    fn traversal_path_is_recorded_as_metadata() {
        let doc = hit("content", "snippet", vec!["France", "Paris", "Seine"]).into_document();
        assert_eq!(doc.metadata.get("graph_path").unwrap(), "France -> Paris -> Seine");
    }

    #[test]
    fn empty_path_leaves_metadata_out() {
        let doc = hit("content", "snippet", vec![]).into_document();
        assert!(doc.metadata.is_empty());
    }
}
