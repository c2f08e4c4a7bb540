//! HTTP clients for the embedding and vector-index services

use crate::error::{classify_status, LaneError};
use crate::retrievers::{Embedder, VectorStore};
use crate::types::{Constraints, Document, LaneId, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

/// HTTP embedding service client
pub struct HttpEmbedder {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.into(), client }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LaneError> {
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { texts })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LaneError::new(
                classify_status(status.as_u16()),
                format!("embedder returned {}", status),
            ));
        }
        let parsed: EmbedResponse = response.json().await?;
        expect_vector_count(parsed.vectors, texts.len())
    }
}

/// A batch embedder must answer one vector per text
fn expect_vector_count(
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, LaneError> {
    if vectors.len() != expected {
        return Err(LaneError::empty(format!(
            "embedder returned {} vectors for {} texts",
            vectors.len(),
            expected
        )));
    }
    Ok(vectors)
}

#[derive(Debug, Serialize)]
struct VectorSearchRequest<'a> {
    embedding: &'a [f32],
    k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<TimeRange>,
}

#[derive(Debug, Deserialize)]
struct VectorSearchResponse {
    results: Vec<VectorHit>,
}

#[derive(Debug, Deserialize)]
struct VectorHit {
    url: String,
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    score: f32,
}

impl VectorHit {
    fn into_document(self) -> Document {
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
            published_at: self.published_at,
            author: self.author,
            score: self.score,
            lane_id: LaneId::Vector,
            content_hash: String::new(),
            metadata: HashMap::new(),
        }
    }
}

/// HTTP vector index client
pub struct HttpVectorStore {
    provider: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpVectorStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .build()
            .unwrap_or_default();
        Self { provider: "vector".to_string(), base_url: base_url.into(), client }
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError> {
        let body = VectorSearchRequest { embedding, k, time_range: constraints.time_range };
        let response = self
            .client
            .post(format!("{}/vectors/search", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LaneError::new(
                classify_status(status.as_u16()),
                format!("vector store returned {}", status),
            ));
        }
        let parsed: VectorSearchResponse = response.json().await?;
        Ok(parsed.results.into_iter().map(VectorHit::into_document).collect())
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
    use crate::types::LaneErrorKind;

    fn hit(content: &str, snippet: &str) -> VectorHit {
        VectorHit {
            url: "https://example.org/a".to_string(),
            title: "T".to_string(),
            content: content.to_string(),
            snippet: snippet.to_string(),
            published_at: None,
            author: None,
            score: 0.5,
        }
    }

    #[test]
    fn hit_without_snippet_takes_content_prefix() {
        let doc = hit(&"x".repeat(500), "").into_document();
        assert_eq!(doc.snippet.len(), 240);
        assert_eq!(doc.lane_id, LaneId::Vector);
    }

    #[test]
    fn explicit_snippet_is_kept() {
        let doc = hit("full content", "given snippet").into_document();
        assert_eq!(doc.snippet, "given snippet");
    }

    #[test]
    fn vector_count_mismatch_is_an_empty_error() {
        let err = expect_vector_count(vec![vec![1.0]], 2).unwrap_err();
        assert_eq!(err.kind, LaneErrorKind::Empty);
    }

    #[test]
    fn matching_vector_count_passes_through() {
        let vectors = expect_vector_count(vec![vec![1.0], vec![2.0]], 2).unwrap();
        assert_eq!(vectors.len(), 2);
    }
}
