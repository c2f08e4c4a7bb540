//! HTTP search-service client used by the web, news, markets, and keyword lanes

use crate::error::{classify_status, LaneError};
use crate::retrievers::Retriever;
use crate::types::{Constraints, Document, LaneId, SourceBias, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Request to a JSON search service
#[derive(Debug, Serialize)]
struct SearchRequest {
    query: String,
    k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<SourceBias>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
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
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl SearchHit {
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
            lane_id: LaneId::Web,
            content_hash: String::new(),
            metadata: self.metadata,
        }
    }
}

/// How the provider exposes its search endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStyle {
    /// POST /search with a JSON body
    PostJson,
    /// GET /search?q=...&k=... (typical for keyword indexes)
    GetQuery,
}

/// HTTP-backed retriever for any of the flat search lanes
pub struct HttpRetriever {
    provider: String,
    base_url: String,
    style: QueryStyle,
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>, style: QueryStyle) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(1000))
            .build()
            .unwrap_or_default();
        Self { provider: provider.into(), base_url: base_url.into(), style, client }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError> {
        let response = match self.style {
            QueryStyle::PostJson => {
                let body = SearchRequest {
                    query: query.to_string(),
                    k,
                    time_range: constraints.time_range,
                    sources: constraints.sources,
                };
                self.client
                    .post(format!("{}/search", self.base_url))
                    .json(&body)
                    .send()
                    .await?
            }
            QueryStyle::GetQuery => {
                let url = format!(
                    "{}/search?q={}&k={}",
                    self.base_url,
                    urlencoding::encode(query),
                    k
                );
                self.client.get(url).send().await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LaneError::new(
                classify_status(status.as_u16()),
                format!("{} returned {}: {}", self.provider, status, detail),
            ));
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.results.into_iter().map(SearchHit::into_document).collect())
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

    #[test]
    fn hit_without_snippet_takes_content_prefix() {
        let hit = SearchHit {
            url: "https://example.org/a".to_string(),
            title: "T".to_string(),
            content: "x".repeat(500),
            snippet: String::new(),
            published_at: None,
            author: None,
            score: 0.5,
            metadata: HashMap::new(),
        };
        let doc = hit.into_document();
        assert_eq!(doc.snippet.len(), 240);
    }
}
