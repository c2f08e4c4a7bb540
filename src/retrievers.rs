//! Pluggable backend capabilities and their in-process mock implementations

use crate::error::LaneError;
use crate::types::{Constraints, Document, LaneErrorKind, LaneId};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// Token stream returned by a synthesizer; dropped to cancel mid-generation
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LaneError>> + Send>>;

/// Web / news / markets / keyword search capability
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Rate-limit key, one bucket per provider
    fn provider(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        k: usize,
        constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Text-to-vector capability; may batch
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LaneError>;
}

/// Dense index search over embeddings
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn provider(&self) -> &str;

    async fn search(
        &self,
        embedding: &[f32],
        k: usize,
        constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Knowledge-graph neighborhood expansion
#[async_trait]
pub trait GraphStore: Send + Sync {
    fn provider(&self) -> &str;

    async fn expand(
        &self,
        entities: &[String],
        depth: usize,
        k: usize,
    ) -> Result<Vec<Document>, LaneError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Streaming LLM synthesis capability
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn provider(&self) -> &str;

    async fn generate(&self, prompt: &str, budget_ms: u64) -> Result<TokenStream, LaneError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Build a document from the fields a backend typically returns
pub fn make_document(url: &str, title: &str, content: &str, snippet: &str, score: f32) -> Document {
    Document {
        id: String::new(),
        url: url.to_string(),
        domain: String::new(),
        title: title.to_string(),
        content: content.to_string(),
        snippet: snippet.to_string(),
        published_at: None,
        author: None,
        score,
        lane_id: LaneId::Web,
        content_hash: String::new(),
        metadata: HashMap::new(),
    }
}

/// Canned retriever for tests and mock mode
pub struct MockRetriever {
    provider: String,
    documents: Vec<Document>,
    delay: Duration,
    fail: Option<LaneErrorKind>,
}

impl MockRetriever {
    pub fn new(provider: impl Into<String>, documents: Vec<Document>) -> Self {
        Self { provider: provider.into(), documents, delay: Duration::ZERO, fail: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure(mut self, kind: LaneErrorKind) -> Self {
        self.fail = Some(kind);
        self
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(
        &self,
        _query: &str,
        k: usize,
        _constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(kind) = self.fail {
            return Err(LaneError::new(kind, format!("mock {} failure", self.provider)));
        }
        Ok(self.documents.iter().take(k).cloned().collect())
    }

    async fn healthy(&self) -> bool {
        self.fail.is_none()
    }
}

/// Deterministic embedder: hashes tokens into a small dense vector.
/// Good enough for cosine alignment in tests and mock mode.
pub struct MockEmbedder {
    dims: usize,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }
            let mut h: u64 = 1469598103934665603;
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LaneError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Canned vector store; ignores the query embedding
pub struct MockVectorStore {
    provider: String,
    documents: Vec<Document>,
    delay: Duration,
    fail: Option<LaneErrorKind>,
}

impl MockVectorStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { provider: "mock_vector".to_string(), documents, delay: Duration::ZERO, fail: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure(mut self, kind: LaneErrorKind) -> Self {
        self.fail = Some(kind);
        self
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(
        &self,
        _embedding: &[f32],
        k: usize,
        _constraints: &Constraints,
    ) -> Result<Vec<Document>, LaneError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(kind) = self.fail {
            return Err(LaneError::new(kind, "mock vector failure"));
        }
        Ok(self.documents.iter().take(k).cloned().collect())
    }

    async fn healthy(&self) -> bool {
        self.fail.is_none()
    }
}

/// Canned graph store keyed by entity name
pub struct MockGraphStore {
    provider: String,
    by_entity: HashMap<String, Vec<Document>>,
}

impl MockGraphStore {
    pub fn new(by_entity: HashMap<String, Vec<Document>>) -> Self {
        Self { provider: "mock_graph".to_string(), by_entity }
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn expand(
        &self,
        entities: &[String],
        _depth: usize,
        k: usize,
    ) -> Result<Vec<Document>, LaneError> {
        let mut out = Vec::new();
        for entity in entities {
            if let Some(docs) = self.by_entity.get(&entity.to_lowercase()) {
                out.extend(docs.iter().cloned());
            }
        }
        out.truncate(k);
        Ok(out)
    }
}

/// Streams a fixed text word by word
pub struct MockSynthesizer {
    provider: String,
    text: String,
    token_delay: Duration,
    fail: bool,
}

impl MockSynthesizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            provider: "mock_llm".to_string(),
            text: text.into(),
            token_delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            provider: "mock_llm".to_string(),
            text: String::new(),
            token_delay: Duration::ZERO,
            fail: true,
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, _prompt: &str, _budget_ms: u64) -> Result<TokenStream, LaneError> {
        if self.fail {
            return Err(LaneError::new(LaneErrorKind::NetworkError, "mock synthesizer down"));
        }
        let words: Vec<String> =
            self.text.split_inclusive(' ').map(|w| w.to_string()).collect();
        let delay = self.token_delay;
        let stream = futures::stream::unfold(words.into_iter(), move |mut it| async move {
            match it.next() {
                Some(word) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Some((Ok(word), it))
                }
                None => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn healthy(&self) -> bool {
        !self.fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_retriever_caps_at_k() {
        let docs = (0..5)
            .map(|i| make_document(&format!("https://a.org/{}", i), "t", "c", "s", 1.0))
            .collect();
        let retriever = MockRetriever::new("web", docs);
        let out = retriever.search("q", 3, &Constraints::default()).await.unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn mock_embedder_is_deterministic_and_normalized() {
        let embedder = MockEmbedder::default();
        let vecs = embedder
            .embed(&["hello world".to_string(), "hello world".to_string()])
            .await
            .unwrap();
        assert_eq!(vecs[0], vecs[1]);
        let norm: f32 = vecs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn mock_synthesizer_streams_words() {
        let synth = MockSynthesizer::new("one two three");
        let mut stream = synth.generate("prompt", 1000).await.unwrap();
        let mut out = String::new();
        while let Some(tok) = stream.next().await {
            out.push_str(&tok.unwrap());
        }
        assert_eq!(out, "one two three");
    }
}
