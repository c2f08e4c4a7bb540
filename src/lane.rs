//! Lane framework: uniform execution of retrieval paths under a budget

use crate::error::LaneError;
use crate::ratelimit::RateLimiter;
use crate::retrievers::{Embedder, GraphStore, Retriever, VectorStore};
use crate::types::{Document, LaneErrorKind, LaneId, LaneResult, LaneStatus, Query};
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retries inside a lane; the orchestrator never retries
const MAX_RETRIES: usize = 2;
const BACKOFF_BASE_MS: u64 = 50;

/// Documents a lane has produced before its deadline fired.
/// Multi-step lanes push batches here so timeouts keep what arrived.
#[derive(Default)]
pub struct PartialSink {
    documents: Mutex<Vec<Document>>,
}

impl PartialSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, docs: Vec<Document>) {
        self.documents.lock().expect("partial sink poisoned").extend(docs);
    }

    pub fn drain(&self) -> Vec<Document> {
        std::mem::take(&mut *self.documents.lock().expect("partial sink poisoned"))
    }
}

/// A single-purpose retrieval path. Implementations do one backend round
/// trip (or a few) and must tolerate being dropped at any await point.
#[async_trait]
pub trait Lane: Send + Sync {
    fn id(&self) -> LaneId;

    /// Rate-limit key for the backing provider
    fn provider(&self) -> &str;

    async fn fetch(
        &self,
        query: &Query,
        k: usize,
        partials: &PartialSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, LaneError>;
}

/// Lane over a plain search retriever (web, news, markets, keyword)
pub struct RetrieverLane {
    id: LaneId,
    retriever: Arc<dyn Retriever>,
}

impl RetrieverLane {
    pub fn new(id: LaneId, retriever: Arc<dyn Retriever>) -> Self {
        Self { id, retriever }
    }
}

#[async_trait]
impl Lane for RetrieverLane {
    fn id(&self) -> LaneId {
        self.id
    }

    fn provider(&self) -> &str {
        self.retriever.provider()
    }

    async fn fetch(
        &self,
        query: &Query,
        k: usize,
        _partials: &PartialSink,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Document>, LaneError> {
        self.retriever.search(&query.text, k, &query.constraints).await
    }
}

/// Lane that embeds the query then searches the dense index
pub struct VectorLane {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl VectorLane {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }
}

#[async_trait]
impl Lane for VectorLane {
    fn id(&self) -> LaneId {
        LaneId::Vector
    }

    fn provider(&self) -> &str {
        self.store.provider()
    }

    async fn fetch(
        &self,
        query: &Query,
        k: usize,
        _partials: &PartialSink,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Document>, LaneError> {
        let vectors = self.embedder.embed(std::slice::from_ref(&query.text)).await?;
        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| LaneError::empty("embedder returned no vector"))?;
        self.store.search(&embedding, k, &query.constraints).await
    }
}

/// Lane that expands query entities through the knowledge graph
pub struct GraphLane {
    store: Arc<dyn GraphStore>,
    depth: usize,
}

impl GraphLane {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store, depth: 2 }
    }
}

#[async_trait]
impl Lane for GraphLane {
    fn id(&self) -> LaneId {
        LaneId::KnowledgeGraph
    }

    fn provider(&self) -> &str {
        self.store.provider()
    }

    async fn fetch(
        &self,
        query: &Query,
        k: usize,
        _partials: &PartialSink,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Document>, LaneError> {
        let entities = extract_entities(&query.text);
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        self.store.expand(&entities, self.depth, k).await
    }
}

/// Quoted phrases and capitalized tokens, in reading order, capped at 8
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();

    let mut rest = text;
    while let Some(start) = rest.find('"') {
        let tail = &rest[start + 1..];
        match tail.find('"') {
            Some(end) => {
                let phrase = tail[..end].trim();
                if !phrase.is_empty() {
                    entities.push(phrase.to_string());
                }
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }

    for word in text.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric() || *c == '-').collect();
        if cleaned.len() > 2 && cleaned.chars().next().is_some_and(|c| c.is_uppercase()) {
            entities.push(cleaned);
        }
    }

    entities.dedup();
    entities.truncate(8);
    entities
}

/// Run one lane under its budget: rate limit, bounded retries with jittered
/// backoff, hard deadline, cooperative cancellation, result cap. Produces
/// exactly one `LaneResult`.
pub async fn run_lane(
    lane: Arc<dyn Lane>,
    query: Arc<Query>,
    budget_ms: u64,
    result_cap: usize,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> LaneResult {
    let lane_id = lane.id();
    let started = Instant::now();
    let deadline = started + Duration::from_millis(budget_ms);
    let partials = PartialSink::new();
    let mut last_error: Option<LaneError> = None;

    for attempt in 0..=MAX_RETRIES {
        if cancel.is_cancelled() {
            return finish(lane_id, LaneStatus::Cancelled, partials.drain(), started, Some(LaneErrorKind::Cancelled), result_cap);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return finish(lane_id, LaneStatus::Timeout, partials.drain(), started, Some(LaneErrorKind::Timeout), result_cap);
        }

        if !limiter.reserve(lane.provider(), 1.0) {
            last_error = Some(LaneError::new(LaneErrorKind::RateLimited, "provider bucket empty"));
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return finish(lane_id, LaneStatus::Cancelled, partials.drain(), started, Some(LaneErrorKind::Cancelled), result_cap);
                }
                outcome = timeout(remaining, lane.fetch(&query, result_cap, &partials, &cancel)) => {
                    match outcome {
                        Err(_) => {
                            let kept = partials.drain();
                            debug!(lane = %lane_id, kept = kept.len(), "lane deadline fired");
                            return finish(lane_id, LaneStatus::Timeout, kept, started, Some(LaneErrorKind::Timeout), result_cap);
                        }
                        Ok(Ok(docs)) => {
                            return finish(lane_id, LaneStatus::Success, docs, started, None, result_cap);
                        }
                        Ok(Err(err)) => {
                            warn!(lane = %lane_id, attempt, "lane attempt failed: {}", err);
                            let retryable = err.retryable();
                            last_error = Some(err);
                            if !retryable {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if attempt == MAX_RETRIES {
            break;
        }
        let backoff = backoff_with_jitter(attempt);
        if deadline.saturating_duration_since(Instant::now()) <= backoff {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return finish(lane_id, LaneStatus::Cancelled, partials.drain(), started, Some(LaneErrorKind::Cancelled), result_cap);
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    let kind = last_error.as_ref().map(|e| e.kind);
    let status = match kind {
        Some(LaneErrorKind::Timeout) => LaneStatus::Timeout,
        _ => LaneStatus::Error,
    };
    finish(lane_id, status, partials.drain(), started, kind, result_cap)
}

fn backoff_with_jitter(attempt: usize) -> Duration {
    let base = BACKOFF_BASE_MS << attempt;
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_BASE_MS / 2);
    Duration::from_millis(base + jitter)
}

fn finish(
    lane_id: LaneId,
    status: LaneStatus,
    mut documents: Vec<Document>,
    started: Instant,
    error: Option<LaneErrorKind>,
    result_cap: usize,
) -> LaneResult {
    for doc in documents.iter_mut() {
        doc.finalize(lane_id);
    }
    documents.truncate(result_cap);
    LaneResult {
        lane_id,
        status,
        documents,
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::{make_document, MockRetriever};
    use crate::types::{Constraints, Mode};
    use chrono::Utc;
    use uuid::Uuid;

    fn test_query() -> Arc<Query> {
        Arc::new(Query {
            id: Uuid::new_v4(),
            text: "capital of France".to_string(),
            mode: Mode::Simple,
            constraints: Constraints::default(),
            trace_id: "t-lane".to_string(),
            submitted_at: Utc::now(),
        })
    }

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                make_document(
                    &format!("https://example.org/{}", i),
                    &format!("Doc {}", i),
                    &format!("content {}", i),
                    "snippet",
                    1.0,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_lane_caps_and_stamps_documents() {
        let lane = Arc::new(RetrieverLane::new(
            LaneId::Web,
            Arc::new(MockRetriever::new("web", docs(30))),
        ));
        let result = run_lane(
            lane,
            test_query(),
            1000,
            10,
            Arc::new(RateLimiter::default()),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.status, LaneStatus::Success);
        assert_eq!(result.documents.len(), 10);
        for doc in &result.documents {
            assert_eq!(doc.lane_id, LaneId::Web);
            assert_eq!(doc.domain, "example.org");
            assert!(!doc.content_hash.is_empty());
        }
    }

    #[tokio::test]
    async fn slow_lane_times_out_within_grace() {
        let lane = Arc::new(RetrieverLane::new(
            LaneId::Vector,
            Arc::new(MockRetriever::new("vec", docs(3)).with_delay(Duration::from_millis(500))),
        ));
        let started = Instant::now();
        let result = run_lane(
            lane,
            test_query(),
            100,
            10,
            Arc::new(RateLimiter::default()),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.status, LaneStatus::Timeout);
        assert_eq!(result.error, Some(LaneErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_millis(150), "timeout must be prompt");
        assert!(result.latency_ms <= 150);
    }

    #[tokio::test]
    async fn timeout_retains_partial_documents() {
        struct TwoPhaseLane;

        #[async_trait]
        impl Lane for TwoPhaseLane {
            fn id(&self) -> LaneId {
                LaneId::Web
            }
            fn provider(&self) -> &str {
                "two_phase"
            }
            async fn fetch(
                &self,
                _query: &Query,
                _k: usize,
                partials: &PartialSink,
                _cancel: &CancellationToken,
            ) -> Result<Vec<Document>, LaneError> {
                partials.push(vec![make_document("https://a.org/1", "early", "early page", "s", 1.0)]);
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Vec::new())
            }
        }

        let result = run_lane(
            Arc::new(TwoPhaseLane),
            test_query(),
            80,
            10,
            Arc::new(RateLimiter::default()),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.status, LaneStatus::Timeout);
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.documents[0].title, "early");
    }

    #[tokio::test]
    async fn cancellation_is_observed_quickly() {
        let lane = Arc::new(RetrieverLane::new(
            LaneId::Web,
            Arc::new(MockRetriever::new("web", docs(1)).with_delay(Duration::from_secs(5))),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_lane(
            lane,
            test_query(),
            5000,
            10,
            Arc::new(RateLimiter::default()),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result.status, LaneStatus::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn auth_failure_does_not_retry() {
        let lane = Arc::new(RetrieverLane::new(
            LaneId::News,
            Arc::new(MockRetriever::new("news", docs(1)).with_failure(LaneErrorKind::AuthFailed)),
        ));
        let started = Instant::now();
        let result = run_lane(
            lane,
            test_query(),
            2000,
            10,
            Arc::new(RateLimiter::default()),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.status, LaneStatus::Error);
        assert_eq!(result.error, Some(LaneErrorKind::AuthFailed));
        // No backoff sleeps for a non-retryable failure
        assert!(started.elapsed() < Duration::from_millis(60));
    }

    #[test]
    fn entity_extraction_prefers_quotes_and_capitals() {
        let entities = extract_entities("compare \"B-tree indexes\" with LSM trees in Postgres");
        assert_eq!(entities[0], "B-tree indexes");
        assert!(entities.contains(&"LSM".to_string()));
        assert!(entities.contains(&"Postgres".to_string()));
    }
}
