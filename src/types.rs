//! Core type definitions for the retrieval fusion & citation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Coarse query classification controlling deadline and per-lane budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Simple,
    Technical,
    Research,
    Multimedia,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Simple => "simple",
            Mode::Technical => "technical",
            Mode::Research => "research",
            Mode::Multimedia => "multimedia",
        }
    }

    pub const ALL: [Mode; 4] = [Mode::Simple, Mode::Technical, Mode::Research, Mode::Multimedia];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retrieval path running independently under a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneId {
    Web,
    Vector,
    KnowledgeGraph,
    Keyword,
    News,
    Markets,
    Preflight,
}

impl LaneId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneId::Web => "web",
            LaneId::Vector => "vector",
            LaneId::KnowledgeGraph => "knowledge_graph",
            LaneId::Keyword => "keyword",
            LaneId::News => "news",
            LaneId::Markets => "markets",
            LaneId::Preflight => "preflight",
        }
    }

    /// The six document-producing lanes (preflight excluded)
    pub const RETRIEVAL: [LaneId; 6] = [
        LaneId::Web,
        LaneId::Vector,
        LaneId::KnowledgeGraph,
        LaneId::Keyword,
        LaneId::News,
        LaneId::Markets,
    ];
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication-date filter bound from refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    Recent,
    Last5Years,
    AllTime,
}

/// Source-family bias for lane selection and domain preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBias {
    Academic,
    News,
    Both,
}

/// Caps per-lane token and result budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCeiling {
    Low,
    Medium,
    High,
}

impl CostCeiling {
    pub fn multiplier(&self) -> f64 {
        match self {
            CostCeiling::Low => 0.5,
            CostCeiling::Medium => 1.0,
            CostCeiling::High => 2.0,
        }
    }
}

/// Caps result count per lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Simple,
    Technical,
    Research,
}

impl Depth {
    pub fn result_cap(&self) -> usize {
        match self {
            Depth::Simple => 10,
            Depth::Technical => 20,
            Depth::Research => 50,
        }
    }
}

/// Optional constraint binding, usually produced by the pre-flight refiner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<SourceBias>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_ceiling: Option<CostCeiling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations_required: Option<bool>,
}

impl Constraints {
    pub fn result_cap(&self) -> usize {
        self.depth.map(|d| d.result_cap()).unwrap_or(Depth::Technical.result_cap())
    }

    pub fn cost_multiplier(&self) -> f64 {
        self.cost_ceiling.map(|c| c.multiplier()).unwrap_or(1.0)
    }

    /// Merge refined options into self, keeping already-bound values
    pub fn merge_from(&mut self, other: &Constraints) {
        if self.time_range.is_none() {
            self.time_range = other.time_range;
        }
        if self.sources.is_none() {
            self.sources = other.sources;
        }
        if self.cost_ceiling.is_none() {
            self.cost_ceiling = other.cost_ceiling;
        }
        if self.depth.is_none() {
            self.depth = other.depth;
        }
        if self.citations_required.is_none() {
            self.citations_required = other.citations_required;
        }
    }
}

/// Immutable query accepted by the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub mode: Mode,
    pub constraints: Constraints,
    pub trace_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// Millisecond allocations for a single query
#[derive(Debug, Clone, Serialize)]
pub struct Budget {
    pub global_deadline_ms: u64,
    pub per_lane: HashMap<LaneId, u64>,
    pub synthesis_ms: u64,
    pub reserve_ms: u64,
}

impl Budget {
    pub fn lane_ms(&self, lane: LaneId) -> u64 {
        self.per_lane.get(&lane).copied().unwrap_or(0)
    }
}

/// A retrieved document. Identity is `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub title: String,
    pub content: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub score: f32, // lane-local relevance
    pub lane_id: LaneId,
    pub content_hash: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    /// Fill in derived fields the backend did not provide
    pub fn finalize(&mut self, lane: LaneId) {
        self.lane_id = lane;
        if self.domain.is_empty() {
            self.domain = extract_domain(&self.url);
        }
        if self.content_hash.is_empty() {
            self.content_hash = hash_content(&self.content);
        }
        if self.id.is_empty() {
            self.id = self.content_hash.clone();
        }
    }
}

/// SHA-256 over whitespace-normalized, lowercased content
pub fn hash_content(content: &str) -> String {
    let normalized: String = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Host part of a URL, without scheme, port, or a leading "www."
pub fn extract_domain(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host.strip_prefix("www.").unwrap_or(host).to_lowercase()
}

/// Terminal lane states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Success,
    Timeout,
    Error,
    Disabled,
    Cancelled,
}

/// Structured lane failure kinds; nothing bubbles up raw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneErrorKind {
    NetworkError,
    RateLimited,
    AuthFailed,
    Empty,
    Timeout,
    Cancelled,
}

/// Produced exactly once per lane per query
#[derive(Debug, Clone, Serialize)]
pub struct LaneResult {
    pub lane_id: LaneId,
    pub status: LaneStatus,
    pub documents: Vec<Document>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LaneErrorKind>,
}

impl LaneResult {
    pub fn disabled(lane_id: LaneId) -> Self {
        Self {
            lane_id,
            status: LaneStatus::Disabled,
            documents: Vec::new(),
            latency_ms: 0,
            error: None,
        }
    }
}

/// Per-component score breakdown for a fused document
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ComponentScores {
    pub rrf: f32,
    pub domain_diversity: f32,
    pub recency: f32,
    pub authority: f32,
    pub quality: f32,
}

/// A document after cross-lane fusion
#[derive(Debug, Clone, Serialize)]
pub struct FusedDocument {
    pub document: Document,
    pub rrf_score: f32, // rrf + diversity + recency boosts
    pub component_scores: ComponentScores,
    pub contributing_lanes: BTreeSet<LaneId>,
    pub final_score: f32, // weighted total, set at ranking
}

/// Inline citation: marker ids are 1-indexed by first occurrence
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub marker_id: usize,
    pub document_ref: DocumentRef,
    pub passage: String,
    pub similarity: f32,
    pub confidence: f32,
}

/// Stable reference to a cited document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef {
    pub content_hash: String,
    pub url: String,
    pub domain: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl DocumentRef {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            content_hash: doc.content_hash.clone(),
            url: doc.url.clone(),
            domain: doc.domain.clone(),
            title: doc.title.clone(),
            published_at: doc.published_at,
            author: doc.author.clone(),
        }
    }
}

/// Bibliography entry; order equals first-appearance order
#[derive(Debug, Clone, Serialize)]
pub struct BibliographyEntry {
    pub marker_id: usize,
    pub title: String,
    pub url: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub excerpt: String,
}

/// One sentence of the synthesized answer with its citations
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSentence {
    pub text: String,
    pub citations: Vec<usize>, // marker ids in attachment order
    pub confidence: f32,
    pub no_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Two or more cited passages contradicting on a shared topic
#[derive(Debug, Clone, Serialize)]
pub struct Disagreement {
    pub topic: String,
    pub conflicting_citations: Vec<usize>,
    pub severity: Severity,
}

/// Per-lane outcome retained in the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct LaneAudit {
    pub lane_id: LaneId,
    pub status: LaneStatus,
    pub latency_ms: u64,
    pub documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LaneErrorKind>,
}

/// Durable per-query provenance, retrievable by trace id
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub trace_id: String,
    pub query: String,
    pub mode: Mode,
    pub budget: Budget,
    pub per_lane_results: Vec<LaneAudit>,
    pub fused_doc_ids: Vec<String>,
    pub answer_sentences: Vec<AnswerSentence>,
    pub citations: Vec<Citation>,
    pub bibliography: Vec<BibliographyEntry>,
    pub disagreements: Vec<Disagreement>,
    pub total_latency_ms: u64,
    pub answered_under_sla: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    pub partial: bool,
    pub cancelled: bool,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction_strips_scheme_port_and_www() {
        assert_eq!(extract_domain("https://www.wikipedia.org/wiki/Paris"), "wikipedia.org");
        assert_eq!(extract_domain("http://arxiv.org:8080/abs/1234"), "arxiv.org");
        assert_eq!(extract_domain("reuters.com/markets?id=3"), "reuters.com");
        assert_eq!(extract_domain(""), "");
    }

    #[test]
    fn content_hash_is_whitespace_and_case_insensitive() {
        let a = hash_content("The  capital of France\nis Paris.");
        let b = hash_content("the capital OF france is paris.");
        assert_eq!(a, b);
        assert_ne!(a, hash_content("different text"));
    }

    #[test]
    fn depth_caps_match_modes() {
        assert_eq!(Depth::Simple.result_cap(), 10);
        assert_eq!(Depth::Technical.result_cap(), 20);
        assert_eq!(Depth::Research.result_cap(), 50);
    }
}
