//! Quorum - Retrieval Fusion & Citation Pipeline
//!
//! Multi-source knowledge retrieval and synthesis under a strict deadline:
//! - Parallel lane fan-out with per-lane budgets and partial-result semantics
//! - Reciprocal rank fusion with domain-diversity and recency boosts
//! - Content-hash and fuzzy-title deduplication
//! - Sentence-to-passage citation alignment with disagreement detection
//! - Streaming delivery with heartbeats, trace propagation, and audit trail

pub mod audit;
pub mod budget;
pub mod citation;
pub mod classify;
pub mod config;
pub mod error;
pub mod fusion;
pub mod graph_client;
pub mod http_retriever;
pub mod lane;
pub mod llm_client;
pub mod metrics;
pub mod orchestrator;
pub mod preflight;
pub mod ranking;
pub mod ratelimit;
pub mod retrievers;
pub mod server;
pub mod stream;
pub mod types;
pub mod vector_client;

pub use audit::{AuditSink, MemoryAuditStore};
pub use citation::{align_answer, AlignedAnswer, CitationConfig, EmbedCache};
pub use classify::classify;
pub use config::EngineConfig;
pub use error::{LaneError, PipelineError};
pub use fusion::{fuse, FusionConfig};
pub use graph_client::HttpGraphStore;
pub use http_retriever::{HttpRetriever, QueryStyle};
pub use lane::{GraphLane, Lane, RetrieverLane, VectorLane};
pub use llm_client::HttpSynthesizer;
pub use metrics::Metrics;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SearchSubmission, SharedOrchestrator};
pub use preflight::{HeuristicRefiner, QueryRefiner, Refinement};
pub use ranking::{rank, AuthorityTable};
pub use ratelimit::RateLimiter;
pub use retrievers::{
    Embedder, GraphStore, MockEmbedder, MockGraphStore, MockRetriever, MockSynthesizer,
    MockVectorStore, Retriever, Synthesizer, VectorStore,
};
pub use stream::{EventKind, EventSender, EventStream, StreamEvent};
pub use types::*;
pub use vector_client::{HttpEmbedder, HttpVectorStore};
