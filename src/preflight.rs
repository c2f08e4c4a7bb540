//! Pre-flight refinement lane: binds constraints before retrieval starts

use crate::error::LaneError;
use crate::types::{Constraints, Depth, SourceBias, TimeRange};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output of the refinement step. `rewritten_query` is only set when the
/// refiner explicitly replaces the retriever-facing text.
#[derive(Debug, Clone, Default)]
pub struct Refinement {
    pub constraints: Constraints,
    pub rewritten_query: Option<String>,
}

/// Guided prompt refinement capability
#[async_trait]
pub trait QueryRefiner: Send + Sync {
    async fn refine(&self, text: &str, bound: &Constraints) -> Result<Refinement, LaneError>;
}

/// Lexical refiner: reads constraint cues straight off the query text.
/// Cheap enough to always fit the 500 ms budget.
pub struct HeuristicRefiner;

#[async_trait]
impl QueryRefiner for HeuristicRefiner {
    async fn refine(&self, text: &str, bound: &Constraints) -> Result<Refinement, LaneError> {
        let lower = text.to_lowercase();
        let mut constraints = bound.clone();

        if constraints.time_range.is_none() {
            constraints.time_range = if ["latest", "today", "this week", "breaking", "current"]
                .iter()
                .any(|cue| lower.contains(cue))
            {
                Some(TimeRange::Recent)
            } else if lower.contains("history of") || lower.contains("originally") {
                Some(TimeRange::AllTime)
            } else {
                None
            };
        }

        if constraints.sources.is_none() {
            let academic = ["paper", "study", "peer-reviewed", "journal", "arxiv"]
                .iter()
                .any(|cue| lower.contains(cue));
            let news =
                ["news", "announced", "reported", "headline"].iter().any(|cue| lower.contains(cue));
            constraints.sources = match (academic, news) {
                (true, true) => Some(SourceBias::Both),
                (true, false) => Some(SourceBias::Academic),
                (false, true) => Some(SourceBias::News),
                (false, false) => None,
            };
        }

        if constraints.depth.is_none() && lower.split_whitespace().count() > 30 {
            constraints.depth = Some(Depth::Research);
        }

        Ok(Refinement { constraints, rewritten_query: None })
    }
}

/// Run the refiner under its fixed budget. The result is optional: an
/// overrun or failure means the query proceeds unrefined.
pub async fn run_preflight(
    refiner: &dyn QueryRefiner,
    text: &str,
    bound: &Constraints,
    budget_ms: u64,
    cancel: &CancellationToken,
) -> Option<Refinement> {
    let window = Duration::from_millis(budget_ms);
    tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = timeout(window, refiner.refine(text, bound)) => match outcome {
            Ok(Ok(refinement)) => Some(refinement),
            Ok(Err(e)) => {
                debug!("pre-flight refiner failed: {}", e);
                None
            }
            Err(_) => {
                debug!("pre-flight refiner overran its {}ms budget", budget_ms);
                None
            }
        },
    }
}
