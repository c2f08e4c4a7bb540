//! Final ranking: weighted blend of fused score, authority, and quality

use crate::fusion::compare_fused;
use crate::types::{Document, FusedDocument};
use std::collections::HashMap;

pub const WEIGHT_RRF: f32 = 0.70;
pub const WEIGHT_AUTHORITY: f32 = 0.15;
pub const WEIGHT_QUALITY: f32 = 0.10;
pub const WEIGHT_LENGTH: f32 = 0.05;

/// Bounded [0, 1] per-domain authority scores
#[derive(Debug, Clone)]
pub struct AuthorityTable {
    scores: HashMap<String, f32>,
    default_score: f32,
}

impl AuthorityTable {
    pub fn new(scores: HashMap<String, f32>, default_score: f32) -> Self {
        Self { scores, default_score }
    }

    pub fn score(&self, domain: &str) -> f32 {
        self.scores.get(domain).copied().unwrap_or(self.default_score).clamp(0.0, 1.0)
    }
}

impl Default for AuthorityTable {
    fn default() -> Self {
        let scores = [
            ("wikipedia.org", 0.90),
            ("nature.com", 0.92),
            ("science.org", 0.90),
            ("arxiv.org", 0.85),
            ("acm.org", 0.85),
            ("ieee.org", 0.85),
            ("reuters.com", 0.85),
            ("apnews.com", 0.85),
            ("bbc.com", 0.80),
            ("nytimes.com", 0.78),
            ("github.com", 0.70),
            ("stackoverflow.com", 0.70),
            ("docs.rs", 0.75),
        ]
        .into_iter()
        .map(|(d, s)| (d.to_string(), s))
        .collect();
        Self { scores, default_score: 0.40 }
    }
}

/// Order fused documents by the weighted total and keep the top N.
/// RRF (with its boosts) is normalized by the batch maximum so the 0.70
/// weight is comparable to the bounded authority and quality components.
pub fn rank(mut fused: Vec<FusedDocument>, top_n: usize) -> Vec<FusedDocument> {
    let max_rrf = fused.iter().map(|f| f.rrf_score).fold(f32::MIN, f32::max).max(1e-6);

    for entry in fused.iter_mut() {
        let quality = quality_score(&entry.document);
        entry.component_scores.quality = quality;
        entry.final_score = WEIGHT_RRF * (entry.rrf_score / max_rrf)
            + WEIGHT_AUTHORITY * entry.component_scores.authority
            + WEIGHT_QUALITY * quality
            + WEIGHT_LENGTH * length_score(&entry.document);
    }

    fused.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| compare_fused(a, b))
    });
    fused.truncate(top_n);
    fused
}

/// Readability plus completeness heuristic, bounded [0, 1]
fn quality_score(doc: &Document) -> f32 {
    let words: Vec<&str> = doc.content.split_whitespace().collect();
    let sentences = doc.content.matches(['.', '!', '?']).count().max(1);
    let words_per_sentence = words.len() as f32 / sentences as f32;
    let readability = if (8.0..=30.0).contains(&words_per_sentence) {
        1.0
    } else if words_per_sentence > 0.0 {
        // Taper linearly outside the comfortable band
        let distance = if words_per_sentence < 8.0 {
            8.0 - words_per_sentence
        } else {
            words_per_sentence - 30.0
        };
        (1.0 - distance / 30.0).max(0.0)
    } else {
        0.0
    };

    let mut completeness = 0.0;
    if !doc.title.is_empty() {
        completeness += 0.25;
    }
    if !doc.snippet.is_empty() {
        completeness += 0.25;
    }
    if doc.published_at.is_some() {
        completeness += 0.20;
    }
    if doc.author.is_some() {
        completeness += 0.10;
    }
    if doc.content.len() >= 200 {
        completeness += 0.20;
    }

    (0.5 * readability + 0.5 * completeness).clamp(0.0, 1.0)
}

fn length_score(doc: &Document) -> f32 {
    let snippet = if doc.snippet.is_empty() { 0.0 } else { 0.5 };
    let body = (doc.content.len() as f32 / 2000.0).min(1.0) * 0.5;
    snippet + body
}

/// Cosine similarity; tolerates non-normalized inputs
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::make_document;
    use crate::types::{ComponentScores, LaneId};
    use std::collections::BTreeSet;

    fn fused_doc(url: &str, rrf: f32, authority: f32) -> FusedDocument {
        let mut document = make_document(
            url,
            "A reasonable title",
            "This is a sentence of typical length for a quality check. Another sentence follows it here.",
            "snippet",
            1.0,
        );
        document.finalize(LaneId::Web);
        FusedDocument {
            document,
            rrf_score: rrf,
            component_scores: ComponentScores { rrf, authority, ..Default::default() },
            contributing_lanes: BTreeSet::from([LaneId::Web]),
            final_score: 0.0,
        }
    }

    #[test]
    fn authority_breaks_near_ties() {
        let low = fused_doc("https://unknown.example/1", 0.02, 0.40);
        let high = fused_doc("https://wikipedia.org/1", 0.02, 0.90);
        let ranked = rank(vec![low, high], 10);
        assert_eq!(ranked[0].document.domain, "wikipedia.org");
    }

    #[test]
    fn rank_truncates_to_top_n() {
        let docs: Vec<FusedDocument> = (0..30)
            .map(|i| fused_doc(&format!("https://d{}.org/x", i), 0.05 - i as f32 * 0.001, 0.4))
            .collect();
        assert_eq!(rank(docs, 10).len(), 10);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn quality_rewards_complete_documents() {
        let mut rich = make_document(
            "https://a.org/rich",
            "Title",
            &"Plain sentences with about ten words in each one here. ".repeat(10),
            "snippet",
            1.0,
        );
        rich.published_at = Some(chrono::Utc::now());
        rich.author = Some("Someone".to_string());
        let poor = make_document("https://a.org/poor", "", "tiny", "", 1.0);
        assert!(quality_score(&rich) > quality_score(&poor));
    }
}
