//! Reciprocal rank fusion and cross-lane deduplication

use crate::config::EngineConfig;
use crate::ranking::AuthorityTable;
use crate::types::{ComponentScores, Document, FusedDocument, LaneId, LaneResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Jaccard threshold for same-domain fuzzy-title duplicates
const TITLE_JACCARD_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub k: f32,
    pub domain_boost: f32,
    pub recency_boost: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { k: 60.0, domain_boost: 0.10, recency_boost: 0.05 }
    }
}

impl FusionConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            k: config.rrf_k,
            domain_boost: config.domain_boost,
            recency_boost: config.recency_boost,
        }
    }
}

struct Accum {
    document: Document,
    rrf: f32,
    lanes: BTreeSet<LaneId>,
}

impl Accum {
    /// Deterministically keep the richer representative when merging
    fn absorb(&mut self, other: Accum) {
        self.rrf += other.rrf;
        self.lanes.extend(other.lanes);
        let richer = match (self.document.published_at, other.document.published_at) {
            (None, Some(_)) => true,
            (Some(_), None) => false,
            _ => other.document.content.len() > self.document.content.len(),
        };
        if richer {
            self.document = other.document;
        }
    }
}

/// Fuse heterogeneous lane results into one ordered list.
///
/// Commutative over lane arrival order: lanes are visited in `LaneId` order
/// and ties break on `content_hash`, so two runs over the same results
/// produce identical output.
pub fn fuse(
    lane_results: &[LaneResult],
    authority: &AuthorityTable,
    config: &FusionConfig,
    now: DateTime<Utc>,
) -> Vec<FusedDocument> {
    let mut ordered: Vec<&LaneResult> = lane_results.iter().collect();
    ordered.sort_by_key(|r| r.lane_id);

    // Pass 1: exact identity on content_hash, RRF contributions summed.
    let mut by_hash: HashMap<String, Accum> = HashMap::new();
    for result in ordered {
        for (rank, doc) in result.documents.iter().enumerate() {
            if doc.content_hash.is_empty() {
                continue;
            }
            let contribution = 1.0 / (config.k + (rank + 1) as f32);
            let entry = Accum {
                document: doc.clone(),
                rrf: contribution,
                lanes: BTreeSet::from([result.lane_id]),
            };
            match by_hash.get_mut(&doc.content_hash) {
                Some(existing) => existing.absorb(entry),
                None => {
                    by_hash.insert(doc.content_hash.clone(), entry);
                }
            }
        }
    }

    // Pass 2: same domain + fuzzy title. URL-only variants collapse here.
    let mut accums: Vec<Accum> = by_hash.into_values().collect();
    accums.sort_by(|a, b| a.document.content_hash.cmp(&b.document.content_hash));

    let mut merged: Vec<Accum> = Vec::with_capacity(accums.len());
    for accum in accums {
        let duplicate_of = merged.iter_mut().find(|kept| {
            kept.document.domain == accum.document.domain
                && !kept.document.domain.is_empty()
                && title_jaccard(&kept.document.title, &accum.document.title)
                    >= TITLE_JACCARD_THRESHOLD
        });
        match duplicate_of {
            Some(kept) => kept.absorb(accum),
            None => merged.push(accum),
        }
    }

    // Boosts are assigned in base-RRF reading order.
    merged.sort_by(|a, b| {
        b.rrf
            .partial_cmp(&a.rrf)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document.content_hash.cmp(&b.document.content_hash))
    });

    let mut domain_seen: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<FusedDocument> = merged
        .into_iter()
        .map(|accum| {
            let occurrence = domain_seen.entry(accum.document.domain.clone()).or_insert(0);
            *occurrence += 1;
            let diversity = match *occurrence {
                1 => config.domain_boost,
                2 => config.domain_boost / 2.0,
                n => config.domain_boost / (n + 1) as f32,
            };
            let recency = recency_bonus(accum.document.published_at, now, config.recency_boost);
            let authority_score = authority.score(&accum.document.domain);
            FusedDocument {
                rrf_score: accum.rrf + diversity + recency,
                component_scores: ComponentScores {
                    rrf: accum.rrf,
                    domain_diversity: diversity,
                    recency,
                    authority: authority_score,
                    quality: 0.0,
                },
                contributing_lanes: accum.lanes,
                final_score: 0.0,
                document: accum.document,
            }
        })
        .collect();

    fused.sort_by(|a, b| compare_fused(a, b));
    fused
}

/// Total score, then lane count, then authority, then stable hash order
pub fn compare_fused(a: &FusedDocument, b: &FusedDocument) -> std::cmp::Ordering {
    b.rrf_score
        .partial_cmp(&a.rrf_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.contributing_lanes.len().cmp(&a.contributing_lanes.len()))
        .then_with(|| {
            b.component_scores
                .authority
                .partial_cmp(&a.component_scores.authority)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.document.content_hash.cmp(&b.document.content_hash))
}

fn recency_bonus(published_at: Option<DateTime<Utc>>, now: DateTime<Utc>, boost: f32) -> f32 {
    let Some(published) = published_at else { return 0.0 };
    let age = now.signed_duration_since(published);
    if age <= Duration::days(1) {
        boost
    } else if age <= Duration::days(7) {
        boost / 2.0
    } else if age <= Duration::days(30) {
        boost / 5.0
    } else {
        0.0
    }
}

pub fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Intersection-over-union similarity of title token sets
pub fn title_jaccard(a: &str, b: &str) -> f32 {
    let sa = token_set(a);
    let sb = token_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::make_document;
    use crate::types::LaneStatus;

    fn lane_result(lane_id: LaneId, documents: Vec<Document>) -> LaneResult {
        let documents = documents
            .into_iter()
            .map(|mut d| {
                d.finalize(lane_id);
                d
            })
            .collect();
        LaneResult { lane_id, status: LaneStatus::Success, documents, latency_ms: 10, error: None }
    }

    fn doc(url: &str, title: &str, content: &str) -> Document {
        make_document(url, title, content, "snippet", 1.0)
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn shared_document_sums_rrf_across_lanes() {
        let a = doc("https://wikipedia.org/paris", "Paris", "Paris is the capital of France.");
        let results = vec![
            lane_result(LaneId::Web, vec![a.clone()]),
            lane_result(LaneId::Vector, vec![a.clone(), doc("https://b.org/x", "Other", "Other content here.")]),
        ];
        let fused = fuse(&results, &AuthorityTable::default(), &FusionConfig::default(), Utc::now());
        assert_eq!(fused.len(), 2);
        let top = &fused[0];
        assert_eq!(top.document.title, "Paris");
        assert_eq!(top.contributing_lanes, BTreeSet::from([LaneId::Web, LaneId::Vector]));
        let expected = 2.0 * (1.0 / 61.0);
        assert!((top.component_scores.rrf - expected).abs() < 1e-6);
    }

    #[test]
    fn fusion_is_invariant_to_lane_arrival_order() {
        let a = doc("https://a.org/1", "Alpha report", "alpha alpha alpha");
        let b = doc("https://b.org/2", "Beta report", "beta beta beta");
        let c = doc("https://c.org/3", "Gamma report", "gamma gamma gamma");
        let forward = vec![
            lane_result(LaneId::Web, vec![a.clone(), b.clone()]),
            lane_result(LaneId::Keyword, vec![c.clone(), a.clone()]),
        ];
        let reversed: Vec<LaneResult> = forward.iter().rev().cloned().collect();

        let now = Utc::now();
        let table = AuthorityTable::default();
        let cfg = FusionConfig::default();
        let ordered_a: Vec<String> =
            fuse(&forward, &table, &cfg, now).iter().map(|f| f.document.content_hash.clone()).collect();
        let ordered_b: Vec<String> =
            fuse(&reversed, &table, &cfg, now).iter().map(|f| f.document.content_hash.clone()).collect();
        assert_eq!(ordered_a, ordered_b);
    }

    #[test]
    fn fuzzy_title_dedup_merges_url_variants() {
        let mut a = doc("https://news.org/story?utm=1", "Quantum Breakthrough Announced", "long form article body one");
        let mut b = doc("https://news.org/story", "Quantum Breakthrough Announced!", "a different shorter body");
        a.finalize(LaneId::Web);
        b.finalize(LaneId::News);
        assert_ne!(a.content_hash, b.content_hash);

        let results = vec![
            LaneResult { lane_id: LaneId::Web, status: LaneStatus::Success, documents: vec![a], latency_ms: 5, error: None },
            LaneResult { lane_id: LaneId::News, status: LaneStatus::Success, documents: vec![b], latency_ms: 5, error: None },
        ];
        let fused = fuse(&results, &AuthorityTable::default(), &FusionConfig::default(), Utc::now());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].contributing_lanes.len(), 2);
    }

    #[test]
    fn dedup_is_idempotent() {
        let a = doc("https://a.org/1", "Same Story Here", "body body body");
        let b = doc("https://a.org/2", "Same Story Here", "body body body body");
        let results = vec![lane_result(LaneId::Web, vec![a, b])];
        let table = AuthorityTable::default();
        let cfg = FusionConfig::default();
        let first = fuse(&results, &table, &cfg, Utc::now());
        assert_eq!(first.len(), 1);

        // Feed the fused output back through as a single lane.
        let refed = vec![lane_result(
            LaneId::Web,
            first.iter().map(|f| f.document.clone()).collect(),
        )];
        let second = fuse(&refed, &table, &cfg, Utc::now());
        assert_eq!(second.len(), first.len());
    }

    #[test]
    fn recency_boost_tiers() {
        let now = Utc::now();
        assert!(close(recency_bonus(Some(now - Duration::hours(2)), now, 0.05), 0.05));
        assert!(close(recency_bonus(Some(now - Duration::days(3)), now, 0.05), 0.025));
        assert!(close(recency_bonus(Some(now - Duration::days(20)), now, 0.05), 0.01));
        assert!(close(recency_bonus(Some(now - Duration::days(200)), now, 0.05), 0.0));
        assert!(close(recency_bonus(None, now, 0.05), 0.0));
    }

    #[test]
    fn domain_diversity_rewards_new_domains() {
        let results = vec![lane_result(
            LaneId::Web,
            vec![
                doc("https://a.org/1", "First A", "content one"),
                doc("https://a.org/2", "Second A entirely different", "content two"),
                doc("https://b.org/1", "First B", "content three"),
            ],
        )];
        let fused = fuse(&results, &AuthorityTable::default(), &FusionConfig::default(), Utc::now());
        let b_entry = fused.iter().find(|f| f.document.domain == "b.org").unwrap();
        assert!(close(b_entry.component_scores.domain_diversity, 0.10));
        let second_a = fused
            .iter()
            .find(|f| f.document.domain == "a.org" && f.component_scores.domain_diversity < 0.08)
            .unwrap();
        assert!(close(second_a.component_scores.domain_diversity, 0.05));
    }
}
