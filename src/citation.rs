//! Sentence-to-passage citation alignment and disagreement detection

use crate::error::LaneError;
use crate::ranking::cosine_similarity;
use crate::retrievers::Embedder;
use crate::types::{
    AnswerSentence, BibliographyEntry, Citation, Disagreement, DocumentRef, FusedDocument,
    Severity,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Passage chunk size used when splitting document content
const PASSAGE_MAX_CHARS: usize = 400;
/// Passages considered per document, bounds alignment cost
const PASSAGES_PER_DOC: usize = 20;
/// Context overlap required before two passages can disagree
const TOPIC_OVERLAP_THRESHOLD: f32 = 0.3;

const NEGATIONS: &[&str] =
    &["not", "no", "never", "false", "isn't", "wasn't", "denies", "refuted", "incorrect"];

/// Sentence-terminator lookbehind set; matched case-insensitively
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "etc", "vs", "cf", "dr", "mr", "mrs", "ms", "prof", "fig", "no", "al", "inc",
    "jr", "sr", "st", "u.s", "u.k", "approx",
];

#[derive(Debug, Clone)]
pub struct CitationConfig {
    pub sim_threshold: f32,
    pub top_k: usize,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self { sim_threshold: 0.7, top_k: 3 }
    }
}

/// Alignment output: annotated sentences, citations, ordered bibliography,
/// and any detected cross-source disagreements.
#[derive(Debug, Clone, Default)]
pub struct AlignedAnswer {
    pub sentences: Vec<AnswerSentence>,
    pub citations: Vec<Citation>,
    pub bibliography: Vec<BibliographyEntry>,
    pub disagreements: Vec<Disagreement>,
}

/// Bounded, TTL-evicting embedding cache shared across queries
pub struct EmbedCache {
    entries: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

struct CacheInner {
    map: HashMap<String, (Vec<f32>, Instant)>,
    order: Vec<String>,
}

impl EmbedCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(CacheInner { map: HashMap::new(), order: Vec::new() }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let mut inner = self.entries.lock().expect("embed cache poisoned");
        let expired = match inner.map.get(text) {
            Some((vector, inserted)) if inserted.elapsed() <= self.ttl => {
                return Some(vector.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            // Drop the key from the eviction order too, or a later re-put
            // would track it twice and evict the fresh value early.
            inner.map.remove(text);
            inner.order.retain(|key| key != text);
        }
        None
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let mut inner = self.entries.lock().expect("embed cache poisoned");
        if inner.map.insert(text.to_string(), (vector, Instant::now())).is_none() {
            inner.order.push(text.to_string());
        }
        while inner.order.len() > self.capacity {
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }
    }
}

impl Default for EmbedCache {
    fn default() -> Self {
        Self::new(4096, Duration::from_secs(600))
    }
}

/// Punctuation-aware sentence segmentation that preserves abbreviations
/// and decimal numbers.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    for i in 0..chars.len() {
        let c = chars[i];
        if c != '.' && c != '!' && c != '?' {
            continue;
        }

        // Decimal number: digit on both sides of the dot.
        if c == '.'
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && i > 0
            && chars[i - 1].is_ascii_digit()
        {
            continue;
        }

        // Terminator must be followed by whitespace (or end of text).
        let mut j = i + 1;
        while j < chars.len() && (chars[j] == '"' || chars[j] == ')' || chars[j] == ']') {
            j += 1;
        }
        if j < chars.len() && !chars[j].is_whitespace() {
            continue;
        }

        if c == '.' && is_abbreviation(&chars, i) {
            continue;
        }

        let sentence: String = chars[start..j].iter().collect();
        let sentence = sentence.trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        // Skip the whitespace run.
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        start = j;
    }

    let tail: String = chars[start.min(chars.len())..].iter().collect();
    let tail = tail.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn is_abbreviation(chars: &[char], dot_index: usize) -> bool {
    let mut word_start = dot_index;
    while word_start > 0 {
        let prev = chars[word_start - 1];
        if prev.is_alphanumeric() || prev == '.' {
            word_start -= 1;
        } else {
            break;
        }
    }
    let token: String =
        chars[word_start..dot_index].iter().collect::<String>().to_lowercase();
    let token = token.trim_end_matches('.');
    if token.is_empty() {
        return false;
    }
    // Single letters ("J. Smith") read as initials.
    if token.len() == 1 && token.chars().next().is_some_and(|c| c.is_alphabetic()) {
        return true;
    }
    ABBREVIATIONS.contains(&token)
}

/// Greedily pack sentences into passages of bounded size
pub fn split_passages(content: &str, max_chars: usize) -> Vec<String> {
    let mut passages = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(content) {
        if !current.is_empty() && current.len() + sentence.len() + 1 > max_chars {
            passages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }
    if !current.is_empty() {
        passages.push(current);
    }
    passages
}

fn tokens_of(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Normalized token overlap: |A ∩ B| / min(|A|, |B|)
fn overlap_coefficient(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    intersection / a.len().min(b.len()) as f32
}

struct PassageEntry {
    doc_index: usize,
    text: String,
    tokens: HashSet<String>,
    embedding: Option<Vec<f32>>,
}

/// Align each answer sentence to its supporting passages and assign
/// first-occurrence citation markers.
///
/// Similarity is cosine over embeddings when an embedder is available,
/// otherwise normalized token overlap. With an empty corpus every
/// sentence comes back tagged no-source.
pub async fn align_answer(
    answer: &str,
    corpus: &[FusedDocument],
    embedder: Option<&dyn Embedder>,
    cache: &EmbedCache,
    config: &CitationConfig,
) -> AlignedAnswer {
    let sentence_texts = split_sentences(answer);
    if sentence_texts.is_empty() {
        return AlignedAnswer::default();
    }

    let mut passages: Vec<PassageEntry> = Vec::new();
    for (doc_index, fused) in corpus.iter().enumerate() {
        let source = if fused.document.content.is_empty() {
            &fused.document.snippet
        } else {
            &fused.document.content
        };
        for text in split_passages(source, PASSAGE_MAX_CHARS).into_iter().take(PASSAGES_PER_DOC) {
            let tokens = tokens_of(&text);
            passages.push(PassageEntry { doc_index, text, tokens, embedding: None });
        }
    }

    // Embed sentences and passages in one batch through the shared cache.
    let mut sentence_embeddings: Vec<Option<Vec<f32>>> = vec![None; sentence_texts.len()];
    if let Some(embedder) = embedder {
        let mut to_embed: Vec<String> = Vec::new();
        for text in sentence_texts.iter().chain(passages.iter().map(|p| &p.text)) {
            if cache.get(text).is_none() && !to_embed.contains(text) {
                to_embed.push(text.clone());
            }
        }
        if !to_embed.is_empty() {
            match embedder.embed(&to_embed).await {
                Ok(vectors) => {
                    for (text, vector) in to_embed.iter().zip(vectors) {
                        cache.put(text, vector);
                    }
                }
                Err(e) => log_embed_failure(&e),
            }
        }
        for (i, text) in sentence_texts.iter().enumerate() {
            sentence_embeddings[i] = cache.get(text);
        }
        for passage in passages.iter_mut() {
            passage.embedding = cache.get(&passage.text);
        }
    }

    let mut marker_by_hash: HashMap<String, usize> = HashMap::new();
    let mut bibliography: Vec<BibliographyEntry> = Vec::new();
    let mut citations: Vec<Citation> = Vec::new();
    let mut sentences: Vec<AnswerSentence> = Vec::new();
    // (marker, passage text, sentence index) for disagreement detection
    let mut cited_passages: Vec<(usize, String, usize)> = Vec::new();

    for (sentence_index, sentence_text) in sentence_texts.iter().enumerate() {
        let sentence_tokens = tokens_of(sentence_text);
        let sentence_embedding = sentence_embeddings[sentence_index].as_deref();

        // Best passage per document, then the overall top-k.
        let mut best_per_doc: HashMap<usize, (f32, usize)> = HashMap::new();
        for (passage_index, passage) in passages.iter().enumerate() {
            let similarity = match (sentence_embedding, passage.embedding.as_deref()) {
                (Some(se), Some(pe)) => cosine_similarity(se, pe),
                _ => overlap_coefficient(&sentence_tokens, &passage.tokens),
            };
            if similarity < config.sim_threshold {
                continue;
            }
            let entry = best_per_doc.entry(passage.doc_index).or_insert((similarity, passage_index));
            if similarity > entry.0 {
                *entry = (similarity, passage_index);
            }
        }

        let mut ranked: Vec<(usize, f32, usize)> = best_per_doc
            .into_iter()
            .map(|(doc_index, (similarity, passage_index))| (doc_index, similarity, passage_index))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(config.top_k);

        let mut sentence_markers: Vec<usize> = Vec::new();
        let mut best_similarity = 0.0f32;
        for (doc_index, similarity, passage_index) in ranked {
            let document = &corpus[doc_index].document;
            let next_marker = marker_by_hash.len() + 1;
            let marker = *marker_by_hash
                .entry(document.content_hash.clone())
                .or_insert(next_marker);
            if marker == next_marker && bibliography.len() < marker {
                bibliography.push(BibliographyEntry {
                    marker_id: marker,
                    title: document.title.clone(),
                    url: document.url.clone(),
                    domain: document.domain.clone(),
                    published_at: document.published_at,
                    author: document.author.clone(),
                    excerpt: truncate(&passages[passage_index].text, 200),
                });
            }
            citations.push(Citation {
                marker_id: marker,
                document_ref: DocumentRef::from_document(document),
                passage: passages[passage_index].text.clone(),
                similarity,
                confidence: similarity,
            });
            cited_passages.push((marker, passages[passage_index].text.clone(), sentence_index));
            sentence_markers.push(marker);
            best_similarity = best_similarity.max(similarity);
        }

        let no_source = sentence_markers.is_empty();
        sentences.push(AnswerSentence {
            text: sentence_text.clone(),
            citations: sentence_markers,
            confidence: best_similarity,
            no_source,
        });
    }

    let disagreements = detect_disagreements(&cited_passages);
    AlignedAnswer { sentences, citations, bibliography, disagreements }
}

fn log_embed_failure(e: &LaneError) {
    debug!("embedding unavailable, falling back to token overlap: {}", e);
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

/// Extract comparable numeric claims: digits with optional commas,
/// decimals, and percent signs.
fn numeric_claims(text: &str) -> Vec<f64> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.trim_matches(['.', ',']).replace(',', "").parse::<f64>() {
                numbers.push(n);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(n) = current.trim_matches(['.', ',']).replace(',', "").parse::<f64>() {
            numbers.push(n);
        }
    }
    numbers
}

fn has_negation(tokens: &HashSet<String>) -> bool {
    NEGATIONS.iter().any(|n| tokens.contains(*n))
}

/// Pairwise structural comparison of cited passages that share a topic.
/// Contradictory numeric claims read as medium severity, opposite polarity
/// as high.
fn detect_disagreements(cited: &[(usize, String, usize)]) -> Vec<Disagreement> {
    let mut disagreements: Vec<Disagreement> = Vec::new();
    let mut reported: HashSet<(usize, usize)> = HashSet::new();

    for i in 0..cited.len() {
        for j in (i + 1)..cited.len() {
            let (marker_a, passage_a, _) = &cited[i];
            let (marker_b, passage_b, _) = &cited[j];
            if marker_a == marker_b {
                continue;
            }
            let pair = (*marker_a.min(marker_b), *marker_a.max(marker_b));
            if reported.contains(&pair) {
                continue;
            }

            let tokens_a = tokens_of(passage_a);
            let tokens_b = tokens_of(passage_b);
            let non_numeric_a: HashSet<String> =
                tokens_a.iter().filter(|t| !t.chars().all(|c| c.is_ascii_digit())).cloned().collect();
            let non_numeric_b: HashSet<String> =
                tokens_b.iter().filter(|t| !t.chars().all(|c| c.is_ascii_digit())).cloned().collect();
            if overlap_coefficient(&non_numeric_a, &non_numeric_b) < TOPIC_OVERLAP_THRESHOLD {
                continue;
            }

            let severity = if has_negation(&tokens_a) != has_negation(&tokens_b) {
                Some(Severity::High)
            } else {
                let nums_a = numeric_claims(passage_a);
                let nums_b = numeric_claims(passage_b);
                if !nums_a.is_empty() && !nums_b.is_empty() && numbers_disjoint(&nums_a, &nums_b) {
                    Some(Severity::Medium)
                } else {
                    None
                }
            };

            if let Some(severity) = severity {
                reported.insert(pair);
                let shared: Vec<String> = {
                    let mut s: Vec<String> =
                        non_numeric_a.intersection(&non_numeric_b).cloned().collect();
                    s.sort();
                    s.truncate(4);
                    s
                };
                disagreements.push(Disagreement {
                    topic: shared.join(" "),
                    conflicting_citations: vec![pair.0, pair.1],
                    severity,
                });
            }
        }
    }
    disagreements
}

/// True when no value in `a` matches any value in `b` within rounding noise
fn numbers_disjoint(a: &[f64], b: &[f64]) -> bool {
    for x in a {
        for y in b {
            let scale = x.abs().max(y.abs()).max(1e-9);
            if ((x - y).abs() / scale) < 1e-6 {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{fuse, FusionConfig};
    use crate::ranking::AuthorityTable;
    use crate::retrievers::{make_document, MockEmbedder};
    use crate::types::{Document, LaneId, LaneResult, LaneStatus};
    use chrono::Utc;

    fn corpus_from(docs: Vec<Document>) -> Vec<FusedDocument> {
        let result = LaneResult {
            lane_id: LaneId::Web,
            status: LaneStatus::Success,
            documents: docs
                .into_iter()
                .map(|mut d| {
                    d.finalize(LaneId::Web);
                    d
                })
                .collect(),
            latency_ms: 1,
            error: None,
        };
        fuse(&[result], &AuthorityTable::default(), &FusionConfig::default(), Utc::now())
    }

    #[test]
    fn segmentation_preserves_abbreviations_and_decimals() {
        let text = "Dr. Smith measured 3.14 units. The result, e.g. in trials, held. Done!";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 3);
        assert!(sentences[0].contains("Dr. Smith"));
        assert!(sentences[0].contains("3.14"));
        assert!(sentences[1].contains("e.g. in trials"));
    }

    #[test]
    fn segmentation_handles_question_and_quote_ends() {
        let sentences = split_sentences("Is it true? \"Yes.\" It is.");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "Is it true?");
    }

    #[test]
    fn passages_respect_max_chars() {
        let content = "One short sentence here. ".repeat(40);
        for passage in split_passages(&content, 100) {
            assert!(passage.len() <= 100, "passage too long: {}", passage.len());
        }
    }

    #[tokio::test]
    async fn markers_are_first_occurrence_and_reused() {
        let paris = make_document(
            "https://wikipedia.org/paris",
            "Paris",
            "Paris is the capital and largest city of France. The city sits on the Seine.",
            "Paris is the capital of France.",
            1.0,
        );
        let corpus = corpus_from(vec![paris]);
        let cache = EmbedCache::default();
        let embedder = MockEmbedder::default();
        let answer =
            "The capital of France is Paris. Paris is the largest city of France.";
        let aligned = align_answer(
            answer,
            &corpus,
            Some(&embedder),
            &cache,
            &CitationConfig { sim_threshold: 0.3, top_k: 3 },
        )
        .await;

        assert_eq!(aligned.sentences.len(), 2);
        assert_eq!(aligned.sentences[0].citations, vec![1]);
        assert_eq!(aligned.sentences[1].citations, vec![1]); // reuse, no new marker
        assert_eq!(aligned.bibliography.len(), 1);
        assert_eq!(aligned.bibliography[0].marker_id, 1);
        assert!(!aligned.sentences[0].no_source);
    }

    #[tokio::test]
    async fn empty_corpus_tags_every_sentence_no_source() {
        let cache = EmbedCache::default();
        let aligned = align_answer(
            "Nothing could be retrieved. The answer is uncertain.",
            &[],
            None,
            &cache,
            &CitationConfig::default(),
        )
        .await;
        assert!(aligned.bibliography.is_empty());
        assert!(aligned.citations.is_empty());
        assert!(aligned.sentences.iter().all(|s| s.no_source));
    }

    #[tokio::test]
    async fn conflicting_numeric_claims_are_flagged_medium() {
        let a = make_document(
            "https://siteone.org/earth",
            "Earth facts",
            "The Earth radius is 6371 km according to standard measurement.",
            "",
            1.0,
        );
        let b = make_document(
            "https://sitetwo.org/earth",
            "Earth measurements",
            "The Earth radius is 6,378 km at the equator by measurement.",
            "",
            1.0,
        );
        let corpus = corpus_from(vec![a, b]);
        let cache = EmbedCache::default();
        let aligned = align_answer(
            "The Earth radius is about 6371 km by standard measurement.",
            &corpus,
            None,
            &cache,
            &CitationConfig { sim_threshold: 0.4, top_k: 3 },
        )
        .await;

        assert!(
            !aligned.disagreements.is_empty(),
            "expected a disagreement, got none; citations: {:?}",
            aligned.citations.len()
        );
        let d = &aligned.disagreements[0];
        assert_eq!(d.severity, Severity::Medium);
        assert_eq!(d.conflicting_citations.len(), 2);
    }

    #[test]
    fn numeric_claim_extraction_strips_commas() {
        let nums = numeric_claims("radius 6,378 km vs 6371.0 km");
        assert!(nums.contains(&6378.0));
        assert!(nums.contains(&6371.0));
    }

    #[test]
    fn cache_expires_and_bounds() {
        let cache = EmbedCache::new(2, Duration::from_millis(5));
        cache.put("a", vec![1.0]);
        cache.put("b", vec![2.0]);
        cache.put("c", vec![3.0]); // evicts "a"
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("c").is_none(), "ttl should expire entries");
    }

    #[test]
    fn expired_key_can_be_reinserted_without_double_tracking() {
        let cache = EmbedCache::new(2, Duration::from_millis(5));
        cache.put("a", vec![1.0]);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("a").is_none()); // expires and is pruned

        cache.put("a", vec![2.0]);
        cache.put("b", vec![3.0]);
        // The cache is exactly at capacity; a doubly-tracked "a" would
        // have been evicted right here.
        assert_eq!(cache.get("a").unwrap(), vec![2.0], "fresh value must survive re-insert");

        cache.put("c", vec![4.0]); // now "a" really is the oldest
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap(), vec![3.0]);
        assert_eq!(cache.get("c").unwrap(), vec![4.0]);
    }
}
