//! Heuristic query classifier. Pure function, no I/O.

use crate::types::Mode;

const MULTIMEDIA_CUES: &[&str] = &[
    "image", "images", "photo", "video", "diagram", "chart", "screenshot", "figure", "audio",
];

const RESEARCH_CUES: &[&str] = &[
    "compare",
    "comparison",
    "survey",
    "literature",
    "comprehensive",
    "in-depth",
    "state of the art",
    "systematic",
    "meta-analysis",
    "research",
    "evidence",
    "review of",
];

const TECHNICAL_CUES: &[&str] = &[
    "code",
    "algorithm",
    "implementation",
    "implement",
    "api",
    "error",
    "stack trace",
    "database",
    "latency",
    "throughput",
    "tradeoffs",
    "trade-offs",
    "architecture",
    "protocol",
    "compile",
    "kernel",
    "benchmark",
    "vs",
]; // "B-tree vs LSM" style queries are technical

/// Assign a mode from cheap lexical signals. Deterministic; `simple` by default.
pub fn classify(text: &str, attachments: &[String]) -> Mode {
    let lower = text.to_lowercase();

    if !attachments.is_empty() || contains_any(&lower, MULTIMEDIA_CUES) {
        return Mode::Multimedia;
    }

    let words = lower.split_whitespace().count();

    if contains_any(&lower, RESEARCH_CUES) || words > 40 {
        return Mode::Research;
    }

    if contains_any(&lower, TECHNICAL_CUES) || words > 18 {
        return Mode::Technical;
    }

    Mode::Simple
}

fn contains_any(haystack: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| {
        if cue.contains(' ') {
            haystack.contains(cue)
        } else {
            haystack.split(|c: char| !c.is_alphanumeric() && c != '-').any(|w| w == *cue)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_factual_queries_are_simple() {
        assert_eq!(classify("capital of France", &[]), Mode::Simple);
        assert_eq!(classify("who wrote Dune", &[]), Mode::Simple);
    }

    #[test]
    fn engineering_queries_are_technical() {
        assert_eq!(classify("B-tree vs LSM tradeoffs", &[]), Mode::Technical);
        assert_eq!(classify("why does this API return error 500", &[]), Mode::Technical);
    }

    #[test]
    fn survey_queries_are_research() {
        assert_eq!(classify("comprehensive survey of retrieval augmentation", &[]), Mode::Research);
    }

    #[test]
    fn attachments_force_multimedia() {
        assert_eq!(classify("what is this", &["img.png".to_string()]), Mode::Multimedia);
        assert_eq!(classify("find a diagram of the water cycle", &[]), Mode::Multimedia);
    }

    #[test]
    fn classification_is_deterministic() {
        let q = "compare B-tree and LSM";
        assert_eq!(classify(q, &[]), classify(q, &[]));
    }
}
