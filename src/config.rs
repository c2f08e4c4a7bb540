//! Process-wide immutable configuration, read from the environment at startup

use crate::error::PipelineError;
use crate::types::{LaneId, Mode};
use std::collections::HashMap;
use std::str::FromStr;

/// Engine configuration. Built once, shared via `Arc`, never mutated.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode_deadlines_ms: HashMap<Mode, u64>,
    pub lane_enabled: HashMap<LaneId, bool>,
    pub lane_budget_overrides_ms: HashMap<LaneId, u64>,
    pub rrf_k: f32,
    pub domain_boost: f32,
    pub recency_boost: f32,
    pub citation_sim_threshold: f32,
    pub citation_top_k: usize,
    pub ttft_target_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub audit_retention_days: i64,
    pub preflight_budget_ms: u64,
    pub embed_cache_capacity: usize,
    pub embed_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut mode_deadlines_ms = HashMap::new();
        mode_deadlines_ms.insert(Mode::Simple, 5000);
        mode_deadlines_ms.insert(Mode::Technical, 7000);
        mode_deadlines_ms.insert(Mode::Research, 10000);
        mode_deadlines_ms.insert(Mode::Multimedia, 10000);

        Self {
            mode_deadlines_ms,
            lane_enabled: HashMap::new(),
            lane_budget_overrides_ms: HashMap::new(),
            rrf_k: 60.0,
            domain_boost: 0.10,
            recency_boost: 0.05,
            citation_sim_threshold: 0.7,
            citation_top_k: 3,
            ttft_target_ms: 1500,
            heartbeat_interval_ms: 10_000,
            audit_retention_days: 90,
            preflight_budget_ms: 500,
            embed_cache_capacity: 4096,
            embed_cache_ttl_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults.
    /// Malformed values are configuration errors, not silent fallbacks.
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut cfg = Self::default();

        if let Some(table) = read_env("SLA_MODE_DEADLINES_MS")? {
            cfg.mode_deadlines_ms = parse_mode_table(&table)?;
        }

        for lane in LaneId::RETRIEVAL {
            let suffix = lane.as_str().to_uppercase();
            if let Some(enabled) = parse_env::<bool>(&format!("LANE_ENABLED_{}", suffix))? {
                cfg.lane_enabled.insert(lane, enabled);
            }
            if let Some(ms) = parse_env::<u64>(&format!("LANE_BUDGET_MS_{}", suffix))? {
                cfg.lane_budget_overrides_ms.insert(lane, ms);
            }
        }

        if let Some(v) = parse_env::<f32>("RRF_K")? {
            cfg.rrf_k = v;
        }
        if let Some(v) = parse_env::<f32>("DOMAIN_BOOST")? {
            cfg.domain_boost = v;
        }
        if let Some(v) = parse_env::<f32>("RECENCY_BOOST")? {
            cfg.recency_boost = v;
        }
        if let Some(v) = parse_env::<f32>("CITATION_SIM_THRESHOLD")? {
            cfg.citation_sim_threshold = v;
        }
        if let Some(v) = parse_env::<usize>("CITATION_TOP_K")? {
            cfg.citation_top_k = v;
        }
        if let Some(v) = parse_env::<u64>("TTFT_TARGET_MS")? {
            cfg.ttft_target_ms = v;
        }
        if let Some(v) = parse_env::<u64>("HEARTBEAT_INTERVAL_MS")? {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse_env::<i64>("AUDIT_RETENTION_DAYS")? {
            cfg.audit_retention_days = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.citation_sim_threshold) {
            return Err(PipelineError::Config(format!(
                "CITATION_SIM_THRESHOLD must be in [0,1], got {}",
                self.citation_sim_threshold
            )));
        }
        if self.rrf_k <= 0.0 {
            return Err(PipelineError::Config(format!("RRF_K must be positive, got {}", self.rrf_k)));
        }
        for (mode, ms) in &self.mode_deadlines_ms {
            if *ms < 1000 {
                return Err(PipelineError::Config(format!(
                    "deadline for mode {} is too small: {}ms",
                    mode, ms
                )));
            }
        }
        Ok(())
    }

    pub fn deadline_ms(&self, mode: Mode) -> u64 {
        self.mode_deadlines_ms.get(&mode).copied().unwrap_or(10_000)
    }

    pub fn lane_enabled(&self, lane: LaneId) -> bool {
        self.lane_enabled.get(&lane).copied().unwrap_or(true)
    }
}

fn read_env(key: &str) -> Result<Option<String>, PipelineError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(PipelineError::Config(format!("{}: {}", key, e))),
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, PipelineError>
where
    T::Err: std::fmt::Display,
{
    match read_env(key)? {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{}={}: {}", key, raw, e))),
    }
}

/// Parse "simple=5000,technical=7000,..." into a deadline table
fn parse_mode_table(raw: &str) -> Result<HashMap<Mode, u64>, PipelineError> {
    let mut table = EngineConfig::default().mode_deadlines_ms;
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| PipelineError::Config(format!("bad deadline entry: {}", pair)))?;
        let mode = match name.trim() {
            "simple" => Mode::Simple,
            "technical" => Mode::Technical,
            "research" => Mode::Research,
            "multimedia" => Mode::Multimedia,
            other => return Err(PipelineError::Config(format!("unknown mode: {}", other))),
        };
        let ms: u64 = value
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("bad deadline for {}: {}", name, e)))?;
        table.insert(mode, ms);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_mode_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.deadline_ms(Mode::Simple), 5000);
        assert_eq!(cfg.deadline_ms(Mode::Technical), 7000);
        assert_eq!(cfg.deadline_ms(Mode::Research), 10000);
        assert_eq!(cfg.deadline_ms(Mode::Multimedia), 10000);
        assert!(cfg.lane_enabled(LaneId::Web));
    }

    #[test]
    fn mode_table_parsing_overrides_listed_modes_only() {
        let table = parse_mode_table("simple=4000, research=12000").unwrap();
        assert_eq!(table[&Mode::Simple], 4000);
        assert_eq!(table[&Mode::Research], 12000);
        assert_eq!(table[&Mode::Technical], 7000);
    }

    #[test]
    fn mode_table_rejects_unknown_mode() {
        assert!(parse_mode_table("fancy=1000").is_err());
    }
}
