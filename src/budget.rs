//! Budget computation: mode table, cost multiplier, orchestrator reserve

use crate::config::EngineConfig;
use crate::types::{Budget, Constraints, LaneId, Mode};
use std::collections::HashMap;

/// Minimum slice the orchestrator keeps for fusion, alignment, and the final event
pub const ORCHESTRATOR_RESERVE_MS: u64 = 500;

/// Baseline per-lane allocation before the cost multiplier
fn lane_base_ms(mode: Mode, lane: LaneId) -> u64 {
    match (mode, lane) {
        (Mode::Simple, LaneId::Web | LaneId::Vector | LaneId::KnowledgeGraph) => 1000,
        (Mode::Simple, LaneId::Keyword) => 500,
        (Mode::Simple, LaneId::News | LaneId::Markets) => 300,

        (Mode::Technical, LaneId::Web | LaneId::Vector | LaneId::KnowledgeGraph) => 1500,
        (Mode::Technical, LaneId::Keyword) => 750,
        (Mode::Technical, LaneId::News | LaneId::Markets) => 500,

        (Mode::Research | Mode::Multimedia, LaneId::Web | LaneId::Vector | LaneId::KnowledgeGraph) => 2000,
        (Mode::Research | Mode::Multimedia, LaneId::Keyword) => 1000,
        (Mode::Research | Mode::Multimedia, LaneId::News | LaneId::Markets) => 800,

        (_, LaneId::Preflight) => 500,
    }
}

fn synthesis_base_ms(mode: Mode) -> u64 {
    match mode {
        Mode::Simple => 1000,
        Mode::Technical => 1500,
        Mode::Research | Mode::Multimedia => 2000,
    }
}

/// Compute the budget for an admitted query.
///
/// Per-lane allocations are the mode table scaled by the cost multiplier,
/// then scaled down proportionally so that `sum(per_lane) + reserve <=
/// global_deadline` holds, and individually capped so every lane can finish
/// before the synthesis cut-over.
pub fn compute_budget(mode: Mode, constraints: &Constraints, config: &EngineConfig) -> Budget {
    let global = config.deadline_ms(mode);
    let reserve = ORCHESTRATOR_RESERVE_MS;
    let mult = constraints.cost_multiplier();

    let synthesis_ms =
        ((synthesis_base_ms(mode) as f64 * mult) as u64).min(global.saturating_sub(reserve));

    let mut per_lane: HashMap<LaneId, u64> = HashMap::new();
    for lane in LaneId::RETRIEVAL {
        if !config.lane_enabled(lane) {
            continue;
        }
        let base = config
            .lane_budget_overrides_ms
            .get(&lane)
            .copied()
            .unwrap_or_else(|| lane_base_ms(mode, lane));
        per_lane.insert(lane, (base as f64 * mult) as u64);
    }

    // Keep the budget invariant under multipliers > 1.
    let available = global.saturating_sub(reserve);
    let total: u64 = per_lane.values().sum();
    if total > available && total > 0 {
        let scale = available as f64 / total as f64;
        for ms in per_lane.values_mut() {
            *ms = (*ms as f64 * scale) as u64;
        }
    }

    // No lane may outlive the retrieval window.
    let cutover = global.saturating_sub(reserve + synthesis_ms);
    for ms in per_lane.values_mut() {
        *ms = (*ms).min(cutover.max(1));
    }

    Budget { global_deadline_ms: global, per_lane, synthesis_ms, reserve_ms: reserve }
}

/// Whether the 500 ms pre-flight refinement fits. Lanes wait for the refined
/// constraint binding, so the projection subtracts the pre-flight budget from
/// each lane: if any lane would retain less than 25% of its allocation, the
/// pre-flight is bypassed.
pub fn preflight_viable(budget: &Budget, preflight_ms: u64) -> bool {
    budget
        .per_lane
        .values()
        .all(|&ms| ms.saturating_sub(preflight_ms) * 4 >= ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CostCeiling;

    #[test]
    fn budget_invariant_holds_for_all_modes_and_ceilings() {
        let config = EngineConfig::default();
        for mode in Mode::ALL {
            for ceiling in [CostCeiling::Low, CostCeiling::Medium, CostCeiling::High] {
                let constraints =
                    Constraints { cost_ceiling: Some(ceiling), ..Default::default() };
                let budget = compute_budget(mode, &constraints, &config);
                let total: u64 = budget.per_lane.values().sum();
                assert!(
                    total + budget.reserve_ms <= budget.global_deadline_ms,
                    "sum(per_lane)={} + reserve={} > global={} ({} {:?})",
                    total,
                    budget.reserve_ms,
                    budget.global_deadline_ms,
                    mode,
                    ceiling
                );
            }
        }
    }

    #[test]
    fn simple_mode_matches_table() {
        let config = EngineConfig::default();
        let budget = compute_budget(Mode::Simple, &Constraints::default(), &config);
        assert_eq!(budget.global_deadline_ms, 5000);
        assert_eq!(budget.lane_ms(LaneId::Web), 1000);
        assert_eq!(budget.lane_ms(LaneId::Keyword), 500);
        assert_eq!(budget.lane_ms(LaneId::News), 300);
        assert_eq!(budget.synthesis_ms, 1000);
        assert_eq!(budget.reserve_ms, 500);
    }

    #[test]
    fn low_ceiling_halves_lanes() {
        let config = EngineConfig::default();
        let constraints =
            Constraints { cost_ceiling: Some(CostCeiling::Low), ..Default::default() };
        let budget = compute_budget(Mode::Technical, &constraints, &config);
        assert_eq!(budget.lane_ms(LaneId::Web), 750);
        assert_eq!(budget.lane_ms(LaneId::Keyword), 375);
    }

    #[test]
    fn disabled_lanes_get_no_allocation() {
        let mut config = EngineConfig::default();
        config.lane_enabled.insert(LaneId::Markets, false);
        let budget = compute_budget(Mode::Research, &Constraints::default(), &config);
        assert!(!budget.per_lane.contains_key(&LaneId::Markets));
    }

    #[test]
    fn preflight_bypassed_when_short_lanes_would_starve() {
        let config = EngineConfig::default();
        // Simple mode has 300 ms news/markets lanes; a 500 ms pre-flight
        // would leave them negative.
        let simple = compute_budget(Mode::Simple, &Constraints::default(), &config);
        assert!(!preflight_viable(&simple, 500));

        // Research lanes are long enough to absorb it.
        let research = compute_budget(Mode::Research, &Constraints::default(), &config);
        assert!(preflight_viable(&research, 500));
    }
}
