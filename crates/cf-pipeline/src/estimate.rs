//! Cost estimation for steps, groups, and whole chains.
//!
//! A group's gated estimate depends on its merge strategy: `first_success`
//! contributes its cheapest enabled member, the others the sum of all enabled
//! members. The upper bound always sums every enabled member.

use cf_core::{
    ChainConfig, CostEstimate, MergeStrategy, ParallelGroupSpec, StepCost, StepEntry, StepSpec,
};

use crate::registry::AdapterRegistry;

/// Gated estimate and upper bound for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntryCost {
    pub estimate: f64,
    pub upper_bound: f64,
}

/// Estimated cost of one step; zero when disabled, built in, or unresolvable.
pub fn step_cost(registry: &AdapterRegistry, spec: &StepSpec) -> f64 {
    if !spec.enabled || spec.step_type.is_builtin() {
        return 0.0;
    }
    registry
        .resolve(spec.step_type, &spec.model)
        .map(|adapter| adapter.estimate_cost(spec.step_type, &spec.params).max(0.0))
        .unwrap_or(0.0)
}

pub fn group_cost(registry: &AdapterRegistry, group: &ParallelGroupSpec) -> EntryCost {
    if !group.enabled {
        return EntryCost::default();
    }
    let member_costs: Vec<f64> = group
        .enabled_members()
        .map(|(_, m)| step_cost(registry, m))
        .collect();
    let sum: f64 = member_costs.iter().sum();
    let estimate = match group.merge_strategy {
        MergeStrategy::FirstSuccess => member_costs.iter().copied().reduce(f64::min),
        MergeStrategy::CollectAll | MergeStrategy::BestQuality => Some(sum),
    }
    .unwrap_or(0.0);
    EntryCost {
        estimate,
        upper_bound: sum,
    }
}

pub fn entry_cost(registry: &AdapterRegistry, entry: &StepEntry) -> EntryCost {
    match entry {
        StepEntry::Step(spec) => {
            let cost = step_cost(registry, spec);
            EntryCost {
                estimate: cost,
                upper_bound: cost,
            }
        }
        StepEntry::Group(group) => group_cost(registry, group),
    }
}

/// Estimate a whole chain, one row per top-level entry.
pub fn estimate_chain(registry: &AdapterRegistry, config: &ChainConfig) -> CostEstimate {
    let mut estimate = CostEstimate::default();
    for (index, entry) in config.steps.iter().enumerate() {
        let cost = entry_cost(registry, entry);
        estimate.push(StepCost {
            index,
            label: entry.label(),
            estimate: cost.estimate,
            upper_bound: cost.upper_bound,
        });
    }
    estimate
}
