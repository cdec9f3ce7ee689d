//! Resource maps: resource name → quantity.
//!
//! A `BTreeMap` keeps iteration order stable, which the scheduler relies
//! on for deterministic output.

use std::collections::BTreeMap;

/// Resource name → quantity (e.g. `{"CPU": 4.0, "GPU": 1.0}`).
pub type ResourceMap = BTreeMap<String, f64>;

/// Name of the resource that marks a GPU node.
pub const GPU: &str = "GPU";

/// Slack for float comparisons on resource quantities.
pub const EPSILON: f64 = 1e-9;

/// True when every non-zero entry of `demand` is covered by `available`.
pub fn fits(available: &ResourceMap, demand: &ResourceMap) -> bool {
    demand.iter().all(|(name, qty)| {
        *qty <= EPSILON || available.get(name).is_some_and(|have| *have + EPSILON >= *qty)
    })
}

/// Deduct `demand` from `available` in place.
///
/// Returns the name of the first resource that would go negative, leaving
/// `available` untouched in that case.
pub fn subtract(available: &mut ResourceMap, demand: &ResourceMap) -> Result<(), String> {
    if let Some(name) = demand
        .iter()
        .find(|(name, qty)| **qty > EPSILON && available.get(*name).copied().unwrap_or(0.0) + EPSILON < **qty)
        .map(|(name, _)| name.clone())
    {
        return Err(name);
    }
    for (name, qty) in demand {
        if *qty <= EPSILON {
            continue;
        }
        if let Some(have) = available.get_mut(name) {
            *have = (*have - qty).max(0.0);
        }
    }
    Ok(())
}

/// Element-wise sum of two maps.
pub fn add(a: &ResourceMap, b: &ResourceMap) -> ResourceMap {
    let mut out = a.clone();
    for (name, qty) in b {
        *out.entry(name.clone()).or_insert(0.0) += qty;
    }
    out
}

/// Resource names with a positive quantity.
pub fn nonzero_keys(map: &ResourceMap) -> impl Iterator<Item = &String> {
    map.iter().filter(|(_, q)| **q > EPSILON).map(|(k, _)| k)
}

/// Sum of all quantities.
pub fn total_quantity(map: &ResourceMap) -> f64 {
    map.values().filter(|q| **q > 0.0).sum()
}

/// True when the map carries any GPU capacity.
pub fn has_gpu(map: &ResourceMap) -> bool {
    map.get(GPU).is_some_and(|q| *q > EPSILON)
}
