// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The imbalance detector.
//!
//! Each included node gets a composite deviation: the weighted L1 distance of
//! its RAM load and CPU estimate from the cluster means. Balancing is
//! warranted when any node deviates beyond the operational threshold, which
//! is normally `deviation / 200` but is perturbed downward after ten calm
//! iterations so small chronic imbalances do not persist forever.

use crate::context::EngineContext;
use crate::snapshot::Snapshot;
use rand::{Rng, RngExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    /// Whether any node deviates beyond the operational threshold.
    pub balance_needed: bool,
    /// Sum of the deviations written onto the included nodes.
    pub sum_of_deviations: f64,
    /// The threshold used for this iteration.
    pub operational_threshold: f64,
    /// Whether the threshold was perturbed below its steady value.
    pub perturbed: bool,
}

/// Per-node CPU estimate: the mean CPU trend of the included guests hosted on
/// the node. Nodes without included guests, and nodes whose guests show a
/// zero trend, fall back to the instantaneous load ratio.
#[must_use]
pub fn node_cpu_estimates(snapshot: &Snapshot) -> BTreeMap<String, f64> {
    let mut estimates = BTreeMap::new();
    for node in snapshot.included_node_iter() {
        let trends: Vec<f64> = snapshot
            .included_guests_on(&node.node_id)
            .map(|g| g.cpu_trend)
            .collect();
        let trend_mean = if trends.is_empty() {
            node.cpu_fraction
        } else {
            trends.iter().sum::<f64>() / trends.len() as f64
        };
        let estimate = if trend_mean > 0.0 {
            trend_mean
        } else {
            node.cpu_load()
        };
        let _ = estimates.insert(node.node_id.clone(), estimate);
    }
    estimates
}

/// The cluster means the deviations are measured against: the included-only
/// memory load and the mean of the per-node CPU estimates.
#[must_use]
pub fn cluster_means(snapshot: &Snapshot, estimates: &BTreeMap<String, f64>) -> (f64, f64) {
    let avg_ram = snapshot.mem_load_included;
    let avg_cpu = if estimates.is_empty() {
        snapshot.cl_cpu_load_included
    } else {
        estimates.values().sum::<f64>() / estimates.len() as f64
    };
    (avg_ram, avg_cpu)
}

/// Computes per-node deviations, stores them on the snapshot, and decides
/// whether balancing is warranted this iteration.
pub fn detect(snapshot: &mut Snapshot, ctx: &mut EngineContext) -> Detection {
    let estimates = node_cpu_estimates(snapshot);
    let (avg_ram, avg_cpu) = cluster_means(snapshot, &estimates);
    let weights = &ctx.config.balancing;

    let node_ids: Vec<String> = snapshot.included_nodes.iter().cloned().collect();
    for node_id in &node_ids {
        let Some(node) = snapshot.nodes.get_mut(node_id) else {
            continue;
        };
        let ram_deviation = (node.mem_load - avg_ram).abs();
        let cpu_deviation = (estimates[node_id] - avg_cpu).abs();
        node.deviation =
            weights.weight_ram * ram_deviation + weights.weight_cpu * cpu_deviation;
        debug!(node = %node_id, deviation = node.deviation, "node deviation");
    }

    let sum_of_deviations = snapshot.sum_of_deviations();
    let steady = ctx.config.parameters.configured_deviation();

    let (operational_threshold, perturbed) = if ctx.calm_iterations > 10 {
        let threshold = perturbed_threshold(steady, &mut ctx.rng);
        ctx.calm_iterations = 0;
        info!(
            threshold,
            steady, "calm streak elapsed, perturbing the deviation threshold"
        );
        (threshold, true)
    } else {
        (steady, false)
    };

    let balance_needed = snapshot
        .included_node_iter()
        .any(|n| n.deviation > operational_threshold);

    if balance_needed {
        info!(
            threshold = operational_threshold,
            sum_of_deviations, "deviation above threshold, balancing needed"
        );
    } else {
        info!("no significant deviation, no balancing needed");
    }

    Detection {
        balance_needed,
        sum_of_deviations,
        operational_threshold,
        perturbed,
    }
}

/// The two-stage perturbation draw: `CD/2` with probability 2/3, otherwise
/// `CD/4` with probability 5/6 of the remainder, else `CD/8`.
fn perturbed_threshold(steady: f64, rng: &mut impl Rng) -> f64 {
    if rng.random::<f64>() > 1.0 / 3.0 {
        steady / 2.0
    } else if rng.random::<f64>() > 1.0 / 6.0 {
        steady / 4.0
    } else {
        steady / 8.0
    }
}
