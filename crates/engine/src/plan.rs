// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The migration planner.
//!
//! For every ordered pair of distinct included nodes in the same group, and
//! every migratable guest on the donor, the planner projects the post-move
//! deviations with local arithmetic (no snapshot cloning) and keeps only the
//! moves that strictly reduce the cluster's total deviation. The planner is
//! re-invoked after each executed move, which makes the overall scheme a
//! steepest-descent heuristic over the composite metric.

use crate::context::EngineContext;
use crate::detect::{cluster_means, node_cpu_estimates};
use crate::gateway::GuestKind;
use crate::snapshot::Snapshot;
use tracing::{debug, info};

/// One candidate migration, with the total deviation the cluster would show
/// after the move.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCandidate {
    /// The node giving up the guest.
    pub donor: String,
    /// The node receiving the guest.
    pub recipient: String,
    /// The guest to move.
    pub vmid: u32,
    /// The guest's kind, which decides the migration endpoint.
    pub kind: GuestKind,
    /// Projected total deviation after the move.
    pub projected_total: f64,
}

/// Enumerates the beneficial single-guest moves, sorted ascending by the
/// projected total deviation. Ties keep their discovery order.
///
/// Requires a snapshot whose `deviation` fields were populated by the
/// detector in the current iteration; `sum_of_deviations` is the total the
/// projections must strictly undercut.
#[must_use]
pub fn plan(
    snapshot: &Snapshot,
    ctx: &EngineContext,
    sum_of_deviations: f64,
) -> Vec<MigrationCandidate> {
    let estimates = node_cpu_estimates(snapshot);
    let (avg_ram, avg_cpu) = cluster_means(snapshot, &estimates);
    let weights = &ctx.config.balancing;
    let lxc_migration = ctx.config.parameters.lxc_migration.is_on();

    info!("calculating possible migrations");

    let mut variants = Vec::new();

    for donor in snapshot.included_node_iter() {
        for recipient in snapshot.included_node_iter() {
            if donor.node_id == recipient.node_id || donor.group != recipient.group {
                continue;
            }

            // Deviations of the untouched nodes carry over unchanged.
            let base_deviations: f64 = snapshot
                .included_node_iter()
                .filter(|n| n.node_id != donor.node_id && n.node_id != recipient.node_id)
                .map(|n| n.deviation)
                .sum();

            for guest in snapshot.included_guests_on(&donor.node_id) {
                if guest.kind == GuestKind::Container && !lxc_migration {
                    continue;
                }

                let donor_new_load =
                    donor.used_mem.saturating_sub(guest.mem) as f64 / donor.max_mem as f64;
                let recipient_new_load =
                    (recipient.used_mem + guest.mem) as f64 / recipient.max_mem as f64;

                // A single guest rarely dominates a node's trend, so only half
                // of it is assumed to move with the guest.
                let shifted = guest.cpu_trend / 2.0;
                let donor_cpu = (estimates[&donor.node_id] - shifted).max(0.0);
                let recipient_cpu = (estimates[&recipient.node_id] + shifted).min(1.0);

                let donor_dev = weights.weight_ram * (donor_new_load - avg_ram).abs()
                    + weights.weight_cpu * (donor_cpu - avg_cpu).abs();
                let recipient_dev = weights.weight_ram * (recipient_new_load - avg_ram).abs()
                    + weights.weight_cpu * (recipient_cpu - avg_cpu).abs();

                let projected_total = base_deviations + donor_dev + recipient_dev;

                if projected_total < sum_of_deviations {
                    debug!(
                        donor = %donor.node_id,
                        recipient = %recipient.node_id,
                        vmid = guest.vmid,
                        projected_total,
                        "beneficial migration variant"
                    );
                    variants.push(MigrationCandidate {
                        donor: donor.node_id.clone(),
                        recipient: recipient.node_id.clone(),
                        vmid: guest.vmid,
                        kind: guest.kind,
                        projected_total,
                    });
                }
            }
        }
    }

    variants.sort_by(|a, b| {
        a.projected_total
            .partial_cmp(&b.projected_total)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    info!(count = variants.len(), "beneficial migration variants found");
    variants
}
