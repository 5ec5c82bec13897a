// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The resource exhaustion risk evaluator.

use crate::snapshot::Snapshot;
use pvelb_config::BalancingConfig;
use tracing::warn;

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Risk {
    /// Some node, or the cluster as a whole, risks memory exhaustion.
    pub oom: bool,
    /// Some node, or the cluster as a whole, runs CPU-hot.
    pub cpu: bool,
}

impl Risk {
    /// Whether any risk was flagged.
    #[must_use]
    pub fn any(self) -> bool {
        self.oom || self.cpu
    }
}

/// Flags OOM and CPU risk against the configured thresholds.
///
/// A pure function over the snapshot: per-node loads and the included-only
/// cluster loads are compared, in percent, against `memory_oom_threshold` and
/// `cpu_threshold`.
#[must_use]
pub fn evaluate(snapshot: &Snapshot, balancing: &BalancingConfig) -> Risk {
    let mut risk = Risk::default();

    for node in snapshot.included_node_iter() {
        let mem_percent = node.mem_load * 100.0;
        let cpu_percent = node.cpu_load() * 100.0;
        if mem_percent > balancing.memory_oom_threshold {
            warn!(
                node = %node.node_id,
                mem_percent,
                threshold = balancing.memory_oom_threshold,
                "high OOM risk on node"
            );
            risk.oom = true;
        }
        if cpu_percent > balancing.cpu_threshold {
            warn!(
                node = %node.node_id,
                cpu_percent,
                threshold = balancing.cpu_threshold,
                "high CPU load on node"
            );
            risk.cpu = true;
        }
    }

    if snapshot.mem_load_included * 100.0 > balancing.memory_oom_threshold {
        warn!(
            mem_percent = snapshot.mem_load_included * 100.0,
            threshold = balancing.memory_oom_threshold,
            "high OOM risk on the entire cluster"
        );
        risk.oom = true;
    }
    if snapshot.cl_cpu_load_included * 100.0 > balancing.cpu_threshold {
        warn!(
            cpu_percent = snapshot.cl_cpu_load_included * 100.0,
            threshold = balancing.cpu_threshold,
            "high CPU load on the entire cluster"
        );
        risk.cpu = true;
    }

    risk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ClusterRules;
    use crate::testing::{FakeHypervisor, balancing};

    #[tokio::test]
    async fn balanced_cluster_has_no_risk() {
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.2, 100, 40)
            .with_node("b", 8, 0.2, 100, 40);
        let snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");
        assert_eq!(evaluate(&snapshot, &balancing()), Risk::default());
    }

    #[tokio::test]
    async fn hot_node_flags_oom() {
        // Node `a` is above the 90% memory threshold; the cluster overall is not.
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.2, 100, 95)
            .with_node("b", 8, 0.2, 100, 10);
        let snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");
        let risk = evaluate(&snapshot, &balancing());
        assert!(risk.oom);
        assert!(!risk.cpu);
    }

    #[tokio::test]
    async fn hot_cluster_flags_cpu() {
        // Every node is just under the per-node bound, but the included-only
        // cluster CPU load is above it.
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.96, 100, 40)
            .with_node("b", 8, 0.96, 100, 40);
        let snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");
        let risk = evaluate(&snapshot, &balancing());
        assert!(risk.cpu);
    }

    #[tokio::test]
    async fn evaluation_is_repeatable() {
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.5, 100, 95)
            .with_node("b", 8, 0.5, 100, 10);
        let snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");
        assert_eq!(
            evaluate(&snapshot, &balancing()),
            evaluate(&snapshot, &balancing())
        );
    }
}
