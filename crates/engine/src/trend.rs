// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The CPU trend sampler.
//!
//! For every included guest, the sampler pulls the hourly CPU series and
//! reduces it to a scalar average written back onto the guest. A guest whose
//! series cannot be fetched gets a trend of zero; per-guest failures never
//! abort the iteration. Running the sampler again on an unchanged cluster
//! reproduces the same values, which is what the post-migration re-measurement
//! relies on.

use crate::gateway::Hypervisor;
use crate::snapshot::Snapshot;
use tracing::debug;

/// Fetches and stores `cpu_trend` for every included guest.
pub async fn sample_cpu_trends(snapshot: &mut Snapshot, hypervisor: &dyn Hypervisor) {
    let vmids: Vec<u32> = snapshot.included_guests.iter().copied().collect();
    for vmid in vmids {
        let Some(guest) = snapshot.guests.get(&vmid) else {
            continue;
        };
        let (node_id, kind) = (guest.node_id.clone(), guest.kind);

        let samples = match hypervisor.guest_cpu_series(&node_id, kind, vmid).await {
            Ok(samples) => samples,
            Err(error) => {
                debug!(vmid, %error, "CPU series unavailable, assuming zero trend");
                Vec::new()
            }
        };
        let trend = mean(&samples);

        if let Some(guest) = snapshot.guests.get_mut(&vmid) {
            guest.cpu_trend = trend;
            debug!(vmid, trend = %format!("{:.2}%", trend * 100.0), "hourly CPU trend");
        }
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ClusterRules, Snapshot};
    use crate::testing::FakeHypervisor;

    #[tokio::test]
    async fn trend_is_the_mean_of_the_series() {
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.1, 100, 40)
            .with_node("b", 8, 0.1, 100, 40)
            .with_vm(100, "a", 10)
            .with_cpu_series(100, &[0.2, 0.4, 0.6]);
        let mut snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");

        sample_cpu_trends(&mut snapshot, &hv).await;
        let trend = snapshot.guests[&100].cpu_trend;
        assert!((trend - 0.4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn empty_series_yields_zero() {
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.1, 100, 40)
            .with_node("b", 8, 0.1, 100, 40)
            .with_vm(100, "a", 10);
        let mut snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");

        sample_cpu_trends(&mut snapshot, &hv).await;
        assert_eq!(snapshot.guests[&100].cpu_trend, 0.0);
    }

    #[tokio::test]
    async fn resampling_is_idempotent() {
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.1, 100, 40)
            .with_node("b", 8, 0.1, 100, 40)
            .with_vm(100, "a", 10)
            .with_cpu_series(100, &[0.1, 0.3]);
        let mut snapshot = Snapshot::build(&hv, &ClusterRules::default())
            .await
            .expect("snapshot");

        sample_cpu_trends(&mut snapshot, &hv).await;
        let first = snapshot.guests[&100].cpu_trend;
        sample_cpu_trends(&mut snapshot, &hv).await;
        assert_eq!(snapshot.guests[&100].cpu_trend, first);
    }

    #[tokio::test]
    async fn excluded_guests_are_not_sampled() {
        let mut rules = ClusterRules::default();
        let _ = rules.excluded_guests.insert(100);
        let hv = FakeHypervisor::new()
            .with_node("a", 8, 0.1, 100, 40)
            .with_node("b", 8, 0.1, 100, 40)
            .with_vm(100, "a", 10)
            .with_cpu_series(100, &[0.9]);
        let mut snapshot = Snapshot::build(&hv, &rules).await.expect("snapshot");

        sample_cpu_trends(&mut snapshot, &hv).await;
        assert_eq!(snapshot.guests[&100].cpu_trend, 0.0);
    }
}
