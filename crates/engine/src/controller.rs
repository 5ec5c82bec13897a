// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! The top-level control loop.
//!
//! One iteration is: build snapshot → verify load bounds → sample trends →
//! evaluate risk → detect imbalance → plan → execute at most one move →
//! re-measure → sleep. The loop never returns in normal operation; it only
//! comes back with an error the process should die on, leaving restarts to
//! the supervisor.

use crate::context::EngineContext;
use crate::detect::detect;
use crate::error::Error;
use crate::execute::execute_batch;
use crate::gateway::Hypervisor;
use crate::notify::Notifier;
use crate::plan::plan;
use crate::risk::evaluate;
use crate::snapshot::Snapshot;
use crate::trend::sample_cpu_trends;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Pause when the cluster is balanced, or when this host must defer to the
/// master.
const IDLE_SLEEP: Duration = Duration::from_secs(300);
/// Pause when planning produced no variants.
const NO_VARIANTS_SLEEP: Duration = Duration::from_secs(60);
/// Pause between a successful move and the re-measurement.
const REMEASURE_DELAY: Duration = Duration::from_secs(10);

/// What one control-loop iteration did. Only observed by tests and logs; the
/// loop itself treats every non-error outcome the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing to do; the cluster is balanced.
    Balanced,
    /// This host is not the master and `only_on_master` is on.
    NotMaster,
    /// Balancing was warranted but no beneficial move exists.
    NoVariants,
    /// Balancing was warranted but the cluster has no quorum.
    QuorumLost,
    /// A batch ran; whether a guest actually moved is in the report.
    Executed,
}

/// The balancer: a hypervisor gateway, a notifier, and the persistent engine
/// context driving iteration after iteration.
pub struct Balancer<H, N> {
    hypervisor: H,
    notifier: N,
    ctx: EngineContext,
    hostname: Option<String>,
}

impl<H: Hypervisor, N: Notifier> Balancer<H, N> {
    /// Creates a balancer using this host's name for the only-on-master gate.
    pub fn new(hypervisor: H, notifier: N, ctx: EngineContext) -> Self {
        let hostname = sysinfo::System::host_name();
        Self::with_hostname(hypervisor, notifier, ctx, hostname)
    }

    /// Creates a balancer with a caller-chosen hostname.
    pub fn with_hostname(
        hypervisor: H,
        notifier: N,
        ctx: EngineContext,
        hostname: Option<String>,
    ) -> Self {
        Balancer {
            hypervisor,
            notifier,
            ctx,
            hostname,
        }
    }

    /// Runs the control loop forever. Returns only with a fatal error.
    pub async fn run(&mut self) -> Result<(), Error> {
        if self.ctx.config.parameters.test_mode.is_on() {
            info!("test mode active, no migrations will be performed");
        }
        loop {
            let _ = self.iteration().await?;
        }
    }

    /// Runs a single control-loop iteration, including its trailing sleep.
    pub async fn iteration(&mut self) -> Result<IterationOutcome, Error> {
        let mut snapshot = Snapshot::build(&self.hypervisor, &self.ctx.rules).await?;

        info!(
            cluster = %snapshot.cluster_name,
            included_nodes = ?snapshot.included_nodes,
            ram_load = %format!("{:.2}%", snapshot.mem_load_included * 100.0),
            cpu_load = %format!("{:.2}%", snapshot.cl_cpu_load_included * 100.0),
            "cluster state"
        );

        if self.ctx.config.parameters.only_on_master.is_on() && !self.is_master(&snapshot) {
            info!(
                hostname = self.hostname.as_deref().unwrap_or("<unknown>"),
                master = %snapshot.master_node,
                "this host is not the cluster master, waiting"
            );
            sleep(IDLE_SLEEP).await;
            return Ok(IterationOutcome::NotMaster);
        }

        snapshot.verify_cluster_load(&self.ctx.config.parameters)?;

        sample_cpu_trends(&mut snapshot, &self.hypervisor).await;
        let risk = evaluate(&snapshot, &self.ctx.config.balancing);
        let detection = detect(&mut snapshot, &mut self.ctx);

        if !(detection.balance_needed || risk.any()) {
            self.ctx.calm_iterations += 1;
            info!("cluster balanced, sleeping");
            sleep(IDLE_SLEEP).await;
            return Ok(IterationOutcome::Balanced);
        }

        self.ctx.calm_iterations = 0;
        let variants = plan(&snapshot, &self.ctx, detection.sum_of_deviations);

        if variants.is_empty() {
            info!("no variants found, waiting before next attempt");
            sleep(NO_VARIANTS_SLEEP).await;
            return Ok(IterationOutcome::NoVariants);
        }

        if !snapshot.quorate {
            warn!("cluster is not quorate, refusing to execute migrations");
            sleep(NO_VARIANTS_SLEEP).await;
            return Ok(IterationOutcome::QuorumLost);
        }

        let report = execute_batch(
            &self.hypervisor,
            &self.notifier,
            &self.ctx.config.parameters,
            &variants,
        )
        .await?;

        info!("post-migration pause for cluster re-evaluation");
        sleep(REMEASURE_DELAY).await;
        sample_cpu_trends(&mut snapshot, &self.hypervisor).await;
        let risk_after = evaluate(&snapshot, &self.ctx.config.balancing);
        if risk_after.any() {
            info!(migrated = ?report.migrated, "risk still high after migration");
        } else {
            info!(migrated = ?report.migrated, "situation improved after migration");
        }

        Ok(IterationOutcome::Executed)
    }

    fn is_master(&self, snapshot: &Snapshot) -> bool {
        match self.hostname.as_deref() {
            Some(hostname) => hostname == snapshot.master_node,
            None => {
                warn!("local hostname unavailable, deferring to the master gate");
                false
            }
        }
    }

    /// The persistent engine context, for inspection after iterations.
    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// The hypervisor gateway backing this balancer.
    #[must_use]
    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }
}
