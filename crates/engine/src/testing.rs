// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: an in-memory [`Hypervisor`] with scriptable behavior, a
//! recording [`Notifier`], and configuration shorthands. Shared by the unit
//! tests of this crate and by downstream integration tests.

use crate::gateway::{
    ClusterStatus, GatewayError, GuestKind, GuestRecord, GuestStatus, HaStatus, Hypervisor,
    NodeRecord, Preflight, ResourceRecord,
};
use crate::notify::Notifier;
use async_trait::async_trait;
use pvelb_config::{BalancingConfig, Config, Parameters, Toggle};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A minimal valid configuration document used as the base of most tests.
/// Appending top-level sections (`groups:`, `exclusions:`) stays valid YAML.
#[must_use]
pub fn config_yaml() -> &'static str {
    r#"proxmox:
  url: { ip: "10.0.0.2", port: 8006 }
  auth: { username: "root@pam", password: "secret" }
parameters:
  deviation: 10
  threshold: 85
balancing:
  weight_ram: 1.0
  weight_cpu: 1.0
  memory_oom_threshold: 90
  cpu_threshold: 95
"#
}

/// Parses [`config_yaml`] into a [`Config`].
///
/// # Panics
/// Panics when the document does not validate; test-only code.
#[must_use]
pub fn config() -> Config {
    Config::from_yaml(config_yaml()).expect("test configuration must be valid")
}

/// The [`Parameters`] section of the test configuration.
#[must_use]
pub fn parameters() -> Parameters {
    config().parameters
}

/// The [`BalancingConfig`] section of the test configuration.
#[must_use]
pub fn balancing() -> BalancingConfig {
    config().balancing
}

/// An [`crate::context::EngineContext`] over the base test configuration with
/// a fixed seed.
///
/// # Panics
/// Panics when the test configuration does not validate.
#[must_use]
pub fn context() -> crate::context::EngineContext {
    context_from(config_yaml())
}

/// An engine context parsed from the given YAML document, with a fixed seed.
///
/// # Panics
/// Panics when the document does not validate; test-only code.
#[must_use]
pub fn context_from(yaml: &str) -> crate::context::EngineContext {
    let config = Config::from_yaml(yaml).expect("test configuration must be valid");
    crate::context::EngineContext::with_seed(config, 42)
        .expect("test configuration must normalize")
}

/// A context whose calm-iteration counter is pre-set.
///
/// # Panics
/// Panics when the test configuration does not validate.
#[must_use]
pub fn context_with_calm(calm_iterations: u32) -> crate::context::EngineContext {
    let mut ctx = context();
    ctx.calm_iterations = calm_iterations;
    ctx
}

/// Parameters with test mode switched on.
#[must_use]
pub fn test_mode_parameters() -> Parameters {
    let mut parameters = parameters();
    parameters.test_mode = Toggle::On;
    parameters
}

#[derive(Debug)]
struct PendingVisibility {
    polls_left: u32,
}

#[derive(Debug, Default)]
struct Inner {
    cluster_name: String,
    master: String,
    quorate: bool,
    nodes: Vec<NodeRecord>,
    guests: Vec<GuestRecord>,
    series: HashMap<u32, Vec<f64>>,
    preflight: HashMap<u32, Preflight>,
    preflight_errors: HashSet<u32>,
    failing_submits: u32,
    status_error: bool,
    polls_before_visible: u32,
    bad_state_guests: HashSet<u32>,
    pending: HashMap<u32, PendingVisibility>,
    submitted: Vec<(String, String, u32)>,
    resumed: Vec<u32>,
}

/// In-memory hypervisor double with scriptable failure modes.
///
/// Construction is builder-style (`with_*`), runtime observation goes through
/// the `submitted` / `resumed` accessors.
#[derive(Debug)]
pub struct FakeHypervisor {
    inner: Mutex<Inner>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    /// An empty, quorate cluster named `testcluster`.
    #[must_use]
    pub fn new() -> Self {
        FakeHypervisor {
            inner: Mutex::new(Inner {
                cluster_name: "testcluster".to_string(),
                quorate: true,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake hypervisor lock poisoned")
    }

    /// Adds an online node. The first node added becomes the master unless
    /// [`FakeHypervisor::with_master`] overrides it.
    #[must_use]
    pub fn with_node(
        self,
        node_id: &str,
        max_cpu: u32,
        cpu_fraction: f64,
        max_mem: u64,
        used_mem: u64,
    ) -> Self {
        {
            let mut inner = self.lock();
            if inner.master.is_empty() {
                inner.master = node_id.to_string();
            }
            inner.nodes.push(NodeRecord {
                node_id: node_id.to_string(),
                online: true,
                max_cpu,
                cpu_fraction,
                max_mem,
                used_mem,
            });
        }
        self
    }

    /// Adds a running full virtual machine.
    #[must_use]
    pub fn with_vm(self, vmid: u32, node_id: &str, mem: u64) -> Self {
        self.with_guest(vmid, GuestKind::FullVm, node_id, mem, true)
    }

    /// Adds a stopped full virtual machine.
    #[must_use]
    pub fn with_stopped_vm(self, vmid: u32, node_id: &str, mem: u64) -> Self {
        self.with_guest(vmid, GuestKind::FullVm, node_id, mem, false)
    }

    /// Adds a running container.
    #[must_use]
    pub fn with_container(self, vmid: u32, node_id: &str, mem: u64) -> Self {
        self.with_guest(vmid, GuestKind::Container, node_id, mem, true)
    }

    fn with_guest(self, vmid: u32, kind: GuestKind, node_id: &str, mem: u64, running: bool) -> Self {
        self.lock().guests.push(GuestRecord {
            vmid,
            kind,
            node_id: node_id.to_string(),
            mem,
            running,
        });
        self
    }

    /// Declares the HA master node.
    #[must_use]
    pub fn with_master(self, node_id: &str) -> Self {
        self.lock().master = node_id.to_string();
        self
    }

    /// Drops cluster quorum.
    #[must_use]
    pub fn without_quorum(self) -> Self {
        self.lock().quorate = false;
        self
    }

    /// Sets the hourly CPU series of a guest.
    #[must_use]
    pub fn with_cpu_series(self, vmid: u32, samples: &[f64]) -> Self {
        let _ = self.lock().series.insert(vmid, samples.to_vec());
        self
    }

    /// Scripts the preflight answer for a full virtual machine.
    #[must_use]
    pub fn with_preflight(self, vmid: u32, local_disks: bool, local_resources: bool) -> Self {
        let _ = self.lock().preflight.insert(
            vmid,
            Preflight {
                local_disks,
                local_resources,
            },
        );
        self
    }

    /// Makes the preflight query for a guest fail.
    #[must_use]
    pub fn with_preflight_error(self, vmid: u32) -> Self {
        let _ = self.lock().preflight_errors.insert(vmid);
        self
    }

    /// Makes the next `count` migration submissions fail with a 500.
    #[must_use]
    pub fn with_failing_submits(self, count: u32) -> Self {
        self.lock().failing_submits = count;
        self
    }

    /// Makes every control endpoint fail, as an unreachable cluster would.
    #[must_use]
    pub fn with_status_error(self) -> Self {
        self.lock().status_error = true;
        self
    }

    /// Migrated guests stay invisible on the recipient for this many polls.
    #[must_use]
    pub fn with_polls_before_visible(self, polls: u32) -> Self {
        self.lock().polls_before_visible = polls;
        self
    }

    /// The given guest lands on its recipient in a non-running state.
    #[must_use]
    pub fn with_bad_state_after_migration(self, vmid: u32) -> Self {
        let _ = self.lock().bad_state_guests.insert(vmid);
        self
    }

    /// The migrations submitted so far, as `(donor, target, vmid)`.
    #[must_use]
    pub fn submitted(&self) -> Vec<(String, String, u32)> {
        self.lock().submitted.clone()
    }

    /// The guests resumed so far.
    #[must_use]
    pub fn resumed(&self) -> Vec<u32> {
        self.lock().resumed.clone()
    }
}

fn unavailable(endpoint: &str) -> GatewayError {
    GatewayError::Status {
        endpoint: endpoint.to_string(),
        status: 500,
        details: "scripted failure".to_string(),
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn cluster_status(&self) -> Result<ClusterStatus, GatewayError> {
        let inner = self.lock();
        if inner.status_error {
            return Err(unavailable("/cluster/status"));
        }
        Ok(ClusterStatus {
            name: inner.cluster_name.clone(),
            nodes: inner.nodes.len() as u32,
        })
    }

    async fn cluster_resources(&self) -> Result<Vec<ResourceRecord>, GatewayError> {
        let inner = self.lock();
        if inner.status_error {
            return Err(unavailable("/cluster/resources"));
        }
        let mut records: Vec<ResourceRecord> = inner
            .nodes
            .iter()
            .cloned()
            .map(ResourceRecord::Node)
            .collect();
        records.extend(inner.guests.iter().cloned().map(ResourceRecord::Guest));
        Ok(records)
    }

    async fn ha_status(&self) -> Result<HaStatus, GatewayError> {
        let inner = self.lock();
        if inner.status_error {
            return Err(unavailable("/cluster/ha/status/manager_status"));
        }
        Ok(HaStatus {
            master_node: inner.master.clone(),
            quorate: inner.quorate,
        })
    }

    async fn guest_cpu_series(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<f64>, GatewayError> {
        Ok(self.lock().series.get(&vmid).cloned().unwrap_or_default())
    }

    async fn migration_preflight(
        &self,
        _node: &str,
        vmid: u32,
    ) -> Result<Preflight, GatewayError> {
        let inner = self.lock();
        if inner.preflight_errors.contains(&vmid) {
            return Err(unavailable("/nodes/_/qemu/_/migrate"));
        }
        Ok(inner.preflight.get(&vmid).cloned().unwrap_or_default())
    }

    async fn migrate(
        &self,
        donor: &str,
        _kind: GuestKind,
        vmid: u32,
        target: &str,
    ) -> Result<String, GatewayError> {
        let mut inner = self.lock();
        if inner.failing_submits > 0 {
            inner.failing_submits -= 1;
            return Err(unavailable("/nodes/_/qemu/_/migrate"));
        }
        inner
            .submitted
            .push((donor.to_string(), target.to_string(), vmid));
        let polls_left = inner.polls_before_visible;
        let _ = inner.pending.insert(vmid, PendingVisibility { polls_left });
        if let Some(guest) = inner.guests.iter_mut().find(|g| g.vmid == vmid) {
            guest.node_id = target.to_string();
        }
        Ok(format!("UPID:{donor}:{vmid}:migrate"))
    }

    async fn guests_on(
        &self,
        node: &str,
        kind: GuestKind,
    ) -> Result<Vec<GuestStatus>, GatewayError> {
        let mut inner = self.lock();
        let mut visible = Vec::new();
        let mut hidden: HashSet<u32> = HashSet::new();
        for (vmid, pending) in &mut inner.pending {
            if pending.polls_left > 0 {
                pending.polls_left -= 1;
                let _ = hidden.insert(*vmid);
            }
        }
        for guest in &inner.guests {
            if guest.node_id == node && guest.kind == kind && !hidden.contains(&guest.vmid) {
                visible.push(GuestStatus {
                    vmid: guest.vmid,
                    running: !inner.bad_state_guests.contains(&guest.vmid),
                });
            }
        }
        Ok(visible)
    }

    async fn resume(&self, _node: &str, vmid: u32) -> Result<(), GatewayError> {
        self.lock().resumed.push(vmid);
        Ok(())
    }
}

/// A [`Notifier`] that records every message it is asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The messages recorded so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("notifier lock poisoned")
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock poisoned")
            .push(message.to_string());
    }
}
